use std::{sync::Arc, time::SystemTime};

use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{Key, NamedKey},
    window::{WindowAttributes, WindowId},
};

use crate::{
    config::SimulationConfig,
    gpu::{WgpuContext, kernel::GpuKernel},
    sim::driver::{EventSource, LoopState, SimulationLoop},
};

pub mod config;
pub mod error;
pub mod gpu;
pub mod sim;

/// The simulation as run inside the window
pub type GpuSimulation = SimulationLoop<WgpuContext, GpuKernel, GpuKernel>;

/// Quit signal fed by window events
#[derive(Default)]
struct WindowEvents {
    quit: bool,
}

impl EventSource for WindowEvents {
    fn quit_requested(&mut self) -> bool {
        self.quit
    }
}

struct Application {
    config: SimulationConfig,
    simulation: Option<GpuSimulation>,
    events: WindowEvents,
    error: Option<anyhow::Error>,
}

impl Application {
    fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            simulation: None,
            events: WindowEvents::default(),
            error: None,
        }
    }

    fn create_simulation(
        &self,
        event_loop: &ActiveEventLoop,
    ) -> Result<GpuSimulation, anyhow::Error> {
        let window_attrs = WindowAttributes::default()
            .with_title("statesim - ESC to exit")
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height))
            .with_resizable(false);
        let window = Arc::new(event_loop.create_window(window_attrs)?);

        // On native, use pollster to block on the future
        let ctx = pollster::block_on(WgpuContext::new(window))?;
        let update = GpuKernel::update(&ctx)?;
        let render = GpuKernel::render(&ctx)?;
        Ok(SimulationLoop::new(ctx, &self.config, update, render)?)
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        log::error!("{e:#}");
        self.error = Some(e);
        event_loop.exit();
    }
}

impl ApplicationHandler for Application {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.simulation.is_some() {
            return;
        }
        match self.create_simulation(event_loop) {
            Ok(simulation) => {
                log::info!("GPU simulation initialized successfully");
                // Request first redraw to kick off the animation loop
                simulation.context().request_redraw();
                self.simulation = Some(simulation);
            }
            Err(e) => self.fail(event_loop, e),
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested
            | WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key: Key::Named(NamedKey::Escape),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => {
                self.events.quit = true;
                // The next tick observes the quit signal
                match &self.simulation {
                    Some(simulation) => simulation.context().request_redraw(),
                    None => event_loop.exit(),
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(simulation) = self.simulation.as_mut() {
                    simulation.context_mut().resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                let Some(simulation) = self.simulation.as_mut() else {
                    return;
                };
                match simulation.tick(&mut self.events) {
                    Ok(LoopState::Running) => simulation.context().request_redraw(),
                    Ok(LoopState::Stopped) => {
                        log::info!("simulation stopped after {} frames", simulation.frame());
                        event_loop.exit();
                    }
                    Err(e) => self.fail(event_loop, e.into()),
                }
            }
            _ => (),
        }
    }
}

/// Installs the process logger: timestamped lines on stdout.
pub fn init_logging() -> Result<(), log::SetLoggerError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Debug)
        .level_for("wgpu_core", log::LevelFilter::Warn)
        .level_for("wgpu_hal", log::LevelFilter::Warn)
        .level_for("naga", log::LevelFilter::Warn)
        .chain(std::io::stdout())
        .apply()
}

/// Open a window and run the simulation until it is closed.
///
/// Returns the first fatal error: window or device creation, a kernel build,
/// state allocation, or a per-frame device failure.
pub fn start(config: SimulationConfig) -> Result<(), anyhow::Error> {
    log::info!("Starting state simulation with GPU rendering");

    let event_loop = EventLoop::new()?;
    let mut app = Application::new(config);
    event_loop.run_app(&mut app)?;

    match app.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_logger_install_is_reported() {
        let _ = init_logging();
        assert!(init_logging().is_err());
    }
}
