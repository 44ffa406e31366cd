use crate::{
    config::SimulationConfig,
    error::SimError,
    sim::{
        BufferPair, GraphicsContext, Slot,
        diagnostics::{DiagnosticSink, Diagnostics},
        kernel::{Bindings, Kernel, KernelTarget, Scalars},
    },
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopped,
}

/// Source of the external quit signal, checked once at the start of each tick
pub trait EventSource {
    fn quit_requested(&mut self) -> bool;
}

/// Never asks to quit
pub struct NoEvents;

impl EventSource for NoEvents {
    fn quit_requested(&mut self) -> bool {
        false
    }
}

/// Drives the update and render kernels against a [`BufferPair`], one tick
/// per displayed frame.
pub struct SimulationLoop<C: GraphicsContext, U, R> {
    ctx: C,
    buffers: BufferPair<C>,
    update: U,
    render: R,
    diagnostics: Diagnostics,
    time_step: f32,
    frame: u64,
    state: LoopState,
}

impl<C, U, R> SimulationLoop<C, U, R>
where
    C: GraphicsContext,
    U: Kernel<C>,
    R: Kernel<C>,
{
    /// Allocates and initializes the state images and enters `Running`.
    pub fn new(ctx: C, config: &SimulationConfig, update: U, render: R) -> Result<Self, SimError> {
        config.validate()?;
        let mut buffers = BufferPair::create(&ctx, config.width, config.height)?;
        buffers.initialize(&ctx)?;
        let origin = buffers.readback(&ctx, Slot::First)?.pixel(0, 0)?;
        log::debug!("initial state at (0, 0): {origin:?}");
        log::info!(
            "simulation ready: {}x{} state, update kernel `{}`, render kernel `{}`",
            config.width,
            config.height,
            update.name(),
            render.name()
        );
        Ok(Self {
            ctx,
            buffers,
            update,
            render,
            diagnostics: Diagnostics::new(
                config.diagnostic_period,
                config.diagnostic_x,
                config.diagnostic_y,
            ),
            time_step: config.time_step,
            frame: 0,
            state: LoopState::Running,
        })
    }

    pub fn with_diagnostic_sink(mut self, sink: impl DiagnosticSink + 'static) -> Self {
        self.diagnostics.set_sink(Box::new(sink));
        self
    }

    /// Runs one tick.
    ///
    /// Returns the state after the tick. A quit signal stops the loop without
    /// touching the buffers; any device failure stops it and is returned.
    pub fn tick(&mut self, events: &mut impl EventSource) -> Result<LoopState, SimError> {
        if self.state == LoopState::Stopped {
            return Ok(LoopState::Stopped);
        }
        if events.quit_requested() {
            log::info!("quit requested after {} frames", self.frame);
            self.state = LoopState::Stopped;
            return Ok(LoopState::Stopped);
        }
        if let Err(e) = self.advance() {
            log::error!("stopping at frame {}: {e}", self.frame);
            self.state = LoopState::Stopped;
            return Err(e);
        }
        Ok(LoopState::Running)
    }

    /// Ticks until the loop stops, returning the number of frames simulated.
    pub fn run(&mut self, events: &mut impl EventSource) -> Result<u64, SimError> {
        while self.tick(events)? == LoopState::Running {}
        Ok(self.frame)
    }

    fn advance(&mut self) -> Result<(), SimError> {
        let scalars = Scalars {
            time_step: self.time_step,
            frame: self.frame,
        };

        let (state, target) = self.buffers.update_io();
        self.update.invoke(
            &self.ctx,
            KernelTarget::Image(target),
            &Bindings { state, scalars },
        )?;

        self.buffers.flip();

        let mut surface = self.ctx.acquire_surface()?;
        self.render.invoke(
            &self.ctx,
            KernelTarget::Surface(&mut surface),
            &Bindings {
                state: self.buffers.front(),
                scalars,
            },
        )?;
        self.ctx.present(surface);

        self.diagnostics
            .observe(&self.ctx, &self.buffers, self.frame)?;
        self.frame += 1;
        Ok(())
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Number of frames completed so far
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn buffers(&self) -> &BufferPair<C> {
        &self.buffers
    }

    pub fn context(&self) -> &C {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{
        PixelState,
        host::{HostContext, HostKernel},
    };

    struct QuitAfter(u32);

    impl EventSource for QuitAfter {
        fn quit_requested(&mut self) -> bool {
            if self.0 == 0 {
                return true;
            }
            self.0 -= 1;
            false
        }
    }

    fn counting_loop(size: u32) -> SimulationLoop<HostContext, HostKernel, HostKernel> {
        let ctx = HostContext::new(size, size);
        let update = HostKernel::build(&ctx, "count", |s, _| {
            PixelState::new(s.x, s.y, s.vx + 1.0, s.vy)
        })
        .unwrap();
        let render = HostKernel::identity(&ctx, "render").unwrap();
        let config = SimulationConfig {
            diagnostic_period: 0,
            ..SimulationConfig::with_size(size, size)
        };
        SimulationLoop::new(ctx, &config, update, render).unwrap()
    }

    #[test]
    fn quit_stops_before_any_work() {
        let mut sim = counting_loop(2);
        assert_eq!(sim.state(), LoopState::Running);
        assert_eq!(sim.tick(&mut QuitAfter(0)).unwrap(), LoopState::Stopped);
        assert_eq!(sim.frame(), 0);
        assert_eq!(sim.context().present_count(), 0);
        assert_eq!(sim.buffers().front_slot(), Slot::First);
    }

    #[test]
    fn run_until_quit() {
        let mut sim = counting_loop(2);
        assert_eq!(sim.run(&mut QuitAfter(5)).unwrap(), 5);
        assert_eq!(sim.state(), LoopState::Stopped);
        assert_eq!(sim.context().present_count(), 5);
        let front = sim
            .buffers()
            .readback(sim.context(), sim.buffers().front_slot())
            .unwrap();
        assert!(front.pixels.iter().all(|p| p.vx == 5.0));
        // a stopped loop stays stopped
        assert_eq!(sim.tick(&mut NoEvents).unwrap(), LoopState::Stopped);
        assert_eq!(sim.frame(), 5);
    }

    #[test]
    fn roles_alternate_every_frame() {
        let mut sim = counting_loop(2);
        let mut slots = Vec::new();
        for _ in 0..4 {
            sim.tick(&mut NoEvents).unwrap();
            slots.push(sim.buffers().front_slot());
        }
        assert_eq!(
            slots,
            vec![Slot::Second, Slot::First, Slot::Second, Slot::First]
        );
    }

    #[test]
    fn device_loss_stops_the_loop() {
        let mut sim = counting_loop(2);
        sim.tick(&mut NoEvents).unwrap();
        sim.context().lose_device();
        assert!(matches!(
            sim.tick(&mut NoEvents),
            Err(SimError::Device { .. })
        ));
        assert_eq!(sim.state(), LoopState::Stopped);
        assert_eq!(sim.frame(), 1);
    }
}
