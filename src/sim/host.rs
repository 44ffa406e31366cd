//! Host-memory backend
//!
//! Runs kernels as Rust closures over [`StateFrame`]s on the CPU. Useful for
//! headless runs and for exercising the loop's allocation, build and device
//! failure paths without a GPU.

use std::cell::{Cell, RefCell};

use rayon::iter::{
    IndexedParallelIterator, IntoParallelRefIterator, IntoParallelRefMutIterator, ParallelIterator,
};

use crate::{
    error::SimError,
    sim::{
        GraphicsContext, PixelState, StateFrame,
        kernel::{Bindings, Kernel, KernelTarget, Scalars},
    },
};

/// Fill value for freshly allocated images, so a pixel that was never written
/// is easy to spot.
pub const UNWRITTEN: PixelState = PixelState::splat(f32::NAN);

pub struct HostContext {
    surface_width: u32,
    surface_height: u32,
    max_dimension: u32,
    reject_programs: bool,
    device_lost: Cell<bool>,
    presented: RefCell<Option<StateFrame>>,
    presents: Cell<u64>,
}

impl HostContext {
    /// A context whose visible surface is `surface_width` x `surface_height`.
    pub fn new(surface_width: u32, surface_height: u32) -> Self {
        Self {
            surface_width,
            surface_height,
            max_dimension: 8192,
            reject_programs: false,
            device_lost: Cell::new(false),
            presented: RefCell::new(None),
            presents: Cell::new(0),
        }
    }

    /// Refuse images wider or taller than `max_dimension`.
    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension;
        self
    }

    /// Fail every kernel build.
    pub fn rejecting_programs(mut self) -> Self {
        self.reject_programs = true;
        self
    }

    /// Simulate a lost device: every later upload, invocation, acquire and
    /// readback fails.
    pub fn lose_device(&self) {
        self.device_lost.set(true);
    }

    /// The most recently presented surface contents.
    pub fn last_presented(&self) -> Option<StateFrame> {
        self.presented.borrow().clone()
    }

    pub fn present_count(&self) -> u64 {
        self.presents.get()
    }

    fn check_device(&self, operation: &'static str) -> Result<(), SimError> {
        if self.device_lost.get() {
            return Err(SimError::device(operation, "device lost"));
        }
        Ok(())
    }
}

impl GraphicsContext for HostContext {
    type Image = StateFrame;
    type Surface = StateFrame;

    fn create_state_image(
        &self,
        label: &str,
        width: u32,
        height: u32,
    ) -> Result<StateFrame, SimError> {
        if width == 0 || height == 0 || width > self.max_dimension || height > self.max_dimension
        {
            return Err(SimError::Allocation {
                width,
                height,
                reason: format!(
                    "{label}: size must be between 1 and {} per side",
                    self.max_dimension
                ),
            });
        }
        Ok(StateFrame::filled(width, height, UNWRITTEN))
    }

    fn write_image(&self, image: &mut StateFrame, pixels: &[PixelState]) -> Result<(), SimError> {
        self.check_device("state upload")?;
        if pixels.len() != image.pixels.len() {
            return Err(SimError::device(
                "state upload",
                format!(
                    "expected {} pixels, got {}",
                    image.pixels.len(),
                    pixels.len()
                ),
            ));
        }
        image.pixels.copy_from_slice(pixels);
        Ok(())
    }

    fn read_image(&self, image: &StateFrame) -> Result<StateFrame, SimError> {
        self.check_device("readback")?;
        Ok(image.clone())
    }

    fn acquire_surface(&self) -> Result<StateFrame, SimError> {
        self.check_device("surface acquire")?;
        Ok(StateFrame::filled(
            self.surface_width,
            self.surface_height,
            UNWRITTEN,
        ))
    }

    fn present(&self, surface: StateFrame) {
        *self.presented.borrow_mut() = Some(surface);
        self.presents.set(self.presents.get() + 1);
    }
}

type Program = Box<dyn Fn(PixelState, Scalars) -> PixelState + Send + Sync>;

/// A kernel whose program is a per-pixel function of the input pixel at the
/// same coordinates and the frame's scalars.
pub struct HostKernel {
    name: String,
    program: Program,
}

impl HostKernel {
    pub fn build<F>(ctx: &HostContext, name: &str, program: F) -> Result<Self, SimError>
    where
        F: Fn(PixelState, Scalars) -> PixelState + Send + Sync + 'static,
    {
        if ctx.reject_programs {
            return Err(SimError::Compile {
                kernel: name.to_string(),
                reason: "program rejected by context".into(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            program: Box::new(program),
        })
    }

    /// Copies its input unchanged.
    pub fn identity(ctx: &HostContext, name: &str) -> Result<Self, SimError> {
        Self::build(ctx, name, |state, _| state)
    }
}

impl Kernel<HostContext> for HostKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(
        &mut self,
        ctx: &HostContext,
        target: KernelTarget<'_, HostContext>,
        bindings: &Bindings<'_, HostContext>,
    ) -> Result<(), SimError> {
        ctx.check_device("kernel invocation")?;
        let target = match target {
            KernelTarget::Image(image) => image,
            KernelTarget::Surface(surface) => surface,
        };
        let source = bindings.state;
        if (source.width, source.height) != (target.width, target.height) {
            return Err(SimError::device(
                "kernel invocation",
                format!(
                    "{} kernel: {}x{} input does not match {}x{} target",
                    self.name, source.width, source.height, target.width, target.height
                ),
            ));
        }
        let scalars = bindings.scalars;
        let program = &self.program;
        target
            .pixels
            .par_iter_mut()
            .zip(source.pixels.par_iter())
            .for_each(|(out, state)| *out = program(*state, scalars));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::BufferPair;

    #[test]
    fn oversized_images_fail_allocation() {
        let ctx = HostContext::new(16, 16).with_max_dimension(8);
        let result = BufferPair::create(&ctx, 16, 4);
        assert!(matches!(
            result,
            Err(SimError::Allocation {
                width: 16,
                height: 4,
                ..
            })
        ));
    }

    #[test]
    fn rejected_programs_fail_to_build() {
        let ctx = HostContext::new(4, 4).rejecting_programs();
        let result = HostKernel::identity(&ctx, "update");
        assert!(matches!(result, Err(SimError::Compile { kernel, .. }) if kernel == "update"));
    }

    #[test]
    fn invocation_overwrites_every_pixel() {
        let ctx = HostContext::new(3, 2);
        let source = StateFrame::initial(3, 2);
        let mut target = ctx.create_state_image("target", 3, 2).unwrap();
        let mut kernel = HostKernel::build(&ctx, "double", |s, _| {
            PixelState::new(s.x * 2.0, s.y * 2.0, s.vx, s.vy)
        })
        .unwrap();
        let bindings = Bindings {
            state: &source,
            scalars: Scalars {
                time_step: 0.1,
                frame: 0,
            },
        };
        kernel
            .invoke(&ctx, KernelTarget::Image(&mut target), &bindings)
            .unwrap();
        for (out, state) in target.pixels.iter().zip(&source.pixels) {
            assert_eq!(out.x, state.x * 2.0);
            assert_eq!(out.y, state.y * 2.0);
        }
    }

    #[test]
    fn lost_device_fails_invocation() {
        let ctx = HostContext::new(2, 2);
        let source = StateFrame::initial(2, 2);
        let mut target = ctx.create_state_image("target", 2, 2).unwrap();
        let mut kernel = HostKernel::identity(&ctx, "update").unwrap();
        ctx.lose_device();
        let bindings = Bindings {
            state: &source,
            scalars: Scalars {
                time_step: 0.0,
                frame: 0,
            },
        };
        let result = kernel.invoke(&ctx, KernelTarget::Image(&mut target), &bindings);
        assert!(matches!(result, Err(SimError::Device { .. })));
        assert!(ctx.read_image(&target).is_err());
    }
}
