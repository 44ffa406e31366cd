use crate::{error::SimError, sim::GraphicsContext};

/// Scalar inputs rebound before every kernel invocation
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Scalars {
    /// Fixed simulation time step
    pub time_step: f32,
    /// Index of the frame being computed, starting at 0
    pub frame: u64,
}

/// Named inputs for one kernel invocation
pub struct Bindings<'a, C: GraphicsContext> {
    /// The state image sampled as input
    pub state: &'a C::Image,
    pub scalars: Scalars,
}

/// Where a kernel writes its output
pub enum KernelTarget<'a, C: GraphicsContext> {
    /// The offscreen render target of a state image
    Image(&'a mut C::Image),
    /// The visible surface
    Surface(&'a mut C::Surface),
}

/// An opaque program run over the full-screen quad.
///
/// Every invocation overwrites every pixel of the target; nothing is blended
/// with or kept from the target's previous contents. Build failures are
/// reported by the backend's constructor as [`SimError::Compile`]; an
/// invocation only fails when the device itself does.
pub trait Kernel<C: GraphicsContext> {
    fn name(&self) -> &str;

    fn invoke(
        &mut self,
        ctx: &C,
        target: KernelTarget<'_, C>,
        bindings: &Bindings<'_, C>,
    ) -> Result<(), SimError>;
}
