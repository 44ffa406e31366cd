use thiserror::Error;

/// Failures raised by the simulation core.
///
/// Every variant is fatal where it occurs; nothing in the crate retries.
#[derive(Debug, Error)]
pub enum SimError {
    /// A state image or its render target could not be created.
    #[error("could not allocate {width}x{height} state image: {reason}")]
    Allocation {
        width: u32,
        height: u32,
        reason: String,
    },
    /// A kernel program failed to build or link.
    #[error("could not build {kernel} kernel: {reason}")]
    Compile { kernel: String, reason: String },
    /// A pixel coordinate outside the state image.
    #[error("pixel ({x}, {y}) is outside the {width}x{height} state image")]
    Index {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    /// A per-frame invocation, present or readback failed.
    #[error("device failure during {operation}: {reason}")]
    Device {
        operation: &'static str,
        reason: String,
    },
}

impl SimError {
    pub(crate) fn device(operation: &'static str, reason: impl ToString) -> Self {
        SimError::Device {
            operation,
            reason: reason.to_string(),
        }
    }
}
