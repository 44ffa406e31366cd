use crate::error::SimError;

/// Width of the state images in pixels
pub const STATE_WIDTH: u32 = 600;
/// Height of the state images in pixels
pub const STATE_HEIGHT: u32 = 600;
/// Fixed simulation time step handed to the update kernel
pub const TIME_STEP: f32 = 0.00001;
/// Number of frames between two diagnostic samples
pub const DIAGNOSTIC_PERIOD: u64 = 1200;
/// Pixel observed by diagnostics
pub const DIAGNOSTIC_PIXEL: (u32, u32) = (300, 300);

/// The parameters controlling a simulation run
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationConfig {
    pub width: u32,
    pub height: u32,
    /// Time step passed to the update kernel each frame
    pub time_step: f32,
    /// Sample the diagnostic pixel every this many frames. 0 disables sampling.
    pub diagnostic_period: u64,
    pub diagnostic_x: u32,
    pub diagnostic_y: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            width: STATE_WIDTH,
            height: STATE_HEIGHT,
            time_step: TIME_STEP,
            diagnostic_period: DIAGNOSTIC_PERIOD,
            diagnostic_x: DIAGNOSTIC_PIXEL.0,
            diagnostic_y: DIAGNOSTIC_PIXEL.1,
        }
    }
}

impl SimulationConfig {
    /// A config for a `width` x `height` image with default timing and the
    /// diagnostic pixel at the origin.
    pub fn with_size(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            diagnostic_x: 0,
            diagnostic_y: 0,
            ..Self::default()
        }
    }

    /// Checks the configuration once, before any device work happens.
    pub fn validate(&self) -> Result<(), SimError> {
        if self.width == 0 || self.height == 0 {
            return Err(SimError::Allocation {
                width: self.width,
                height: self.height,
                reason: "state images must have a non-zero size".into(),
            });
        }
        if self.diagnostic_period > 0
            && (self.diagnostic_x >= self.width || self.diagnostic_y >= self.height)
        {
            return Err(SimError::Index {
                x: self.diagnostic_x,
                y: self.diagnostic_y,
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SimulationConfig::default();
        assert_eq!((config.width, config.height), (600, 600));
        assert_eq!(config.diagnostic_period, 1200);
        config.validate().unwrap();
    }

    #[test]
    fn diagnostic_pixel_out_of_range() {
        let config = SimulationConfig {
            diagnostic_x: 600,
            ..SimulationConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SimError::Index { x: 600, y: 300, .. })
        ));
    }

    #[test]
    fn disabled_diagnostics_skip_the_range_check() {
        let config = SimulationConfig {
            diagnostic_period: 0,
            diagnostic_x: 10_000,
            ..SimulationConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn zero_sized_image_is_rejected() {
        let config = SimulationConfig::with_size(0, 4);
        assert!(matches!(
            config.validate(),
            Err(SimError::Allocation { width: 0, .. })
        ));
    }
}
