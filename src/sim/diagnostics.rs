//! Periodic readback of one pixel's state
//!
//! Sampling forces a blocking copy of the whole front image to host memory,
//! so it only runs every `period` frames and never touches simulation state.

use std::fmt;

use crate::{
    error::SimError,
    sim::{BufferPair, GraphicsContext, PixelState},
};

/// One observed pixel state, tagged with the frame it was read after
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DiagnosticRecord {
    pub frame: u64,
    pub x: u32,
    pub y: u32,
    pub state: PixelState,
}

impl fmt::Display for DiagnosticRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame {}: Pixel ({}, {}) -> x={:.4}, y={:.4}, vx={:.4}, vy={:.4}",
            self.frame, self.x, self.y, self.state.x, self.state.y, self.state.vx, self.state.vy
        )
    }
}

/// Receives diagnostic records
pub trait DiagnosticSink {
    fn emit(&mut self, record: &DiagnosticRecord);
}

/// Writes each record to the log at info level
#[derive(Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn emit(&mut self, record: &DiagnosticRecord) {
        log::info!("{record}");
    }
}

impl DiagnosticSink for Vec<DiagnosticRecord> {
    fn emit(&mut self, record: &DiagnosticRecord) {
        self.push(*record);
    }
}

/// Reads back the front slot of `pair` and extracts pixel (`x`, `y`).
pub fn sample<C: GraphicsContext>(
    ctx: &C,
    pair: &BufferPair<C>,
    x: u32,
    y: u32,
    frame: u64,
) -> Result<DiagnosticRecord, SimError> {
    let (width, height) = pair.dimensions();
    if x >= width || y >= height {
        return Err(SimError::Index {
            x,
            y,
            width,
            height,
        });
    }
    let state = pair.readback(ctx, pair.front_slot())?.pixel(x, y)?;
    Ok(DiagnosticRecord { frame, x, y, state })
}

pub struct Diagnostics {
    period: u64,
    x: u32,
    y: u32,
    sink: Box<dyn DiagnosticSink>,
}

impl Diagnostics {
    /// Samples pixel (`x`, `y`) whenever the frame index is a multiple of
    /// `period`. A period of 0 never samples.
    pub fn new(period: u64, x: u32, y: u32) -> Self {
        Self {
            period,
            x,
            y,
            sink: Box::new(LogSink),
        }
    }

    pub fn set_sink(&mut self, sink: Box<dyn DiagnosticSink>) {
        self.sink = sink;
    }

    pub fn is_due(&self, frame: u64) -> bool {
        self.period != 0 && frame % self.period == 0
    }

    /// Samples and emits a record if `frame` is due.
    pub fn observe<C: GraphicsContext>(
        &mut self,
        ctx: &C,
        pair: &BufferPair<C>,
        frame: u64,
    ) -> Result<Option<DiagnosticRecord>, SimError> {
        if !self.is_due(frame) {
            return Ok(None);
        }
        let record = sample(ctx, pair, self.x, self.y, frame)?;
        self.sink.emit(&record);
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::host::HostContext;

    #[test]
    fn record_line_format() {
        let record = DiagnosticRecord {
            frame: 1200,
            x: 300,
            y: 300,
            state: PixelState::new(0.0, 0.0, -0.25, 1.0),
        };
        assert_eq!(
            record.to_string(),
            "Frame 1200: Pixel (300, 300) -> x=0.0000, y=0.0000, vx=-0.2500, vy=1.0000"
        );
    }

    #[test]
    fn due_only_on_multiples_of_the_period() {
        let diagnostics = Diagnostics::new(1200, 0, 0);
        let due: Vec<u64> = (0..5000).filter(|f| diagnostics.is_due(*f)).collect();
        assert_eq!(due, vec![0, 1200, 2400, 3600, 4800]);
        assert!(!Diagnostics::new(0, 0, 0).is_due(0));
    }

    #[test]
    fn sample_reads_the_front_slot() {
        let ctx = HostContext::new(4, 4);
        let mut pair = BufferPair::create(&ctx, 4, 4).unwrap();
        pair.initialize(&ctx).unwrap();
        let record = sample(&ctx, &pair, 2, 1, 0).unwrap();
        assert_eq!(record.state, PixelState::new(0.0, -0.5, 0.0, 1.0));

        pair.flip();
        let unwritten = sample(&ctx, &pair, 2, 1, 1).unwrap();
        assert!(unwritten.state.x.is_nan());
    }

    #[test]
    fn sample_out_of_range() {
        let ctx = HostContext::new(4, 4);
        let mut pair = BufferPair::create(&ctx, 4, 4).unwrap();
        pair.initialize(&ctx).unwrap();
        assert!(matches!(
            sample(&ctx, &pair, 4, 0, 0),
            Err(SimError::Index { x: 4, .. })
        ));
    }
}
