//! In-memory playback source

use tracing::debug;

use crate::error::{Error, Result};
use crate::source::{Calibration, DepthSample, DepthSource, SourceParams};

#[derive(Debug, Clone)]
pub struct RecordedFrame<T> {
    pub depth: Vec<T>,
    pub timestamp: u64,
}

/// Depth source replaying frames held in memory.
///
/// Unlike a live source it can seek: frame indices are positions in the
/// recording, starting at 0 for the first frame.
pub struct RecordedDepthSource<T: DepthSample> {
    frames: Vec<RecordedFrame<T>>,
    calibration: Calibration,
    scale_to_meters: f32,
    frame: u32,
    initialized: bool,
}

impl<T: DepthSample> RecordedDepthSource<T> {
    pub fn new(frames: Vec<RecordedFrame<T>>) -> Self {
        Self {
            frames,
            calibration: Calibration::default(),
            scale_to_meters: 1.0,
            frame: 0,
            initialized: false,
        }
    }

    /// Capture `count` frames from another source. The recording inherits
    /// the source's calibration and is ready to replay.
    pub fn record<S>(source: &mut S, count: usize) -> Result<Self>
    where
        S: DepthSource<Sample = T>,
    {
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            source.advance()?;
            let depth = source.depth().ok_or(Error::NotInitialized)?.to_vec();
            let timestamp = source.depth_time().ok_or(Error::NotInitialized)?;
            frames.push(RecordedFrame { depth, timestamp });
        }
        debug!(frames = frames.len(), "Recorded depth frames");

        Ok(Self {
            frames,
            calibration: *source.calibration(),
            scale_to_meters: source.scale_to_meters(),
            frame: 0,
            initialized: true,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn current(&self) -> Option<&RecordedFrame<T>> {
        if !self.initialized {
            return None;
        }
        self.frames.get(self.frame as usize)
    }
}

impl<T: DepthSample> DepthSource for RecordedDepthSource<T> {
    type Sample = T;

    fn initialize(&mut self, params: SourceParams) -> Result<()> {
        let calibration = Calibration::from_params(&params);
        let expected = calibration.pixel_count();

        if let Some(bad) = self.frames.iter().find(|f| f.depth.len() != expected) {
            let sample = std::mem::size_of::<T>();
            return Err(Error::SizeMismatch {
                expected: expected * sample,
                actual: bad.depth.len() * sample,
            });
        }

        self.calibration = calibration;
        self.scale_to_meters = params.scale_to_meters;
        self.frame = 0;
        self.initialized = true;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    fn frame(&self) -> u32 {
        self.frame
    }

    fn advance(&mut self) -> Result<()> {
        self.set_frame(self.frame + 1)
    }

    fn set_frame(&mut self, frame: u32) -> Result<()> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        if frame as usize >= self.frames.len() {
            return Err(Error::FrameOutOfRange {
                requested: frame,
                available: self.frames.len(),
            });
        }
        self.frame = frame;
        Ok(())
    }

    fn depth(&self) -> Option<&[T]> {
        self.current().map(|f| f.depth.as_slice())
    }

    fn depth_time(&self) -> Option<u64> {
        self.current().map(|f| f.timestamp)
    }

    fn scale_to_meters(&self) -> f32 {
        self.scale_to_meters
    }

    fn has_radial_distortion_params(&self) -> bool {
        false
    }

    fn is_live(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Point2;

    fn recording() -> RecordedDepthSource<u16> {
        RecordedDepthSource::new(
            (0..3)
                .map(|i| RecordedFrame {
                    depth: vec![i as u16; 4],
                    timestamp: 100 * i,
                })
                .collect(),
        )
    }

    fn params() -> SourceParams {
        SourceParams {
            depth_width: 2,
            depth_height: 2,
            scale_to_meters: 0.001,
            ..SourceParams::new(Point2::new(1.0, 1.0))
        }
    }

    #[test]
    fn seeks_within_recording() {
        let mut src = recording();
        src.initialize(params()).unwrap();
        assert_eq!(src.depth_time(), Some(0));

        src.set_frame(2).unwrap();
        assert_eq!(src.depth(), Some(&[2u16; 4][..]));
        assert_eq!(src.depth_time(), Some(200));

        src.set_frame(1).unwrap();
        assert_eq!(src.frame(), 1);
        assert!(!src.is_live());
    }

    #[test]
    fn seeking_past_end_fails() {
        let mut src = recording();
        src.initialize(params()).unwrap();
        src.set_frame(2).unwrap();
        assert!(matches!(
            src.advance(),
            Err(Error::FrameOutOfRange { requested: 3, available: 3 })
        ));
        assert_eq!(src.frame(), 2);
    }

    #[test]
    fn mismatched_frame_size_fails_initialize() {
        let mut src = recording();
        let err = src
            .initialize(SourceParams {
                depth_width: 3,
                ..params()
            })
            .unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { expected: 12, actual: 8 }));
        assert!(src.depth().is_none());
    }
}
