//! Depth sources: the capability set shared by live devices and playback

pub mod live;
pub mod recorded;

pub use live::{ColorImage, LiveDepthSource, LiveSourceOptions};
pub use recorded::RecordedDepthSource;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::utils;

/// On-the-wire encoding of one depth sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    U16,
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U16 => 2,
            SampleFormat::F32 => 4,
        }
    }
}

/// Element type of a depth image. `sample * scale_to_meters` is meters.
pub trait DepthSample: bytemuck::Pod + Send + Sync + 'static {
    const FORMAT: SampleFormat;

    fn as_f32(self) -> f32;
}

impl DepthSample for u16 {
    const FORMAT: SampleFormat = SampleFormat::U16;

    fn as_f32(self) -> f32 {
        f32::from(self)
    }
}

impl DepthSample for f32 {
    const FORMAT: SampleFormat = SampleFormat::F32;

    fn as_f32(self) -> f32 {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f32,
    pub y: f32,
}

impl Point2 {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Arguments to `DepthSource::initialize`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceParams {
    pub focal_length: Point2,
    /// `x == 0` selects the image center
    pub principal_point: Point2,
    pub depth_width: u32,
    pub depth_height: u32,
    pub scale_to_meters: f32,
}

impl SourceParams {
    pub fn new(focal_length: Point2) -> Self {
        Self {
            focal_length,
            principal_point: Point2::default(),
            depth_width: 512,
            depth_height: 424,
            scale_to_meters: 1.0,
        }
    }
}

/// Pinhole intrinsics of the depth image
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Calibration {
    pub focal_length: Point2,
    pub principal_point: Point2,
    pub depth_width: u32,
    pub depth_height: u32,
}

impl Calibration {
    /// Resolve the zero principal-point sentinel against the image size
    pub fn from_params(params: &SourceParams) -> Self {
        let (cx, cy) = utils::default_principal_point(
            params.principal_point.x,
            params.principal_point.y,
            params.depth_width,
            params.depth_height,
        );

        Self {
            focal_length: params.focal_length,
            principal_point: Point2::new(cx, cy),
            depth_width: params.depth_width,
            depth_height: params.depth_height,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.depth_width as usize * self.depth_height as usize
    }
}

/// Capabilities every depth source offers a tracking pipeline.
///
/// The frame index starts at 0 after `initialize` and only `advance` or
/// `set_frame` move it. Live sources cannot seek: their `set_frame` ignores
/// the requested index and acquires the next frame.
pub trait DepthSource {
    type Sample: DepthSample;

    fn initialize(&mut self, params: SourceParams) -> Result<()>;

    fn is_initialized(&self) -> bool;

    fn calibration(&self) -> &Calibration;

    /// Index of the current frame
    fn frame(&self) -> u32;

    fn advance(&mut self) -> Result<()>;

    fn set_frame(&mut self, frame: u32) -> Result<()>;

    /// Host copy of the current depth image, `None` before the first frame
    fn depth(&self) -> Option<&[Self::Sample]>;

    /// Device timestamp of the current frame, `None` before the first frame
    fn depth_time(&self) -> Option<u64>;

    fn scale_to_meters(&self) -> f32;

    fn has_radial_distortion_params(&self) -> bool;

    fn is_live(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_principal_point_defaults_to_center() {
        let mut params = SourceParams::new(Point2::new(365.0, 365.0));
        params.principal_point = Point2::new(0.0, 0.0);

        let calib = Calibration::from_params(&params);
        assert_eq!(calib.principal_point, Point2::new(256.0, 212.0));
        assert_eq!(calib.pixel_count(), 512 * 424);
    }

    #[test]
    fn explicit_principal_point_is_kept() {
        let mut params = SourceParams::new(Point2::new(365.0, 365.0));
        params.principal_point = Point2::new(254.9, 205.4);
        assert_eq!(
            Calibration::from_params(&params).principal_point,
            Point2::new(254.9, 205.4)
        );
    }

    #[test]
    fn sample_formats_match_types() {
        assert_eq!(<u16 as DepthSample>::FORMAT.bytes_per_sample(), 2);
        assert_eq!(<f32 as DepthSample>::FORMAT.bytes_per_sample(), 4);
    }
}
