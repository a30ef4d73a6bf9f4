pub mod capture;
pub mod error;
pub mod memory;
pub mod pipeline;
pub mod source;
pub mod utils;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use capture::{DepthDriver, DeviceSession, FrameBundle, FrameListener, SyntheticDriver};
pub use error::{Error, Result};
pub use memory::{Accelerator, MirroredBuffer};
pub use source::{DepthSample, DepthSource, LiveDepthSource, Point2, SampleFormat, SourceParams};

/// Environment variable prefix, e.g. `DEPTHCAST__SOURCE__FRAME_TIMEOUT_MS`
pub const ENV_PREFIX: &str = "DEPTHCAST";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub device: DeviceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub focal_length: Point2,
    /// `x == 0` selects the image center
    pub principal_point: Point2,
    pub depth_width: u32,
    pub depth_height: u32,
    pub scale_to_meters: f32,
    pub frame_timeout_ms: u64,
    pub sample_format: SampleFormat,
    /// Mirror depth into GPU memory via wgpu
    pub use_accelerator: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Synthetic,
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: Backend,
    /// Buffers in each device-side frame pool
    pub frame_pool_size: usize,
    pub synthetic: SyntheticConfig,
    pub v4l2: V4l2Config,
}

/// Virtual sensor parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub device_count: usize,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub sample_format: SampleFormat,
    pub with_color: bool,
    pub color_width: u32,
    pub color_height: u32,
    pub serial_prefix: String,
    pub firmware: String,
    /// Every open attempt fails, as with a device claimed by another process
    pub refuse_open: bool,
    /// Stop producing after this many frames, as if unplugged
    pub frame_limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct V4l2Config {
    /// Use this node instead of scanning `/dev/video*`
    pub device_path: Option<String>,
    pub buffer_count: u32,
    /// Longest single wait for a buffer before the capture thread re-checks
    /// whether it was asked to stop
    pub dequeue_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            focal_length: Point2::new(365.0, 365.0),
            principal_point: Point2::default(),
            depth_width: 512,
            depth_height: 424,
            scale_to_meters: 1.0,
            frame_timeout_ms: 2000,
            sample_format: SampleFormat::F32,
            use_accelerator: false,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Synthetic,
            frame_pool_size: 4,
            synthetic: SyntheticConfig::default(),
            v4l2: V4l2Config::default(),
        }
    }
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            width: 512,
            height: 424,
            fps: 30,
            sample_format: SampleFormat::F32,
            with_color: false,
            color_width: 640,
            color_height: 360,
            serial_prefix: "SYN".into(),
            firmware: "synthetic 1.0".into(),
            refuse_open: false,
            frame_limit: None,
        }
    }
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device_path: None,
            buffer_count: 4,
            dequeue_timeout_ms: 200,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "depthcast=info".into(),
        }
    }
}

impl Config {
    /// Defaults, overlaid by an optional TOML file, overlaid by
    /// `DEPTHCAST__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Source parameters for `DepthSource::initialize`
    pub fn source_params(&self) -> SourceParams {
        SourceParams {
            focal_length: self.source.focal_length,
            principal_point: self.source.principal_point,
            depth_width: self.source.depth_width,
            depth_height: self.source.depth_height,
            scale_to_meters: self.source.scale_to_meters,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_depth_sensor_geometry() {
        let config = Config::default();
        assert_eq!(config.source.depth_width, 512);
        assert_eq!(config.source.depth_height, 424);
        assert_eq!(config.source.scale_to_meters, 1.0);
        assert_eq!(config.device.backend, Backend::Synthetic);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[source]
depth_width = 640
depth_height = 480
sample_format = "u16"
principal_point = {{ x = 320.5, y = 240.5 }}

[device]
backend = "v4l2"

[device.synthetic]
fps = 90
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.source.depth_width, 640);
        assert_eq!(config.source.sample_format, SampleFormat::U16);
        assert_eq!(config.source.principal_point, Point2::new(320.5, 240.5));
        assert_eq!(config.device.backend, Backend::V4l2);
        assert_eq!(config.device.synthetic.fps, 90);
        // Untouched keys keep their defaults.
        assert_eq!(config.source.frame_timeout_ms, 2000);
        assert_eq!(config.device.synthetic.width, 512);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/depthcast.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn source_params_carry_calibration() {
        let params = Config::default().source_params();
        assert_eq!(params.depth_width, 512);
        assert_eq!(params.principal_point, Point2::default());
    }
}
