#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use depthcast::capture::SyntheticDriver;
use depthcast::error::AcceleratorError;
use depthcast::memory::{Accelerator, DeviceRegion};
use depthcast::source::{LiveDepthSource, LiveSourceOptions};
use depthcast::{Point2, SampleFormat, SourceParams, SyntheticConfig};

pub const WIDTH: u32 = 32;
pub const HEIGHT: u32 = 24;

/// Accelerator backed by ordinary heap memory
pub struct HostAccelerator;

struct HostRegion(Vec<u8>);

impl Accelerator for HostAccelerator {
    fn name(&self) -> &str {
        "host"
    }

    fn allocate(&self, len: usize) -> Result<Box<dyn DeviceRegion>, AcceleratorError> {
        Ok(Box::new(HostRegion(vec![0; len])))
    }
}

impl DeviceRegion for HostRegion {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn upload(&mut self, bytes: &[u8]) -> Result<(), AcceleratorError> {
        if bytes.len() != self.0.len() {
            return Err(AcceleratorError::RegionSize {
                capacity: self.0.len(),
                len: bytes.len(),
            });
        }
        self.0.copy_from_slice(bytes);
        Ok(())
    }

    fn download(&self, out: &mut [u8]) -> Result<(), AcceleratorError> {
        if out.len() != self.0.len() {
            return Err(AcceleratorError::RegionSize {
                capacity: self.0.len(),
                len: out.len(),
            });
        }
        out.copy_from_slice(&self.0);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Heap accelerator with injectable failures
#[derive(Default)]
pub struct FlakyAccelerator {
    /// Allocations still to refuse
    pub failing_allocations: AtomicUsize,
    /// Shared with every region; downloads fail while set
    pub fail_downloads: Arc<AtomicBool>,
}

struct FlakyRegion {
    inner: HostRegion,
    fail_downloads: Arc<AtomicBool>,
}

impl Accelerator for FlakyAccelerator {
    fn name(&self) -> &str {
        "flaky"
    }

    fn allocate(&self, len: usize) -> Result<Box<dyn DeviceRegion>, AcceleratorError> {
        let refused = self
            .failing_allocations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(AcceleratorError::OutOfMemory { requested: len });
        }
        Ok(Box::new(FlakyRegion {
            inner: HostRegion(vec![0; len]),
            fail_downloads: self.fail_downloads.clone(),
        }))
    }
}

impl DeviceRegion for FlakyRegion {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn upload(&mut self, bytes: &[u8]) -> Result<(), AcceleratorError> {
        self.inner.upload(bytes)
    }

    fn download(&self, out: &mut [u8]) -> Result<(), AcceleratorError> {
        if self.fail_downloads.load(Ordering::SeqCst) {
            return Err(AcceleratorError::Transfer("link reset".into()));
        }
        self.inner.download(out)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn sensor(sample_format: SampleFormat) -> SyntheticConfig {
    SyntheticConfig {
        width: WIDTH,
        height: HEIGHT,
        fps: 250,
        sample_format,
        ..SyntheticConfig::default()
    }
}

pub fn params() -> SourceParams {
    SourceParams {
        depth_width: WIDTH,
        depth_height: HEIGHT,
        ..SourceParams::new(Point2::new(365.0, 365.0))
    }
}

pub fn options() -> LiveSourceOptions {
    LiveSourceOptions {
        frame_timeout: Duration::from_millis(500),
        accelerator: None,
    }
}

pub fn live<T: depthcast::DepthSample>(
    config: SyntheticConfig,
    options: LiveSourceOptions,
) -> LiveDepthSource<T, SyntheticDriver> {
    LiveDepthSource::new(SyntheticDriver::new(config, 3), options)
}
