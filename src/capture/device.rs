//! Backend traits for depth sensors.
//!
//! A `DepthDriver` enumerates and opens devices; an opened `DepthDevice`
//! owns its capture thread and frame pool and pushes frames into the
//! `FrameSink` it was given.

use serde::{Deserialize, Serialize};

use crate::capture::frame::{FrameTypes, StreamFormat};
use crate::error::DeviceError;
use crate::pipeline::listener::FrameSink;

/// Identity of an enumerated device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub index: usize,
    pub serial: String,
    pub name: String,
    /// Backend-specific location (device node, bus address)
    pub path: String,
}

pub trait DepthDriver: Send {
    fn backend_name(&self) -> &'static str;

    /// List attached devices. Must not change any device's state.
    fn enumerate(&mut self) -> Result<Vec<DeviceInfo>, DeviceError>;

    fn open(&mut self, info: &DeviceInfo) -> Result<Box<dyn DepthDevice>, DeviceError>;
}

impl<D: DepthDriver + ?Sized> DepthDriver for Box<D> {
    fn backend_name(&self) -> &'static str {
        (**self).backend_name()
    }

    fn enumerate(&mut self) -> Result<Vec<DeviceInfo>, DeviceError> {
        (**self).enumerate()
    }

    fn open(&mut self, info: &DeviceInfo) -> Result<Box<dyn DepthDevice>, DeviceError> {
        (**self).open(info)
    }
}

pub trait DepthDevice: Send {
    fn serial_number(&self) -> &str;

    fn firmware_version(&self) -> &str;

    /// Native depth stream geometry
    fn depth_format(&self) -> StreamFormat;

    /// Frame kinds this device produces
    fn frame_types(&self) -> FrameTypes;

    /// Route frames to `sink`; replaces any earlier sink
    fn set_frame_sink(&mut self, sink: FrameSink);

    /// Begin pushing frames from the device's capture thread
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Stop the capture thread. No frames are delivered after this returns.
    fn stop(&mut self) -> Result<(), DeviceError>;

    /// Release the device handle
    fn close(&mut self) -> Result<(), DeviceError>;
}
