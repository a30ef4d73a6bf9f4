//! Lifecycle of one depth device: discover, open, start, stop, close

use tracing::{error, info, instrument, warn};

use crate::capture::device::{DepthDevice, DepthDriver, DeviceInfo};
use crate::capture::frame::StreamFormat;
use crate::error::{Error, Result};
use crate::pipeline::listener::FrameListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Discovering,
    Opened,
    Streaming,
    Stopped,
    Closed,
}

/// Owns one device handle and enforces the order of lifecycle calls.
///
/// `stop` and `close` are no-ops from states where there is nothing left
/// to stop or close, so teardown code can call both unconditionally. The
/// first call that actually touches the device reports its error.
pub struct DeviceSession<D: DepthDriver> {
    driver: D,
    state: SessionState,
    devices: Vec<DeviceInfo>,
    device: Option<Box<dyn DepthDevice>>,
    opened_index: Option<usize>,
    listener_configured: bool,
}

impl<D: DepthDriver> DeviceSession<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            state: SessionState::Uninitialized,
            devices: Vec::new(),
            device: None,
            opened_index: None,
            listener_configured: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.state == SessionState::Streaming
    }

    pub fn backend_name(&self) -> &'static str {
        self.driver.backend_name()
    }

    /// Devices found by the last `discover`
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// Enumerate attached devices. Zero devices is reported, not an error.
    #[instrument(skip(self), fields(backend = self.driver.backend_name()))]
    pub fn discover(&mut self) -> Result<&[DeviceInfo]> {
        match self.state {
            SessionState::Uninitialized | SessionState::Discovering => {}
            state => return Err(Error::InvalidState { op: "discover", state }),
        }

        self.devices = self.driver.enumerate()?;
        self.state = SessionState::Discovering;

        info!("found {} devices", self.devices.len());
        for dev in &self.devices {
            info!(
                index = dev.index,
                serial = %dev.serial,
                name = %dev.name,
                path = %dev.path,
                "device {} has serial number {}",
                dev.index,
                dev.serial
            );
        }

        Ok(&self.devices)
    }

    /// Open the device at `index` of the last discovery.
    /// On failure the session stays in `Discovering`.
    #[instrument(skip(self))]
    pub fn open(&mut self, index: usize) -> Result<()> {
        if self.state != SessionState::Discovering {
            return Err(Error::InvalidState {
                op: "open",
                state: self.state,
            });
        }

        let info = self.devices.get(index).ok_or_else(|| Error::DeviceOpen {
            index,
            reason: format!("no such device ({} found)", self.devices.len()),
        })?;

        info!("attempting to open device {}", index);
        let device = self.driver.open(info).map_err(|e| {
            error!(index, error = %e, "could not open device");
            Error::DeviceOpen {
                index,
                reason: e.to_string(),
            }
        })?;

        info!(
            serial = %device.serial_number(),
            firmware = %device.firmware_version(),
            "opened device"
        );

        self.device = Some(device);
        self.opened_index = Some(index);
        self.state = SessionState::Opened;
        Ok(())
    }

    /// Route the device's frames to `listener`. Must precede `start`.
    pub fn configure_listener(&mut self, listener: &FrameListener) -> Result<()> {
        let state = self.state;
        let device = match (state, self.device.as_mut()) {
            (SessionState::Opened, Some(device)) => device,
            _ => {
                return Err(Error::InvalidState {
                    op: "configure_listener",
                    state,
                })
            }
        };

        let wanted = listener.subscribed();
        if wanted.is_empty() || !device.frame_types().is_superset(wanted) {
            return Err(Error::StreamStart(format!(
                "device produces {:?}, listener wants {:?}",
                device.frame_types(),
                wanted
            )));
        }

        device.set_frame_sink(listener.sink());
        self.listener_configured = true;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn start(&mut self) -> Result<()> {
        let state = self.state;
        let device = match (state, self.device.as_mut()) {
            (SessionState::Opened, Some(device)) => device,
            _ => return Err(Error::StreamStart(format!("session is {:?}", state))),
        };

        if !self.listener_configured {
            return Err(Error::StreamStart("no frame listener configured".into()));
        }

        device
            .start()
            .map_err(|e| Error::StreamStart(e.to_string()))?;
        self.state = SessionState::Streaming;
        info!("streaming started");
        Ok(())
    }

    /// Stop streaming. No-op unless currently streaming.
    #[instrument(skip(self))]
    pub fn stop(&mut self) -> Result<()> {
        if self.state != SessionState::Streaming {
            return Ok(());
        }

        // The capture thread is gone either way; later calls must not retry.
        self.state = SessionState::Stopped;
        if let Some(device) = self.device.as_mut() {
            device.stop()?;
        }
        info!("streaming stopped");
        Ok(())
    }

    /// Release the device. Invalid while streaming; no-op once closed.
    #[instrument(skip(self))]
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            SessionState::Closed => return Ok(()),
            SessionState::Streaming => {
                return Err(Error::InvalidState {
                    op: "close",
                    state: self.state,
                })
            }
            _ => {}
        }

        self.state = SessionState::Closed;
        self.listener_configured = false;
        if let Some(mut device) = self.device.take() {
            device.close()?;
            info!("device closed");
        }
        Ok(())
    }

    /// Best-effort stop then close; errors are logged, not returned
    pub fn shutdown(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Ignoring error while stopping device");
        }
        if let Err(e) = self.close() {
            warn!(error = %e, "Ignoring error while closing device");
        }
    }

    /// Forget the last discovery and return to `Uninitialized`.
    ///
    /// Only valid while no device handle is held, i.e. before `open` or after
    /// `close`. Lets a caller start over after a failed bring-up.
    pub fn reset(&mut self) -> Result<()> {
        if self.device.is_some() {
            return Err(Error::InvalidState {
                op: "reset",
                state: self.state,
            });
        }

        self.state = SessionState::Uninitialized;
        self.devices.clear();
        self.opened_index = None;
        self.listener_configured = false;
        Ok(())
    }

    pub fn opened_device(&self) -> Option<&DeviceInfo> {
        self.opened_index.and_then(|i| self.devices.get(i))
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.device.as_ref().map(|d| d.serial_number())
    }

    pub fn firmware_version(&self) -> Option<&str> {
        self.device.as_ref().map(|d| d.firmware_version())
    }

    pub fn depth_format(&self) -> Option<StreamFormat> {
        self.device.as_ref().map(|d| d.depth_format())
    }

    pub fn frame_types(&self) -> Option<crate::capture::frame::FrameTypes> {
        self.device.as_ref().map(|d| d.frame_types())
    }
}

impl<D: DepthDriver> Drop for DeviceSession<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
