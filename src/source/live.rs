//! Depth source fed by a streaming device

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::device::DepthDriver;
use crate::capture::frame::{FrameBundle, FrameKind, FrameTypes};
use crate::capture::session::{DeviceSession, SessionState};
use crate::error::{Error, Result};
use crate::memory::accelerator::Accelerator;
use crate::memory::mirrored::{Coherence, DeviceView, MirroredBuffer};
use crate::pipeline::listener::{FrameListener, ListenerStats};
use crate::source::{Calibration, DepthSample, DepthSource, SourceParams};
use crate::SourceConfig;

/// Upper bound on a single frame wait
pub const MAX_FRAME_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct LiveSourceOptions {
    /// Longest `advance` waits for a frame before reporting a timeout,
    /// capped at `MAX_FRAME_TIMEOUT`
    pub frame_timeout: Duration,
    /// Where the device-resident depth copy lives; host memory when `None`
    pub accelerator: Option<Arc<dyn Accelerator>>,
}

impl Default for LiveSourceOptions {
    fn default() -> Self {
        Self {
            frame_timeout: Duration::from_millis(2000),
            accelerator: None,
        }
    }
}

impl LiveSourceOptions {
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            frame_timeout: Duration::from_millis(config.frame_timeout_ms).min(MAX_FRAME_TIMEOUT),
            accelerator: None,
        }
    }

    pub fn with_accelerator(mut self, accelerator: Arc<dyn Accelerator>) -> Self {
        self.accelerator = Some(accelerator);
        self
    }
}

/// Latest color image received alongside depth
#[derive(Debug, Clone)]
pub struct ColorImage {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
    pub timestamp: u64,
    pub data: Bytes,
}

/// Depth source reading from device 0 of a driver.
///
/// `advance` blocks on the device's frame listener, copies the depth payload
/// into the accelerator copy of the depth buffer, synchronizes it to the host
/// and hands the frame back to the device.
///
/// Reads (`depth`, `device_depth`) must not overlap an in-flight `advance`;
/// the borrow checker enforces this for a single owner.
///
/// Dropping the source stops and closes the device, logging any errors.
pub struct LiveDepthSource<T: DepthSample, D: DepthDriver> {
    session: DeviceSession<D>,
    options: LiveSourceOptions,
    calibration: Calibration,
    scale_to_meters: f32,
    frame: u32,
    depth_times: Vec<u64>,
    depth_data: Option<MirroredBuffer<T>>,
    listener: Option<FrameListener>,
    color: Option<ColorImage>,
    initialized: bool,
}

impl<T: DepthSample, D: DepthDriver> LiveDepthSource<T, D> {
    pub fn new(driver: D, options: LiveSourceOptions) -> Self {
        Self {
            session: DeviceSession::new(driver),
            options,
            calibration: Calibration::default(),
            scale_to_meters: 1.0,
            frame: 0,
            depth_times: Vec::new(),
            depth_data: None,
            listener: None,
            color: None,
            initialized: false,
        }
    }

    pub fn session(&self) -> &DeviceSession<D> {
        &self.session
    }

    /// Accelerator-resident copy of the current depth image
    pub fn device_depth(&self) -> Option<DeviceView<'_, T>> {
        if self.frame == 0 {
            return None;
        }
        self.depth_data.as_ref().map(MirroredBuffer::accelerator_view)
    }

    pub fn depth_buffer(&self) -> Option<&MirroredBuffer<T>> {
        self.depth_data.as_ref()
    }

    pub fn color(&self) -> Option<&ColorImage> {
        self.color.as_ref()
    }

    /// Device timestamps of every acquired frame, oldest first
    pub fn depth_times(&self) -> &[u64] {
        &self.depth_times
    }

    pub fn listener_stats(&self) -> Option<ListenerStats> {
        self.listener.as_ref().map(FrameListener::stats)
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.session.serial_number()
    }

    pub fn firmware_version(&self) -> Option<&str> {
        self.session.firmware_version()
    }

    /// Stop streaming, reporting the device's error if this is the call
    /// that actually stops it
    pub fn stop(&mut self) -> Result<()> {
        self.session.stop()
    }

    /// Close the device; see `DeviceSession::close`
    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    fn subscribed_types(&self) -> FrameTypes {
        match self.session.frame_types() {
            Some(types) if types.contains(FrameKind::Color) => {
                FrameTypes::DEPTH | FrameTypes::COLOR
            }
            _ => FrameTypes::DEPTH,
        }
    }

    fn check_device_format(&self) {
        let Some(native) = self.session.depth_format() else {
            return;
        };
        let calib = &self.calibration;
        if native.width != calib.depth_width
            || native.height != calib.depth_height
            || native.bytes_per_pixel as usize != T::FORMAT.bytes_per_sample()
        {
            warn!(
                native = ?native,
                width = calib.depth_width,
                height = calib.depth_height,
                sample = ?T::FORMAT,
                "Device depth format differs from requested; frames will be rejected"
            );
        }
    }

    /// Release the device and return the session to a state `initialize`
    /// can start over from
    fn abort_initialize(&mut self, e: Error) -> Error {
        error!(error = %e, "Initialization failed, releasing device");
        self.session.shutdown();
        if let Err(reset) = self.session.reset() {
            warn!(error = %reset, "Could not reset device session");
        }
        e
    }
}

impl<T: DepthSample, D: DepthDriver> DepthSource for LiveDepthSource<T, D> {
    type Sample = T;

    /// Discover devices, allocate the depth buffer, open the first device
    /// and start streaming. Failures leave no buffer allocated and no device
    /// held, so the caller may retry.
    #[instrument(skip(self), fields(backend = self.session.backend_name()))]
    fn initialize(&mut self, params: SourceParams) -> Result<()> {
        if self.initialized || self.session.state() == SessionState::Closed {
            return Err(Error::InvalidState {
                op: "initialize",
                state: self.session.state(),
            });
        }

        self.frame = 0;
        self.depth_times.clear();
        self.color = None;
        self.calibration = Calibration::from_params(&params);
        self.scale_to_meters = params.scale_to_meters;

        if self.session.discover()?.is_empty() {
            error!("could not find any devices");
            return Err(Error::NoDevice);
        }
        // Allocate before touching the device so an allocation failure
        // leaves nothing to release.
        info!(
            samples = self.calibration.pixel_count(),
            "Initializing depth buffer"
        );
        let buffer = MirroredBuffer::<T>::allocate(
            self.calibration.depth_width,
            self.calibration.depth_height,
            self.options.accelerator.as_deref(),
        )?;

        self.session.open(0)?;
        self.check_device_format();

        let listener = FrameListener::new(self.subscribed_types());
        let started = self
            .session
            .configure_listener(&listener)
            .and_then(|()| self.session.start());
        if let Err(e) = started {
            return Err(self.abort_initialize(e));
        }

        self.depth_data = Some(buffer);
        self.listener = Some(listener);
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

    /// Acquire the next frame. A timeout is reported and the source stays
    /// usable; the caller may retry.
    fn advance(&mut self) -> Result<()> {
        let (Some(listener), Some(buffer)) = (self.listener.as_ref(), self.depth_data.as_mut())
        else {
            return Err(Error::NotInitialized);
        };

        let bundle = listener
            .wait_for_frame(self.options.frame_timeout.min(MAX_FRAME_TIMEOUT))
            .map_err(|e| {
                if let Error::FrameTimeout(after) = &e {
                    warn!(?after, "Timed out waiting for depth frame");
                    metrics::counter!("depthcast_frame_timeouts_total").increment(1);
                }
                e
            })?;

        // The bundle goes back to the device whether or not it was usable.
        let ingested = ingest(buffer, &bundle);
        listener.release(bundle);
        let (timestamp, color) = ingested?;

        if color.is_some() {
            self.color = color;
        }
        if let Some(&last) = self.depth_times.last() {
            if timestamp < last {
                warn!(timestamp, last, "Device timestamp went backwards");
            }
        }
        self.depth_times.push(timestamp);
        self.frame += 1;

        metrics::counter!("depthcast_frames_acquired_total").increment(1);
        Ok(())
    }

    /// Live devices cannot seek; acquires the next frame whatever `frame` is
    fn set_frame(&mut self, frame: u32) -> Result<()> {
        debug!(requested = frame, "Live source cannot seek, acquiring next frame");
        self.advance()
    }

    fn depth(&self) -> Option<&[T]> {
        if self.frame == 0 {
            return None;
        }
        self.depth_data.as_ref().map(MirroredBuffer::host_view)
    }

    fn depth_time(&self) -> Option<u64> {
        let index = self.frame.checked_sub(1)?;
        self.depth_times.get(index as usize).copied()
    }

    fn scale_to_meters(&self) -> f32 {
        self.scale_to_meters
    }

    fn has_radial_distortion_params(&self) -> bool {
        false
    }

    fn is_live(&self) -> bool {
        true
    }
}

/// Copy a bundle's depth into `buffer` and bring the host copy up to date.
///
/// On failure both copies are left holding the last acquired frame.
fn ingest<T: DepthSample>(
    buffer: &mut MirroredBuffer<T>,
    bundle: &FrameBundle,
) -> Result<(u64, Option<ColorImage>)> {
    let Some(depth) = bundle.depth() else {
        return Err(Error::SizeMismatch {
            expected: buffer.byte_len(),
            actual: 0,
        });
    };
    debug!(timestamp = depth.timestamp, sequence = depth.sequence, "depth@");

    let copied = buffer
        .write_accelerator(depth.data())
        .and_then(|()| buffer.synchronize_to_host());
    if let Err(e) = copied {
        if buffer.coherence() != Coherence::Synchronized {
            // The host still holds the previous frame; put it back on the
            // accelerator so both views agree on `frame()`.
            if let Err(restore) = buffer.synchronize_to_accelerator() {
                warn!(error = %restore, "Could not restore accelerator depth copy");
            }
        }
        return Err(e);
    }

    let color = bundle.color().map(|color| ColorImage {
        width: color.format.width,
        height: color.format.height,
        bytes_per_pixel: color.format.bytes_per_pixel,
        timestamp: color.timestamp,
        data: Bytes::copy_from_slice(color.data()),
    });
    Ok((depth.timestamp, color))
}
