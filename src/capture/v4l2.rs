//! V4L2 depth node backend (16-bit Z16/Y16 depth with memory-mapped buffers)

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info, instrument, warn};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use crate::capture::device::{DepthDevice, DepthDriver, DeviceInfo};
use crate::capture::frame::{FrameKind, FrameTypes, RawFrame, StreamFormat};
use crate::capture::pool::FramePool;
use crate::error::DeviceError;
use crate::pipeline::listener::FrameSink;
use crate::utils::{self, FoundDevice};
use crate::V4l2Config;

const DEPTH_BYTES_PER_PIXEL: u32 = 2;

/// Consecutive dequeue failures after which the node is treated as gone
const MAX_DEQUEUE_FAILURES: u32 = 10;
const FAILURE_BACKOFF: Duration = Duration::from_millis(50);

pub struct V4l2DepthDriver {
    config: V4l2Config,
    width: u32,
    height: u32,
    pool_size: usize,
    found: Vec<FoundDevice>,
}

impl V4l2DepthDriver {
    pub fn new(config: V4l2Config, width: u32, height: u32, pool_size: usize) -> Self {
        Self {
            config,
            width,
            height,
            pool_size,
            found: Vec::new(),
        }
    }
}

impl DepthDriver for V4l2DepthDriver {
    fn backend_name(&self) -> &'static str {
        "v4l2"
    }

    fn enumerate(&mut self) -> Result<Vec<DeviceInfo>, DeviceError> {
        self.found = match &self.config.device_path {
            Some(path) => utils::probe_depth_node(path).into_iter().collect(),
            None => utils::find_depth_nodes(),
        };

        Ok(self
            .found
            .iter()
            .enumerate()
            .map(|(index, dev)| DeviceInfo {
                index,
                // V4L2 has no serial query; the bus address is stable per port.
                serial: dev.bus.clone(),
                name: dev.card.clone(),
                path: dev.path.clone(),
            })
            .collect())
    }

    #[instrument(skip(self))]
    fn open(&mut self, info: &DeviceInfo) -> Result<Box<dyn DepthDevice>, DeviceError> {
        let found = self
            .found
            .get(info.index)
            .filter(|f| f.path == info.path)
            .ok_or_else(|| DeviceError::NotFound(info.path.clone()))?;

        let device = Device::with_path(&found.path)?;
        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        let fourcc = FourCC::new(&found.fourcc);
        let actual = device.set_format(&Format::new(self.width, self.height, fourcc))?;
        if actual.fourcc != fourcc {
            return Err(DeviceError::UnsupportedFormat(format!(
                "driver switched {} to {}",
                fourcc, actual.fourcc
            )));
        }

        let depth_format = StreamFormat::new(actual.width, actual.height, DEPTH_BYTES_PER_PIXEL);
        let (major, minor, patch) = caps.version;

        Ok(Box::new(V4l2DepthDevice {
            path: found.path.clone(),
            serial: info.serial.clone(),
            firmware: format!("{} {}.{}.{}", caps.driver, major, minor, patch),
            depth_format,
            pool: FramePool::new(self.pool_size, depth_format.frame_bytes()),
            config: self.config.clone(),
            sink: None,
            stop_signal: Arc::new(AtomicBool::new(false)),
            capture_thread: None,
            _device: Some(device),
        }))
    }
}

struct V4l2DepthDevice {
    path: String,
    serial: String,
    firmware: String,
    depth_format: StreamFormat,
    pool: FramePool,
    config: V4l2Config,
    sink: Option<FrameSink>,
    stop_signal: Arc<AtomicBool>,
    capture_thread: Option<JoinHandle<()>>,
    // Keeps the node claimed (and its format set) while the session is open.
    _device: Option<Device>,
}

impl DepthDevice for V4l2DepthDevice {
    fn serial_number(&self) -> &str {
        &self.serial
    }

    fn firmware_version(&self) -> &str {
        &self.firmware
    }

    fn depth_format(&self) -> StreamFormat {
        self.depth_format
    }

    fn frame_types(&self) -> FrameTypes {
        FrameTypes::DEPTH
    }

    fn set_frame_sink(&mut self, sink: FrameSink) {
        self.sink = Some(sink);
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        if self.capture_thread.is_some() {
            return Ok(());
        }
        let sink = self
            .sink
            .clone()
            .ok_or_else(|| DeviceError::Refused("no frame sink registered".into()))?;

        let path = self.path.clone();
        let format = self.depth_format;
        let pool = self.pool.clone();
        let config = self.config.clone();
        let stop_signal = self.stop_signal.clone();

        let handle = thread::Builder::new()
            .name("v4l2-depth-capture".into())
            .spawn(move || {
                if let Err(e) = capture_loop(&path, format, &config, pool, sink, stop_signal)
                {
                    error!(error = %e, "Depth capture loop error");
                }
            })?;
        self.capture_thread = Some(handle);
        Ok(())
    }

    /// Returns within one dequeue timeout, even when the device has gone silent
    fn stop(&mut self) -> Result<(), DeviceError> {
        self.stop_signal.store(true, Ordering::SeqCst);
        let result = match self.capture_thread.take() {
            Some(handle) => handle.join().map_err(|_| DeviceError::CaptureThread),
            None => Ok(()),
        };
        self.stop_signal.store(false, Ordering::SeqCst);
        result
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        let stopped = self.stop();
        self.sink = None;
        self._device = None;
        stopped
    }
}

impl Drop for V4l2DepthDevice {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path, error = %e, "Failed to close depth node");
        }
    }
}

fn capture_loop(
    path: &str,
    format: StreamFormat,
    config: &V4l2Config,
    pool: FramePool,
    sink: FrameSink,
    stop_signal: Arc<AtomicBool>,
) -> Result<(), DeviceError> {
    let device = Device::with_path(path)?;
    let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count)?;
    // Bounded dequeue so the stop flag is seen even when no frames arrive.
    stream.set_timeout(Duration::from_millis(config.dequeue_timeout_ms.clamp(1, 10_000)));
    info!(
        path,
        buffer_count = config.buffer_count,
        dequeue_timeout_ms = config.dequeue_timeout_ms,
        "Depth capture stream started"
    );

    let frame_bytes = format.frame_bytes();
    let mut sequence = 0u64;
    let mut failures = DequeueFailures::default();

    while !stop_signal.load(Ordering::SeqCst) {
        let (buf, meta) = match stream.next() {
            Ok(frame) => frame,
            Err(e) => match failures.record(&e) {
                Dequeue::Idle => continue,
                Dequeue::Retry => {
                    warn!(error = %e, failures = failures.consecutive, "Failed to capture depth frame");
                    thread::sleep(FAILURE_BACKOFF);
                    continue;
                }
                Dequeue::GiveUp => {
                    error!(error = %e, "Depth node keeps failing, stopping capture");
                    return Err(e.into());
                }
            },
        };
        failures.reset();

        let used = (meta.bytesused as usize).min(buf.len());
        let timestamp =
            meta.timestamp.sec as u64 * 1_000_000 + meta.timestamp.usec as u64;

        let mut data = pool.acquire();
        data.fill_from(&buf[..used]);
        if used != frame_bytes {
            warn!(used, expected = frame_bytes, "Short depth frame");
        }

        sink.deliver(RawFrame::new(
            FrameKind::Depth,
            format,
            timestamp,
            sequence,
            data,
        ));
        sequence += 1;
    }

    info!(frames = sequence, "Depth capture loop stopped");
    Ok(())
}

/// What the capture loop does after a failed dequeue
#[derive(Debug, PartialEq, Eq)]
enum Dequeue {
    /// Timed out with no frame; re-check the stop flag
    Idle,
    Retry,
    GiveUp,
}

#[derive(Debug, Default)]
struct DequeueFailures {
    consecutive: u32,
}

impl DequeueFailures {
    fn record(&mut self, e: &io::Error) -> Dequeue {
        if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) {
            return Dequeue::Idle;
        }
        self.consecutive += 1;
        if self.consecutive >= MAX_DEQUEUE_FAILURES {
            Dequeue::GiveUp
        } else {
            Dequeue::Retry
        }
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: io::ErrorKind) -> io::Error {
        io::Error::new(kind, "VIDIOC_DQBUF")
    }

    #[test]
    fn timeouts_never_end_the_stream() {
        let mut failures = DequeueFailures::default();
        for _ in 0..(MAX_DEQUEUE_FAILURES * 3) {
            assert_eq!(failures.record(&err(io::ErrorKind::TimedOut)), Dequeue::Idle);
        }
        assert_eq!(failures.consecutive, 0);
    }

    #[test]
    fn repeated_errors_give_up() {
        let mut failures = DequeueFailures::default();
        for _ in 1..MAX_DEQUEUE_FAILURES {
            assert_eq!(failures.record(&err(io::ErrorKind::Other)), Dequeue::Retry);
        }
        assert_eq!(failures.record(&err(io::ErrorKind::Other)), Dequeue::GiveUp);
    }

    #[test]
    fn a_good_frame_clears_the_failure_count() {
        let mut failures = DequeueFailures::default();
        for _ in 1..MAX_DEQUEUE_FAILURES {
            failures.record(&err(io::ErrorKind::BrokenPipe));
        }
        failures.reset();
        assert_eq!(failures.record(&err(io::ErrorKind::BrokenPipe)), Dequeue::Retry);
    }
}
