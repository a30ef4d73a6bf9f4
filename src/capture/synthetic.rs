//! Virtual depth sensor.
//!
//! Produces a moving tilted-plane depth image (and optionally a color
//! gradient) from its own capture thread at a fixed rate, so the whole
//! acquisition path can run without hardware.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::capture::device::{DepthDevice, DepthDriver, DeviceInfo};
use crate::capture::frame::{FrameKind, FrameTypes, RawFrame, StreamFormat};
use crate::capture::pool::FramePool;
use crate::error::DeviceError;
use crate::pipeline::listener::FrameSink;
use crate::source::SampleFormat;
use crate::SyntheticConfig;

/// Depth value in millimeters the virtual sensor reports at `(x, y)` for
/// frame `sequence`
pub fn synthetic_depth_mm(x: u32, y: u32, sequence: u64) -> f32 {
    (500 + x + y) as f32 + (sequence % 1000) as f32
}

pub struct SyntheticDriver {
    config: SyntheticConfig,
    pool_size: usize,
    claimed: Arc<Mutex<HashSet<usize>>>,
}

impl SyntheticDriver {
    pub fn new(config: SyntheticConfig, pool_size: usize) -> Self {
        Self {
            config,
            pool_size,
            claimed: Arc::default(),
        }
    }
}

impl DepthDriver for SyntheticDriver {
    fn backend_name(&self) -> &'static str {
        "synthetic"
    }

    fn enumerate(&mut self) -> Result<Vec<DeviceInfo>, DeviceError> {
        Ok((0..self.config.device_count)
            .map(|index| DeviceInfo {
                index,
                serial: format!("{}{:06}", self.config.serial_prefix, index),
                name: "Synthetic depth sensor".to_string(),
                path: format!("synthetic:{}", index),
            })
            .collect())
    }

    fn open(&mut self, info: &DeviceInfo) -> Result<Box<dyn DepthDevice>, DeviceError> {
        if info.index >= self.config.device_count {
            return Err(DeviceError::NotFound(info.path.clone()));
        }
        if self.config.refuse_open {
            return Err(DeviceError::Refused(format!(
                "{} refused to open",
                info.serial
            )));
        }

        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        if !claimed.insert(info.index) {
            return Err(DeviceError::Busy(info.serial.clone()));
        }

        Ok(Box::new(SyntheticDevice::new(
            info,
            self.config.clone(),
            self.pool_size,
            self.claimed.clone(),
        )))
    }
}

struct SyntheticDevice {
    index: usize,
    serial: String,
    config: SyntheticConfig,
    depth_format: StreamFormat,
    color_format: StreamFormat,
    depth_pool: FramePool,
    color_pool: FramePool,
    sink: Option<FrameSink>,
    stop_signal: Arc<AtomicBool>,
    capture_thread: Option<JoinHandle<()>>,
    claimed: Arc<Mutex<HashSet<usize>>>,
    closed: bool,
}

impl SyntheticDevice {
    fn new(
        info: &DeviceInfo,
        config: SyntheticConfig,
        pool_size: usize,
        claimed: Arc<Mutex<HashSet<usize>>>,
    ) -> Self {
        let depth_format = StreamFormat::new(
            config.width,
            config.height,
            config.sample_format.bytes_per_sample() as u32,
        );
        let color_format = StreamFormat::new(config.color_width, config.color_height, 3);
        let color_slots = if config.with_color { pool_size } else { 0 };

        Self {
            index: info.index,
            serial: info.serial.clone(),
            depth_pool: FramePool::new(pool_size, depth_format.frame_bytes()),
            color_pool: FramePool::new(color_slots, color_format.frame_bytes()),
            depth_format,
            color_format,
            config,
            sink: None,
            stop_signal: Arc::new(AtomicBool::new(false)),
            capture_thread: None,
            claimed,
            closed: false,
        }
    }

    fn join_capture_thread(&mut self) -> Result<(), DeviceError> {
        self.stop_signal.store(true, Ordering::SeqCst);
        let result = match self.capture_thread.take() {
            Some(handle) => handle.join().map_err(|_| DeviceError::CaptureThread),
            None => Ok(()),
        };
        self.stop_signal.store(false, Ordering::SeqCst);
        result
    }
}

impl DepthDevice for SyntheticDevice {
    fn serial_number(&self) -> &str {
        &self.serial
    }

    fn firmware_version(&self) -> &str {
        &self.config.firmware
    }

    fn depth_format(&self) -> StreamFormat {
        self.depth_format
    }

    fn frame_types(&self) -> FrameTypes {
        if self.config.with_color {
            FrameTypes::DEPTH | FrameTypes::COLOR
        } else {
            FrameTypes::DEPTH
        }
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

        let capture = CaptureLoop {
            config: self.config.clone(),
            depth_format: self.depth_format,
            color_format: self.color_format,
            depth_pool: self.depth_pool.clone(),
            color_pool: self.color_pool.clone(),
            sink,
            stop_signal: self.stop_signal.clone(),
        };

        let handle = thread::Builder::new()
            .name(format!("synthetic-capture-{}", self.index))
            .spawn(move || capture.run())?;
        self.capture_thread = Some(handle);

        info!(serial = %self.serial, fps = self.config.fps, "Synthetic capture started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.join_capture_thread()
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let stopped = self.join_capture_thread();
        self.sink = None;
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.index);
        stopped
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct CaptureLoop {
    config: SyntheticConfig,
    depth_format: StreamFormat,
    color_format: StreamFormat,
    depth_pool: FramePool,
    color_pool: FramePool,
    sink: FrameSink,
    stop_signal: Arc<AtomicBool>,
}

impl CaptureLoop {
    fn run(self) {
        let period = Duration::from_secs_f64(1.0 / f64::from(self.config.fps.max(1)));
        let started = Instant::now();
        let mut sequence = 0u64;

        while !self.stop_signal.load(Ordering::SeqCst) {
            if self.config.frame_limit.is_some_and(|limit| sequence >= limit) {
                // Simulates an unplugged device: the stream goes quiet.
                thread::sleep(period);
                continue;
            }

            // Device clock in microseconds since stream start.
            let timestamp = started.elapsed().as_micros() as u64;
            self.sink.deliver(self.depth_frame(timestamp, sequence));
            if self.config.with_color {
                self.sink.deliver(self.color_frame(timestamp, sequence));
            }

            sequence += 1;
            thread::sleep(period);
        }

        debug!(frames = sequence, "Synthetic capture loop stopped");
    }

    fn depth_frame(&self, timestamp: u64, sequence: u64) -> RawFrame {
        let fmt = self.depth_format;
        let mut buf = self.depth_pool.acquire();
        let bytes = buf.fill_with(fmt.frame_bytes());
        let sample_bytes = fmt.bytes_per_pixel as usize;

        for (i, px) in bytes.chunks_exact_mut(sample_bytes).enumerate() {
            let x = (i % fmt.width as usize) as u32;
            let y = (i / fmt.width as usize) as u32;
            let mm = synthetic_depth_mm(x, y, sequence);
            match self.config.sample_format {
                SampleFormat::U16 => px.copy_from_slice(&(mm as u16).to_le_bytes()),
                SampleFormat::F32 => px.copy_from_slice(&mm.to_le_bytes()),
            }
        }

        RawFrame::new(FrameKind::Depth, fmt, timestamp, sequence, buf)
    }

    fn color_frame(&self, timestamp: u64, sequence: u64) -> RawFrame {
        let fmt = self.color_format;
        let mut buf = self.color_pool.acquire();
        let bytes = buf.fill_with(fmt.frame_bytes());

        for (i, px) in bytes.chunks_exact_mut(3).enumerate() {
            let x = i % fmt.width as usize;
            let y = i / fmt.width as usize;
            px[0] = (x % 256) as u8;
            px[1] = (y % 256) as u8;
            px[2] = (sequence % 256) as u8;
        }

        RawFrame::new(FrameKind::Color, fmt, timestamp, sequence, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::listener::FrameListener;

    fn config() -> SyntheticConfig {
        SyntheticConfig {
            width: 8,
            height: 4,
            fps: 200,
            ..SyntheticConfig::default()
        }
    }

    #[test]
    fn enumerates_configured_devices() {
        let mut driver = SyntheticDriver::new(
            SyntheticConfig {
                device_count: 3,
                ..config()
            },
            2,
        );
        let devices = driver.enumerate().unwrap();
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[2].index, 2);
        assert_ne!(devices[0].serial, devices[1].serial);
    }

    #[test]
    fn device_can_only_be_claimed_once() {
        let mut driver = SyntheticDriver::new(config(), 2);
        let info = driver.enumerate().unwrap().remove(0);

        let mut first = driver.open(&info).unwrap();
        assert!(matches!(driver.open(&info), Err(DeviceError::Busy(_))));

        first.close().unwrap();
        assert!(driver.open(&info).is_ok());
    }

    #[test]
    fn streams_depth_and_color_frames() {
        let cfg = SyntheticConfig {
            with_color: true,
            color_width: 4,
            color_height: 2,
            ..config()
        };
        let mut driver = SyntheticDriver::new(cfg, 2);
        let info = driver.enumerate().unwrap().remove(0);
        let mut device = driver.open(&info).unwrap();

        let listener = FrameListener::new(device.frame_types());
        device.set_frame_sink(listener.sink());
        device.start().unwrap();

        let bundle = listener.wait_for_frame(Duration::from_secs(2)).unwrap();
        let depth = bundle.depth().unwrap();
        assert_eq!(depth.len(), 8 * 4 * 2);
        let seq = depth.sequence;
        let first = u16::from_le_bytes([depth.data()[0], depth.data()[1]]);
        assert_eq!(first, synthetic_depth_mm(0, 0, seq) as u16);
        assert_eq!(bundle.color().unwrap().len(), 4 * 2 * 3);
        listener.release(bundle);

        device.stop().unwrap();
        device.close().unwrap();
    }

    #[test]
    fn start_without_sink_is_refused() {
        let mut driver = SyntheticDriver::new(config(), 2);
        let info = driver.enumerate().unwrap().remove(0);
        let mut device = driver.open(&info).unwrap();
        assert!(matches!(device.start(), Err(DeviceError::Refused(_))));
    }
}
