use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::pool::PooledBuffer;

/// Kind of image a device pushes to its listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    Depth,
    Color,
}

/// Set of frame kinds a listener subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameTypes(u8);

impl FrameTypes {
    pub const NONE: FrameTypes = FrameTypes(0);
    pub const DEPTH: FrameTypes = FrameTypes(1);
    pub const COLOR: FrameTypes = FrameTypes(1 << 1);

    pub fn contains(self, kind: FrameKind) -> bool {
        self.0 & Self::from(kind).0 != 0
    }

    pub fn is_superset(self, other: FrameTypes) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<FrameKind> for FrameTypes {
    fn from(kind: FrameKind) -> Self {
        match kind {
            FrameKind::Depth => FrameTypes::DEPTH,
            FrameKind::Color => FrameTypes::COLOR,
        }
    }
}

impl BitOr for FrameTypes {
    type Output = FrameTypes;

    fn bitor(self, rhs: FrameTypes) -> FrameTypes {
        FrameTypes(self.0 | rhs.0)
    }
}

impl BitOr<FrameKind> for FrameTypes {
    type Output = FrameTypes;

    fn bitor(self, rhs: FrameKind) -> FrameTypes {
        self | FrameTypes::from(rhs)
    }
}

/// Geometry of one stream as produced by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
}

impl StreamFormat {
    pub fn new(width: u32, height: u32, bytes_per_pixel: u32) -> Self {
        Self {
            width,
            height,
            bytes_per_pixel,
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel as usize
    }
}

/// One capture unit pushed by a device's capture thread.
///
/// The payload lives in a buffer borrowed from the device's frame pool and
/// goes back to it when the frame is dropped.
pub struct RawFrame {
    pub kind: FrameKind,
    pub format: StreamFormat,
    /// Device clock, not wall clock. Non-decreasing per stream.
    pub timestamp: u64,
    /// Arrival order assigned by the device.
    pub sequence: u64,
    data: PooledBuffer,
}

impl RawFrame {
    pub fn new(
        kind: FrameKind,
        format: StreamFormat,
        timestamp: u64,
        sequence: u64,
        data: PooledBuffer,
    ) -> Self {
        Self {
            kind,
            format,
            timestamp,
            sequence,
            data,
        }
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("kind", &self.kind)
            .field("format", &self.format)
            .field("timestamp", &self.timestamp)
            .field("sequence", &self.sequence)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Depth frame plus optional color frame handed out by the listener.
///
/// Holding a bundle keeps its buffers out of the device pool. Passing it to
/// `FrameListener::release` (or dropping it) hands them back; the payload
/// cannot be reached afterwards.
#[derive(Debug)]
pub struct FrameBundle {
    pub(crate) depth: Option<RawFrame>,
    pub(crate) color: Option<RawFrame>,
    pub(crate) lease: Option<Lease>,
}

impl FrameBundle {
    pub(crate) fn new(depth: Option<RawFrame>, color: Option<RawFrame>) -> Self {
        Self {
            depth,
            color,
            lease: None,
        }
    }

    pub fn depth(&self) -> Option<&RawFrame> {
        self.depth.as_ref()
    }

    pub fn color(&self) -> Option<&RawFrame> {
        self.color.as_ref()
    }

    /// Latest device timestamp across the frames in this bundle
    pub fn timestamp(&self) -> Option<u64> {
        self.depth
            .iter()
            .chain(self.color.iter())
            .map(|f| f.timestamp)
            .max()
    }
}

/// Marks a bundle as checked out by the consumer until dropped
#[derive(Debug)]
pub(crate) struct Lease(Arc<AtomicBool>);

impl Lease {
    pub(crate) fn take(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Lease(flag.clone()))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_masks() {
        let both = FrameTypes::DEPTH | FrameKind::Color;
        assert!(both.contains(FrameKind::Depth));
        assert!(both.contains(FrameKind::Color));
        assert!(both.is_superset(FrameTypes::DEPTH));
        assert!(!FrameTypes::DEPTH.is_superset(both));
        assert!(FrameTypes::NONE.is_empty());
    }

    #[test]
    fn lease_is_exclusive_until_dropped() {
        let flag = Arc::new(AtomicBool::new(false));
        let first = Lease::take(&flag).unwrap();
        assert!(Lease::take(&flag).is_none());
        drop(first);
        assert!(Lease::take(&flag).is_some());
    }

    #[test]
    fn stream_format_size() {
        assert_eq!(StreamFormat::new(512, 424, 4).frame_bytes(), 512 * 424 * 4);
    }
}
