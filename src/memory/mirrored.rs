//! Depth image kept in a host copy and an accelerator copy.
//!
//! The two copies only converge on an explicit `synchronize_*` call. Without
//! an accelerator both views share the host storage and synchronization does
//! nothing.

use std::collections::TryReserveError;
use std::mem::size_of;

use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::memory::accelerator::{Accelerator, DeviceRegion};
use crate::source::DepthSample;

/// Which copy holds data the other has not seen yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coherence {
    Synchronized,
    AcceleratorAhead,
    HostAhead,
}

pub struct MirroredBuffer<T: DepthSample> {
    width: u32,
    height: u32,
    host: Vec<T>,
    // Download target; swapped with `host` once a transfer completes so the
    // host view never shows a partial frame.
    staging: Vec<T>,
    region: Option<Box<dyn DeviceRegion>>,
    coherence: Coherence,
}

/// Read access to the accelerator-resident copy
pub enum DeviceView<'a, T> {
    /// No accelerator: the host storage doubles as the device copy
    Shared(&'a [T]),
    Region(&'a dyn DeviceRegion),
}

impl<T: DepthSample> MirroredBuffer<T> {
    /// Reserve `width * height` samples on the host and, when given, on the
    /// accelerator. Nothing stays allocated if either reservation fails.
    #[instrument(level = "debug", skip(accelerator))]
    pub fn allocate(
        width: u32,
        height: u32,
        accelerator: Option<&dyn Accelerator>,
    ) -> Result<Self> {
        let len = (width as usize)
            .checked_mul(height as usize)
            .filter(|&n| n > 0 && n.checked_mul(size_of::<T>()).is_some())
            .ok_or_else(|| Error::Allocation {
                bytes: 0,
                region: "host",
                reason: format!("invalid depth image size {}x{}", width, height),
            })?;
        let bytes = len * size_of::<T>();
        let host_err = |e: TryReserveError| Error::Allocation {
            bytes,
            region: "host",
            reason: e.to_string(),
        };

        let host = zeroed::<T>(len).map_err(host_err)?;
        let (staging, region) = match accelerator {
            Some(acc) => {
                let staging = zeroed::<T>(len).map_err(host_err)?;
                let region = acc.allocate(bytes).map_err(|e| Error::Allocation {
                    bytes,
                    region: "accelerator",
                    reason: e.to_string(),
                })?;
                (staging, Some(region))
            }
            None => (Vec::new(), None),
        };

        debug!(bytes, "Allocated mirrored depth buffer");
        Ok(Self {
            width,
            height,
            host,
            staging,
            region,
            coherence: Coherence::Synchronized,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Samples per representation
    pub fn len(&self) -> usize {
        self.host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.host.len() * size_of::<T>()
    }

    pub fn has_accelerator(&self) -> bool {
        self.region.is_some()
    }

    pub fn coherence(&self) -> Coherence {
        self.coherence
    }

    /// Copy a raw frame into the accelerator copy
    pub fn write_accelerator(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_size(bytes.len())?;
        match self.region.as_mut() {
            Some(region) => {
                region.upload(bytes)?;
                self.coherence = Coherence::AcceleratorAhead;
            }
            None => {
                bytemuck::cast_slice_mut::<T, u8>(&mut self.host).copy_from_slice(bytes);
                self.coherence = Coherence::Synchronized;
            }
        }
        Ok(())
    }

    /// Copy a raw frame into the host copy
    pub fn write_host(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_size(bytes.len())?;
        bytemuck::cast_slice_mut::<T, u8>(&mut self.host).copy_from_slice(bytes);
        self.coherence = if self.region.is_some() {
            Coherence::HostAhead
        } else {
            Coherence::Synchronized
        };
        Ok(())
    }

    /// Blocking accelerator → host copy. On failure the host copy keeps the
    /// previous complete frame.
    pub fn synchronize_to_host(&mut self) -> Result<()> {
        let Some(region) = self.region.as_ref() else {
            return Ok(());
        };

        region.download(bytemuck::cast_slice_mut::<T, u8>(&mut self.staging))?;
        std::mem::swap(&mut self.host, &mut self.staging);
        self.coherence = Coherence::Synchronized;
        Ok(())
    }

    /// Blocking host → accelerator copy
    pub fn synchronize_to_accelerator(&mut self) -> Result<()> {
        let Some(region) = self.region.as_mut() else {
            return Ok(());
        };

        region.upload(bytemuck::cast_slice::<T, u8>(&self.host))?;
        self.coherence = Coherence::Synchronized;
        Ok(())
    }

    pub fn host_view(&self) -> &[T] {
        &self.host
    }

    pub fn host_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.host)
    }

    pub fn accelerator_view(&self) -> DeviceView<'_, T> {
        match self.region.as_deref() {
            Some(region) => DeviceView::Region(region),
            None => DeviceView::Shared(&self.host),
        }
    }

    fn check_size(&self, actual: usize) -> Result<()> {
        let expected = self.byte_len();
        if actual != expected {
            return Err(Error::SizeMismatch { expected, actual });
        }
        Ok(())
    }
}

impl<'a, T: DepthSample> DeviceView<'a, T> {
    pub fn is_shared(&self) -> bool {
        matches!(self, DeviceView::Shared(_))
    }

    pub fn region(&self) -> Option<&'a dyn DeviceRegion> {
        match self {
            DeviceView::Region(region) => Some(*region),
            DeviceView::Shared(_) => None,
        }
    }

    /// Copy the device-resident samples back to the host
    pub fn read_back(&self) -> Result<Vec<T>> {
        match self {
            DeviceView::Shared(samples) => Ok(samples.to_vec()),
            DeviceView::Region(region) => {
                let mut out = zeroed::<T>(region.len() / size_of::<T>()).map_err(|e| {
                    Error::Allocation {
                        bytes: region.len(),
                        region: "host",
                        reason: e.to_string(),
                    }
                })?;
                region.download(bytemuck::cast_slice_mut::<T, u8>(&mut out))?;
                Ok(out)
            }
        }
    }
}

fn zeroed<T: DepthSample>(len: usize) -> std::result::Result<Vec<T>, TryReserveError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)?;
    v.resize(len, T::zeroed());
    Ok(v)
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::AcceleratorError;
    use crate::memory::accelerator::check_len;

    struct HeapAccelerator {
        limit: usize,
        fail_download: Arc<AtomicBool>,
    }

    impl HeapAccelerator {
        fn new(limit: usize) -> Self {
            Self {
                limit,
                fail_download: Arc::default(),
            }
        }
    }

    struct HeapRegion {
        data: Vec<u8>,
        fail_download: Arc<AtomicBool>,
    }

    impl Accelerator for HeapAccelerator {
        fn name(&self) -> &str {
            "heap"
        }

        fn allocate(&self, len: usize) -> std::result::Result<Box<dyn DeviceRegion>, AcceleratorError> {
            if len > self.limit {
                return Err(AcceleratorError::OutOfMemory { requested: len });
            }
            Ok(Box::new(HeapRegion {
                data: vec![0; len],
                fail_download: self.fail_download.clone(),
            }))
        }
    }

    impl DeviceRegion for HeapRegion {
        fn len(&self) -> usize {
            self.data.len()
        }

        fn upload(&mut self, bytes: &[u8]) -> std::result::Result<(), AcceleratorError> {
            check_len(self.data.len(), bytes.len())?;
            self.data.copy_from_slice(bytes);
            Ok(())
        }

        fn download(&self, out: &mut [u8]) -> std::result::Result<(), AcceleratorError> {
            check_len(self.data.len(), out.len())?;
            if self.fail_download.load(Ordering::SeqCst) {
                // Partial copy before failing.
                out[..1].copy_from_slice(&self.data[..1]);
                return Err(AcceleratorError::Transfer("link reset".into()));
            }
            out.copy_from_slice(&self.data);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn frame(w: u32, h: u32, base: u16) -> Vec<u8> {
        (0..w * h)
            .flat_map(|i| (base + i as u16).to_le_bytes())
            .collect()
    }

    #[test]
    fn host_only_views_share_storage() {
        let mut buf = MirroredBuffer::<u16>::allocate(4, 2, None).unwrap();
        assert!(!buf.has_accelerator());

        buf.write_accelerator(&frame(4, 2, 100)).unwrap();
        assert_eq!(buf.coherence(), Coherence::Synchronized);
        assert_eq!(buf.host_view()[3], 103);

        buf.synchronize_to_host().unwrap();
        let view = buf.accelerator_view();
        assert!(view.is_shared());
        assert_eq!(view.read_back().unwrap(), buf.host_view());
    }

    #[test]
    fn accelerator_write_is_invisible_until_sync() {
        let acc = HeapAccelerator::new(1 << 20);
        let mut buf = MirroredBuffer::<u16>::allocate(4, 2, Some(&acc)).unwrap();

        buf.write_accelerator(&frame(4, 2, 7)).unwrap();
        assert_eq!(buf.coherence(), Coherence::AcceleratorAhead);
        assert!(buf.host_view().iter().all(|&s| s == 0));

        buf.synchronize_to_host().unwrap();
        assert_eq!(buf.coherence(), Coherence::Synchronized);
        assert_eq!(buf.host_bytes(), frame(4, 2, 7).as_slice());
        assert_eq!(
            buf.accelerator_view().read_back().unwrap(),
            buf.host_view()
        );
    }

    #[test]
    fn host_write_reaches_accelerator_on_sync() {
        let acc = HeapAccelerator::new(1 << 20);
        let mut buf = MirroredBuffer::<u16>::allocate(2, 2, Some(&acc)).unwrap();

        buf.write_host(&frame(2, 2, 40)).unwrap();
        assert_eq!(buf.coherence(), Coherence::HostAhead);
        buf.synchronize_to_accelerator().unwrap();

        assert_eq!(buf.accelerator_view().read_back().unwrap(), vec![40, 41, 42, 43]);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let acc = HeapAccelerator::new(1 << 20);
        let (w, h) = (8u32, 6u32);
        let mut buf = MirroredBuffer::<f32>::allocate(w, h, Some(&acc)).unwrap();
        let expected = (w * h) as usize * size_of::<f32>();

        let err = buf.write_accelerator(&vec![0u8; expected + 1]).unwrap_err();
        assert!(matches!(
            err,
            Error::SizeMismatch { expected: e, actual: a } if e == expected && a == expected + 1
        ));
        assert_eq!(buf.coherence(), Coherence::Synchronized);
    }

    #[test]
    fn accelerator_exhaustion_fails_whole_allocation() {
        let acc = HeapAccelerator::new(16);
        let err = MirroredBuffer::<u16>::allocate(512, 424, Some(&acc)).err().unwrap();
        assert!(matches!(err, Error::Allocation { region: "accelerator", .. }));
    }

    #[test]
    fn zero_sized_image_is_rejected() {
        assert!(matches!(
            MirroredBuffer::<u16>::allocate(0, 424, None),
            Err(Error::Allocation { .. })
        ));
    }

    #[test]
    fn failed_sync_keeps_previous_frame() {
        let acc = HeapAccelerator::new(1 << 20);
        let fail = acc.fail_download.clone();
        let mut buf = MirroredBuffer::<u16>::allocate(4, 1, Some(&acc)).unwrap();

        buf.write_accelerator(&frame(4, 1, 10)).unwrap();
        buf.synchronize_to_host().unwrap();

        buf.write_accelerator(&frame(4, 1, 90)).unwrap();
        fail.store(true, Ordering::SeqCst);
        assert!(buf.synchronize_to_host().is_err());
        assert_eq!(buf.host_view(), &[10, 11, 12, 13]);
        assert_eq!(buf.coherence(), Coherence::AcceleratorAhead);
    }
}
