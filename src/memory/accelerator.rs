use std::any::Any;

use crate::error::AcceleratorError;

/// Allocator for memory in a co-processor's address space
pub trait Accelerator: Send + Sync {
    fn name(&self) -> &str;

    /// Reserve a region of `len` bytes. Either the whole region is
    /// reserved or an error is returned.
    fn allocate(&self, len: usize) -> Result<Box<dyn DeviceRegion>, AcceleratorError>;
}

/// A fixed-size block of accelerator memory.
///
/// Transfers are blocking: when `upload` or `download` returns, the copy
/// has completed.
pub trait DeviceRegion: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host → accelerator. `bytes.len()` must equal `len()`.
    fn upload(&mut self, bytes: &[u8]) -> Result<(), AcceleratorError>;

    /// Accelerator → host. `out.len()` must equal `len()`.
    fn download(&self, out: &mut [u8]) -> Result<(), AcceleratorError>;

    /// Backend handle access, e.g. the `wgpu::Buffer` behind a GPU region
    fn as_any(&self) -> &dyn Any;
}

pub(crate) fn check_len(capacity: usize, len: usize) -> Result<(), AcceleratorError> {
    if capacity != len {
        return Err(AcceleratorError::RegionSize { capacity, len });
    }
    Ok(())
}
