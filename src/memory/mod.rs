pub mod accelerator;
pub mod gpu;
pub mod mirrored;

pub use accelerator::{Accelerator, DeviceRegion};
pub use gpu::{WgpuAccelerator, WgpuRegion};
pub use mirrored::{Coherence, DeviceView, MirroredBuffer};
