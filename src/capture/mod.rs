pub mod device;
pub mod frame;
pub mod pool;
pub mod session;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use device::{DepthDevice, DepthDriver, DeviceInfo};
pub use frame::{FrameBundle, FrameKind, FrameTypes, RawFrame, StreamFormat};
pub use pool::{FramePool, PooledBuffer};
pub use session::{DeviceSession, SessionState};
pub use synthetic::SyntheticDriver;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2DepthDriver;

pub use crate::pipeline::listener::{FrameListener, FrameSink};
