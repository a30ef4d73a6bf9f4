pub mod listener;

pub use listener::{FrameListener, FrameSink, ListenerStats};
