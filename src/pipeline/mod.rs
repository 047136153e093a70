pub mod pool;

pub use pool::{FrameBuffer, FramePool};
