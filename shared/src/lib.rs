//! Shared components for the GPS-triggered acquisition system.
//!
//! Holds the data model that crosses thread boundaries (frames and GPS
//! timestamps), the bounded queues that carry them, the camera driver
//! capability, the preferences store and the log channel consumed by user
//! interfaces.

pub mod camera_interface;
pub mod frame;
#[cfg(feature = "frame-writer")]
pub mod frame_writer;
pub mod log_stream;
pub mod preferences;
pub mod queue;
pub mod timestamp;

pub use frame::{Frame, FrameError};
pub use queue::{BoundedQueue, OverflowPolicy, PushOutcome, DEFAULT_QUEUE_CAPACITY};
pub use timestamp::{Timestamp, TimestampError};
