//! GPS-triggered CCD acquisition.
//!
//! A camera worker and a timer worker each own one device on their own
//! thread. The [`coordinator::Coordinator`] runs on the main thread, pairs
//! each frame read out by the camera with the trigger time reported by the
//! timer and delivers the pair to a [`delivery::FrameSink`].
//!
//! All cross-thread state lives in one [`context::AcquisitionContext`].

pub mod camera_worker;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod delivery;
pub mod fatal;
pub mod logging;
pub mod modes;
pub mod timer_worker;

pub use context::AcquisitionContext;
pub use coordinator::{
    CommandOutcome, CommandRejected, Coordinator, CoordinatorConfig, CoreState, RunOutcome,
    ShutdownReport, UiCommand,
};
pub use modes::{CameraMode, DesiredMode, TimerMode};
