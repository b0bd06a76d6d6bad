//! State shared between the coordinator and the two device workers.
//!
//! One [`AcquisitionContext`] is created at startup and handed to every
//! thread behind an `Arc`; nothing here is global.

use crate::fatal::FatalError;
use crate::modes::{CameraMode, DesiredMode, ModeCell, TimerMode};
use crossbeam_channel::{Receiver, Sender};
use hardware::timer::{GpsStatus, TimerCommand};
use shared::camera_interface::{
    AcquisitionSettings, DriverError, PortCatalog, ReadoutGeometry,
};
use shared::log_stream::LogBroadcaster;
use shared::{BoundedQueue, Frame, OverflowPolicy, Timestamp, DEFAULT_QUEUE_CAPACITY};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Commands waiting to be sent to the timer
pub const TIMER_COMMAND_CAPACITY: usize = 16;

/// Settings the camera worker ended up committing
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedSettings {
    /// Settings after index validation and exposure clamping
    pub settings: AcquisitionSettings,
    pub geometry: ReadoutGeometry,
    /// One line per value the worker had to change
    pub adjustments: Vec<String>,
}

pub type SettingsReply = Result<AppliedSettings, DriverError>;

/// A settings update for the camera worker to apply while idle
#[derive(Debug)]
pub struct SettingsRequest {
    pub settings: AcquisitionSettings,
    pub reply: Sender<SettingsReply>,
}

/// Camera state published by the camera worker
#[derive(Debug, Clone, Default)]
pub struct CameraTelemetry {
    pub name: String,
    pub simulated: bool,
    pub temperature: Option<f64>,
    pub settings: Option<AcquisitionSettings>,
    pub geometry: Option<ReadoutGeometry>,
    pub catalog: Option<PortCatalog>,
}

/// Timer state published by the timer worker
#[derive(Debug, Clone, Default)]
pub struct TimerTelemetry {
    pub name: String,
    pub gps_status: GpsStatus,
    pub current_time: Timestamp,
    pub download_time: Timestamp,
}

pub struct AcquisitionContext {
    pub frames: BoundedQueue<Frame>,
    pub timestamps: BoundedQueue<Timestamp>,
    pub timer_commands: BoundedQueue<TimerCommand>,

    pub camera_desired: ModeCell<DesiredMode>,
    pub camera_mode: ModeCell<CameraMode>,
    pub timer_desired: ModeCell<DesiredMode>,
    pub timer_mode: ModeCell<TimerMode>,
    pub fatal: FatalError,

    /// Seconds between triggers for the sequence being started
    trigger_interval: AtomicU16,
    triggers_seen: AtomicU64,
    frames_acquired: AtomicU64,

    settings_tx: Sender<SettingsRequest>,
    settings_rx: Receiver<SettingsRequest>,

    camera: Mutex<CameraTelemetry>,
    timer: Mutex<TimerTelemetry>,

    pub logs: Arc<LogBroadcaster>,
}

impl AcquisitionContext {
    pub fn new(queue_capacity: usize, logs: Arc<LogBroadcaster>) -> Self {
        let (settings_tx, settings_rx) = crossbeam_channel::bounded(1);
        Self {
            frames: BoundedQueue::new(queue_capacity, OverflowPolicy::DropOldest),
            timestamps: BoundedQueue::new(queue_capacity, OverflowPolicy::DropOldest),
            timer_commands: BoundedQueue::new(TIMER_COMMAND_CAPACITY, OverflowPolicy::RejectNewest),
            camera_desired: ModeCell::new(DesiredMode::Idle),
            camera_mode: ModeCell::new(CameraMode::Initialising),
            timer_desired: ModeCell::new(DesiredMode::Idle),
            timer_mode: ModeCell::new(TimerMode::Idle),
            fatal: FatalError::new(),
            trigger_interval: AtomicU16::new(1),
            triggers_seen: AtomicU64::new(0),
            frames_acquired: AtomicU64::new(0),
            settings_tx,
            settings_rx,
            camera: Mutex::new(CameraTelemetry::default()),
            timer: Mutex::new(TimerTelemetry::default()),
            logs,
        }
    }

    pub fn camera_should_stop(&self) -> bool {
        self.fatal.is_raised() || self.camera_desired.load() == DesiredMode::Shutdown
    }

    pub fn timer_should_stop(&self) -> bool {
        self.fatal.is_raised() || self.timer_desired.load() == DesiredMode::Shutdown
    }

    pub fn set_trigger_interval(&self, seconds: u16) {
        self.trigger_interval.store(seconds.max(1), Ordering::Release);
    }

    pub fn trigger_interval(&self) -> u16 {
        self.trigger_interval.load(Ordering::Acquire)
    }

    /// Timer worker: a trigger fired and its frame is now reading out
    pub fn note_trigger(&self) {
        self.triggers_seen.fetch_add(1, Ordering::AcqRel);
    }

    /// Camera worker: a frame arrived.
    ///
    /// The frame count never falls behind the trigger count after a frame,
    /// so a trigger whose frame was lost does not leave the camera marked as
    /// downloading forever.
    pub fn note_frame(&self) {
        let triggers = self.triggers_seen.load(Ordering::Acquire);
        let frames = self.frames_acquired.load(Ordering::Acquire);
        self.frames_acquired
            .store((frames + 1).max(triggers), Ordering::Release);
    }

    /// Camera worker: forget outstanding triggers at sequence boundaries
    pub fn reset_download_tracking(&self) {
        let triggers = self.triggers_seen.load(Ordering::Acquire);
        self.frames_acquired.store(triggers, Ordering::Release);
    }

    /// True between a trigger and the arrival of its frame
    pub fn camera_downloading(&self) -> bool {
        self.triggers_seen.load(Ordering::Acquire) > self.frames_acquired.load(Ordering::Acquire)
    }

    pub fn settings_sender(&self) -> &Sender<SettingsRequest> {
        &self.settings_tx
    }

    pub fn settings_receiver(&self) -> &Receiver<SettingsRequest> {
        &self.settings_rx
    }

    pub fn camera_telemetry(&self) -> MutexGuard<'_, CameraTelemetry> {
        self.camera
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn timer_telemetry(&self) -> MutexGuard<'_, TimerTelemetry> {
        self.timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for AcquisitionContext {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, Arc::new(LogBroadcaster::default()))
    }
}
