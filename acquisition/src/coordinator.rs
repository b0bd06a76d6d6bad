//! Coordinator main loop.
//!
//! Runs on the main thread at roughly 10 Hz. Each iteration it checks the
//! fatal-error cell, services UI commands, pairs queued frames with queued
//! trigger timestamps and hands the pairs to the [`FrameSink`]. It never
//! blocks on a queue.

use crate::camera_worker::{CameraWorker, CameraWorkerConfig};
use crate::context::{AcquisitionContext, AppliedSettings, SettingsRequest};
use crate::delivery::{DeliveryHooks, FrameMetadata, FrameSink};
use crate::modes::{CameraMode, DesiredMode, TimerMode};
use crate::timer_worker::{TimerWorker, TimerWorkerConfig};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, TryRecvError};
use hardware::timer::{TimerCommand, TimerLink};
use serde::Serialize;
use shared::camera_interface::{clamp_exposure, AcquisitionSettings, CameraDriver, DriverError};
use shared::log_stream::LogEntry;
use shared::preferences::{FrameType, PreferenceError, PreferenceStore};
use shared::{Frame, PushOutcome, Timestamp};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// Requests from the user interface
#[derive(Debug, Clone, PartialEq)]
pub enum UiCommand {
    StartExposure { seconds: u16, use_monitor: bool },
    /// Start with the exposure and monitor flag from the committed settings
    StartFromPreferences,
    StopExposure,
    ApplySettings(AcquisitionSettings),
    ToggleSave,
    SetFrameType(FrameType),
    ReportStatus,
    Shutdown,
}

#[derive(Debug, Error)]
pub enum CommandRejected {
    #[error("Cannot start exposures: camera is {camera:?}, timer is {timer:?}.")]
    NotIdle { camera: CameraMode, timer: TimerMode },
    #[error("Cannot change camera parameters while acquiring.")]
    CameraBusy,
    #[error("Camera did not respond to the settings change.")]
    SettingsTimeout,
    #[error("Camera rejected the settings: {0}")]
    Settings(#[from] DriverError),
    #[error(transparent)]
    Preferences(#[from] PreferenceError),
    #[error("Timer command buffer is full.")]
    TimerBusy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Started { seconds: u16 },
    Stopped,
    AlreadyStopped,
    Applied(AppliedSettings),
    SaveToggled(bool),
    FrameTypeSet(FrameType),
    Status(Box<CoreState>),
    ShuttingDown,
}

/// Counters kept by the delivery path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub saved: u64,
    pub without_timestamp: u64,
    pub save_failures: u64,
}

/// Read model for user interfaces
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoreState {
    pub camera_mode: CameraMode,
    pub camera_desired: DesiredMode,
    pub timer_mode: TimerMode,
    pub camera_name: String,
    pub camera_simulated: bool,
    pub camera_temperature: Option<f64>,
    pub readout_time_seconds: Option<f64>,
    pub frame_size: Option<(u16, u16)>,
    pub settings: AcquisitionSettings,
    pub timer_name: String,
    pub gps_status: String,
    pub current_time: Timestamp,
    pub download_time: Timestamp,
    pub frames_queued: usize,
    pub timestamps_queued: usize,
    /// Lost to queue overflow since startup
    pub frames_dropped: u64,
    pub timestamps_dropped: u64,
    pub delivery: DeliveryStats,
    pub frame_type: FrameType,
    pub run_number: u32,
    pub save_frames: bool,
    pub allow_save: bool,
    pub burst_countdown: u32,
    pub next_archive: PathBuf,
    pub fatal_error: Option<String>,
}

impl CoreState {
    /// One-line summary for logs and the console
    pub fn summary(&self) -> String {
        format!(
            "camera {:?}, timer {:?}, GPS {} ({}), run {:04}, saving {}, {} delivered, {} queued, {} dropped",
            self.camera_mode,
            self.timer_mode,
            self.gps_status,
            self.current_time,
            self.run_number,
            if self.save_frames { "on" } else { "off" },
            self.delivery.delivered,
            self.frames_queued,
            self.frames_dropped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub discarded_frames: usize,
    pub discarded_timestamps: usize,
    /// Both workers finished within the join timeout
    pub workers_joined: bool,
    pub fatal_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub report: ShutdownReport,
    pub delivery: DeliveryStats,
}

impl RunOutcome {
    pub fn exit_code(&self) -> u8 {
        if self.report.fatal_error.is_some() || !self.report.workers_joined {
            1
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinatorConfig {
    pub tick: Duration,
    pub join_timeout: Duration,
    /// How long `ApplySettings` waits for the camera worker
    pub settings_timeout: Duration,
    /// Start exposures as soon as both devices are idle
    pub autostart: bool,
    pub camera: CameraWorkerConfig,
    pub timer: TimerWorkerConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            join_timeout: Duration::from_secs(2),
            settings_timeout: Duration::from_secs(2),
            autostart: false,
            camera: CameraWorkerConfig::default(),
            timer: TimerWorkerConfig::default(),
        }
    }
}

pub struct Coordinator {
    ctx: Arc<AcquisitionContext>,
    prefs: Arc<PreferenceStore>,
    sink: Box<dyn FrameSink>,
    hooks: Box<dyn DeliveryHooks>,
    config: CoordinatorConfig,
    camera: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    stats: DeliveryStats,
    autostart_pending: bool,
    shutdown_requested: bool,
}

impl Coordinator {
    /// Spawn both device workers and return the coordinator that drives them.
    pub fn launch(
        ctx: Arc<AcquisitionContext>,
        prefs: Arc<PreferenceStore>,
        camera: Box<dyn CameraDriver>,
        timer: Box<dyn TimerLink>,
        sink: Box<dyn FrameSink>,
        hooks: Box<dyn DeliveryHooks>,
        config: CoordinatorConfig,
    ) -> io::Result<Self> {
        let camera = CameraWorker::new(
            camera,
            Arc::clone(&ctx),
            prefs.acquisition_settings(),
            config.camera,
        )
        .spawn()?;
        let timer = match TimerWorker::new(timer, Arc::clone(&ctx), config.timer).spawn() {
            Ok(handle) => handle,
            Err(e) => {
                ctx.camera_desired.store(DesiredMode::Shutdown);
                let _ = camera.join();
                return Err(e);
            }
        };

        Ok(Self {
            ctx,
            prefs,
            sink,
            hooks,
            config,
            camera: Some(camera),
            timer: Some(timer),
            stats: DeliveryStats::default(),
            autostart_pending: config.autostart,
            shutdown_requested: false,
        })
    }

    pub fn context(&self) -> &Arc<AcquisitionContext> {
        &self.ctx
    }

    pub fn subscribe_logs(&self) -> Receiver<LogEntry> {
        self.ctx.logs.subscribe()
    }

    pub fn stats(&self) -> DeliveryStats {
        self.stats
    }

    /// Run until a shutdown command, a closed command channel or a fatal
    /// error, then shut the workers down.
    pub fn run(mut self, commands: Receiver<UiCommand>) -> RunOutcome {
        while !self.shutdown_requested {
            loop {
                match commands.try_recv() {
                    Ok(command) => {
                        // Rejections are already logged
                        let _ = self.handle(command);
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        info!("Command channel closed");
                        self.shutdown_requested = true;
                        break;
                    }
                }
            }
            if self.shutdown_requested || !self.tick() {
                break;
            }
            thread::sleep(self.config.tick);
        }

        let report = self.shutdown();
        RunOutcome {
            report,
            delivery: self.stats,
        }
    }

    /// One iteration of the main loop. Returns false once a fatal error has
    /// been raised.
    pub fn tick(&mut self) -> bool {
        if let Some(message) = self.ctx.fatal.message() {
            error!("Shutting down after fatal error: {message}");
            return false;
        }

        if self.autostart_pending
            && self.ctx.camera_mode.load() == CameraMode::Idle
            && self.ctx.timer_mode.load() == TimerMode::Idle
        {
            self.autostart_pending = false;
            let _ = self.handle(UiCommand::StartFromPreferences);
        }

        self.deliver_pending();
        true
    }

    /// Deliver every frame currently queued
    pub fn deliver_pending(&mut self) -> usize {
        let mut delivered = 0;
        while let Some(frame) = self.ctx.frames.try_pop() {
            self.deliver(frame);
            delivered += 1;
        }
        delivered
    }

    fn deliver(&mut self, frame: Frame) {
        let timestamp = match self.ctx.timestamps.try_pop() {
            Some(timestamp) => timestamp,
            None => {
                warn!("Unexpected download - no timestamp available for frame");
                self.stats.without_timestamp += 1;
                Timestamp::invalid()
            }
        };
        info!("Frame downloaded");

        let prefs = self.prefs.snapshot();
        let camera = self.ctx.camera_telemetry().name.clone();
        let metadata = FrameMetadata::new(
            &prefs,
            &frame,
            timestamp,
            self.ctx.trigger_interval(),
            &camera,
        );

        match self.sink.write_preview(&frame, &metadata) {
            Ok(path) => self.hooks.preview_written(&path),
            Err(e) => warn!("Failed to write preview: {e:#}"),
        }
        self.stats.delivered += 1;

        if !(prefs.save_frames && prefs.allow_save()) {
            return;
        }
        match self.sink.archive(&frame, &metadata, &prefs.archive_path()) {
            Ok(path) => {
                if let Err(e) = self.prefs.increment_run_number() {
                    warn!("Failed to record run number: {e}");
                }
                self.stats.saved += 1;
                info!("Saved {}", path.display());
                self.hooks.frame_saved(&path);
            }
            Err(e) => {
                warn!("Save failed. Discarding frame: {e:#}");
                self.stats.save_failures += 1;
            }
        }
    }

    /// Apply a UI command. Rejections are logged and returned.
    pub fn handle(&mut self, command: UiCommand) -> Result<CommandOutcome, CommandRejected> {
        let result = self.dispatch(command);
        if let Err(rejected) = &result {
            warn!("{rejected}");
        }
        result
    }

    fn dispatch(&mut self, command: UiCommand) -> Result<CommandOutcome, CommandRejected> {
        match command {
            UiCommand::StartExposure {
                seconds,
                use_monitor,
            } => self.start_exposure(seconds, use_monitor),
            UiCommand::StartFromPreferences => {
                let settings = self
                    .ctx
                    .camera_telemetry()
                    .settings
                    .unwrap_or_else(|| self.prefs.acquisition_settings());
                self.start_exposure(settings.exposure_seconds, settings.monitor_logic_output)
            }
            UiCommand::StopExposure => self.stop_exposure(),
            UiCommand::ApplySettings(settings) => self.apply_settings(settings),
            UiCommand::ToggleSave => {
                let saving = self.prefs.toggle_save()?;
                info!("Saving {}", if saving { "enabled" } else { "disabled" });
                Ok(CommandOutcome::SaveToggled(saving))
            }
            UiCommand::SetFrameType(frame_type) => {
                self.prefs.set_frame_type(frame_type)?;
                info!("Frame type set to {frame_type:?}");
                Ok(CommandOutcome::FrameTypeSet(frame_type))
            }
            UiCommand::ReportStatus => {
                let state = self.snapshot();
                info!("Status: {}", state.summary());
                Ok(CommandOutcome::Status(Box::new(state)))
            }
            UiCommand::Shutdown => {
                self.shutdown_requested = true;
                Ok(CommandOutcome::ShuttingDown)
            }
        }
    }

    fn start_exposure(
        &mut self,
        seconds: u16,
        use_monitor: bool,
    ) -> Result<CommandOutcome, CommandRejected> {
        let camera = self.ctx.camera_mode.load();
        let timer = self.ctx.timer_mode.load();
        if camera != CameraMode::Idle || timer != TimerMode::Idle {
            return Err(CommandRejected::NotIdle { camera, timer });
        }

        let readout = self
            .ctx
            .camera_telemetry()
            .geometry
            .map(|g| g.readout_time)
            .unwrap_or_default();
        let clamped = clamp_exposure(seconds, readout);
        if clamped != seconds {
            info!("Increasing EXPOSURE_TIME to {clamped} seconds.");
        }

        // Timestamps left over from a previous sequence would pair with the
        // wrong frames
        let stale = self.ctx.timestamps.drain().len();
        if stale > 0 {
            warn!("Discarding {stale} stale timestamps");
        }

        self.ctx.set_trigger_interval(clamped);
        let start = TimerCommand::StartExposure {
            seconds: clamped,
            use_monitor,
        };
        if let PushOutcome::Rejected(_) = self.ctx.timer_commands.push(start) {
            return Err(CommandRejected::TimerBusy);
        }
        self.ctx.camera_desired.store(DesiredMode::Acquiring);
        info!("Starting {clamped} second exposures");
        Ok(CommandOutcome::Started { seconds: clamped })
    }

    fn stop_exposure(&mut self) -> Result<CommandOutcome, CommandRejected> {
        let timer = self.ctx.timer_mode.load();
        if self.ctx.camera_desired.load() != DesiredMode::Acquiring
            && !timer.is_exposing()
            && timer != TimerMode::Align
        {
            return Ok(CommandOutcome::AlreadyStopped);
        }

        // Stop the trigger before disarming the camera
        if let PushOutcome::Rejected(_) = self.ctx.timer_commands.push(TimerCommand::StopExposure)
        {
            return Err(CommandRejected::TimerBusy);
        }
        self.ctx.camera_desired.store(DesiredMode::Idle);
        info!("Stopping exposures");
        Ok(CommandOutcome::Stopped)
    }

    fn apply_settings(
        &mut self,
        settings: AcquisitionSettings,
    ) -> Result<CommandOutcome, CommandRejected> {
        if self.ctx.camera_mode.load() != CameraMode::Idle
            || self.ctx.camera_desired.load() != DesiredMode::Idle
        {
            return Err(CommandRejected::CameraBusy);
        }

        let (reply, replies) = crossbeam_channel::bounded(1);
        let request = SettingsRequest { settings, reply };
        match self
            .ctx
            .settings_sender()
            .send_timeout(request, self.config.settings_timeout)
        {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) | Err(SendTimeoutError::Disconnected(_)) => {
                return Err(CommandRejected::SettingsTimeout)
            }
        }

        let applied = match replies.recv_timeout(self.config.settings_timeout) {
            Ok(result) => result?,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                return Err(CommandRejected::SettingsTimeout)
            }
        };
        self.prefs.set_acquisition_settings(applied.settings)?;
        info!("Camera settings applied");
        Ok(CommandOutcome::Applied(applied))
    }

    pub fn snapshot(&self) -> CoreState {
        let prefs = self.prefs.snapshot();
        let camera = self.ctx.camera_telemetry().clone();
        let timer = self.ctx.timer_telemetry().clone();
        CoreState {
            camera_mode: self.ctx.camera_mode.load(),
            camera_desired: self.ctx.camera_desired.load(),
            timer_mode: self.ctx.timer_mode.load(),
            camera_name: camera.name,
            camera_simulated: camera.simulated,
            camera_temperature: camera.temperature,
            readout_time_seconds: camera.geometry.map(|g| g.readout_time.as_secs_f64()),
            frame_size: camera.geometry.map(|g| (g.width, g.height)),
            settings: camera.settings.unwrap_or(prefs.camera),
            timer_name: timer.name,
            gps_status: format!("{:?}", timer.gps_status),
            current_time: timer.current_time,
            download_time: timer.download_time,
            frames_queued: self.ctx.frames.len(),
            timestamps_queued: self.ctx.timestamps.len(),
            frames_dropped: self.ctx.frames.dropped_total(),
            timestamps_dropped: self.ctx.timestamps.dropped_total(),
            delivery: self.stats,
            frame_type: prefs.frame_type,
            run_number: prefs.run_number,
            save_frames: prefs.save_frames,
            allow_save: prefs.allow_save(),
            burst_countdown: prefs.burst_countdown,
            next_archive: prefs.archive_path(),
            fatal_error: self.ctx.fatal.message(),
        }
    }

    /// Stop both workers and free anything still queued.
    pub fn shutdown(&mut self) -> ShutdownReport {
        info!("Shutting down");
        self.ctx.timer_desired.store(DesiredMode::Shutdown);
        self.ctx.camera_desired.store(DesiredMode::Shutdown);

        let deadline = Instant::now() + self.config.join_timeout;
        let camera_joined = join_before(self.camera.take(), deadline, "Camera");
        let timer_joined = join_before(self.timer.take(), deadline, "Timer");

        let frames = self.ctx.frames.drain();
        for _ in &frames {
            info!("Discarding queued framedata");
        }
        let timestamps = self.ctx.timestamps.drain();
        for _ in &timestamps {
            info!("Discarding queued timestamp");
        }

        ShutdownReport {
            discarded_frames: frames.len(),
            discarded_timestamps: timestamps.len(),
            workers_joined: camera_joined && timer_joined,
            fatal_error: self.ctx.fatal.message(),
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if self.camera.is_some() || self.timer.is_some() {
            self.shutdown();
        }
    }
}

/// Join a worker if it finishes before `deadline`; a late worker is
/// detached.
fn join_before(handle: Option<JoinHandle<()>>, deadline: Instant, name: &str) -> bool {
    let Some(handle) = handle else {
        return true;
    };
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("{name} worker did not stop in time");
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        error!("{name} worker panicked");
    }
    true
}
