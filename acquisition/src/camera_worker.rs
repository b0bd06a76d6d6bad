//! Camera worker thread.
//!
//! The worker owns the [`CameraDriver`] and runs the camera state machine:
//!
//! ```text
//! Initialising -> Idle -> AcquireStart -> Acquiring -> AcquireStop -> Idle
//!                   \__________________________________________________\-> Shutdown
//! ```
//!
//! The coordinator steers it through [`AcquisitionContext::camera_desired`];
//! the worker publishes its own mode through
//! [`AcquisitionContext::camera_mode`]. Settings are only committed while the
//! worker is idle.

use crate::context::{AcquisitionContext, AppliedSettings};
use crate::modes::{CameraMode, DesiredMode};
use shared::camera_interface::{
    clamp_exposure, exposure_period, open_with_retry, AcquisitionSettings, CameraDriver,
    DriverError, OpenOutcome, PortCatalog, ReadoutGeometry, RetryPolicy,
};
use shared::PushOutcome;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraWorkerConfig {
    pub retry: RetryPolicy,
    /// Longest wait for a frame before re-checking the desired mode
    pub poll_timeout: Duration,
    /// How long `AcquireStop` waits for the timer to stop triggering
    pub stop_wait: Duration,
    /// Wait for a settings request between idle iterations
    pub idle_tick: Duration,
    pub temperature_interval: Duration,
}

impl Default for CameraWorkerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_timeout: Duration::from_millis(250),
            stop_wait: Duration::from_secs(1),
            idle_tick: Duration::from_millis(50),
            temperature_interval: Duration::from_secs(1),
        }
    }
}

pub struct CameraWorker {
    driver: Box<dyn CameraDriver>,
    ctx: Arc<AcquisitionContext>,
    config: CameraWorkerConfig,
    settings: AcquisitionSettings,
    catalog: PortCatalog,
    geometry: Option<ReadoutGeometry>,
    opened: bool,
    running: bool,
    empty_polls: u32,
    last_temperature: Option<Instant>,
}

impl CameraWorker {
    /// Create a worker that will open `driver` and commit `settings`.
    pub fn new(
        driver: Box<dyn CameraDriver>,
        ctx: Arc<AcquisitionContext>,
        settings: AcquisitionSettings,
        config: CameraWorkerConfig,
    ) -> Self {
        Self {
            driver,
            ctx,
            config,
            settings,
            catalog: PortCatalog::default(),
            geometry: None,
            opened: false,
            running: false,
            empty_polls: 0,
            last_temperature: None,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("camera".to_string())
            .spawn(move || self.run())
    }

    /// Run the state machine until shutdown.
    pub fn run(mut self) {
        {
            let mut telemetry = self.ctx.camera_telemetry();
            telemetry.name = self.driver.name().to_string();
            telemetry.simulated = self.driver.is_simulated();
        }

        let mut mode = CameraMode::Initialising;
        self.ctx.camera_mode.store(mode);
        loop {
            let next = match mode {
                CameraMode::Initialising => self.initialise(),
                CameraMode::Idle => self.idle(),
                CameraMode::AcquireStart => self.acquire_start(),
                CameraMode::Acquiring => self.acquiring(),
                CameraMode::AcquireStop => self.acquire_stop(),
                CameraMode::Shutdown => break,
            };
            if next != mode {
                debug!("Camera mode {:?} -> {:?}", mode, next);
            }
            mode = next;
            if mode != CameraMode::Shutdown {
                self.ctx.camera_mode.store(mode);
            }
        }

        self.finish();
    }

    fn initialise(&mut self) -> CameraMode {
        let ctx = Arc::clone(&self.ctx);
        match open_with_retry(self.driver.as_mut(), self.config.retry, || {
            ctx.camera_should_stop()
        }) {
            Ok(OpenOutcome::Opened) => self.opened = true,
            Ok(OpenOutcome::Cancelled) => return CameraMode::Shutdown,
            Err(e) => {
                self.ctx
                    .fatal
                    .raise(format!("Camera initialisation failed: {e}"));
                return CameraMode::Shutdown;
            }
        }

        match self.driver.port_catalog() {
            Ok(catalog) => {
                self.ctx.camera_telemetry().catalog = Some(catalog.clone());
                self.catalog = catalog;
            }
            Err(e) => {
                self.ctx
                    .fatal
                    .raise(format!("Failed to query camera ports: {e}"));
                return CameraMode::Shutdown;
            }
        }

        if let Err(e) = self.apply(self.settings) {
            self.ctx
                .fatal
                .raise(format!("Camera parameter commit failed: {e}"));
            return CameraMode::Shutdown;
        }

        info!("Camera initialised");
        CameraMode::Idle
    }

    fn idle(&mut self) -> CameraMode {
        if self.ctx.camera_should_stop() {
            return CameraMode::Shutdown;
        }

        if let Ok(request) = self
            .ctx
            .settings_receiver()
            .recv_timeout(self.config.idle_tick)
        {
            let result = self.apply(request.settings);
            if let Err(e) = &result {
                warn!("Failed to apply camera settings: {e}. Keeping previous values.");
            }
            // The requester may have given up waiting
            let _ = request.reply.send(result);
        }

        self.sample_temperature();

        if self.ctx.camera_desired.load() == DesiredMode::Acquiring {
            CameraMode::AcquireStart
        } else {
            CameraMode::Idle
        }
    }

    fn acquire_start(&mut self) -> CameraMode {
        if self.ctx.camera_should_stop() {
            return CameraMode::Shutdown;
        }

        self.ctx.reset_download_tracking();
        let period = exposure_period(self.ctx.trigger_interval());
        let shutter_open = !self.settings.disable_shutter;
        match self.driver.start(period, shutter_open) {
            Ok(()) => {
                self.running = true;
                self.empty_polls = 0;
                info!(
                    "Camera armed for {:.2}s exposures, shutter {}",
                    period.as_secs_f64(),
                    if shutter_open { "open" } else { "closed" }
                );
                CameraMode::Acquiring
            }
            Err(e) => {
                self.ctx
                    .fatal
                    .raise(format!("Failed to start acquisition: {e}"));
                CameraMode::Shutdown
            }
        }
    }

    fn acquiring(&mut self) -> CameraMode {
        if self.ctx.camera_should_stop()
            || self.ctx.camera_desired.load() != DesiredMode::Acquiring
        {
            return CameraMode::AcquireStop;
        }

        if let Err(e) = self.poll_once(self.config.poll_timeout) {
            self.ctx
                .fatal
                .raise(format!("Camera acquisition failed: {e}"));
            return CameraMode::AcquireStop;
        }
        CameraMode::Acquiring
    }

    fn acquire_stop(&mut self) -> CameraMode {
        // Frames from triggers already fired keep arriving until the timer stops
        let deadline = Instant::now() + self.config.stop_wait;
        while self.ctx.timer_mode.load().is_exposing() && Instant::now() < deadline {
            if let Err(e) = self.poll_once(Duration::from_millis(50)) {
                warn!("Camera error while stopping: {e}");
                break;
            }
        }
        if self.ctx.timer_mode.load().is_exposing() {
            warn!("Timer is still exposing. Stopping camera anyway.");
        }

        let result = self.driver.stop();
        self.running = false;
        self.ctx.reset_download_tracking();
        if let Err(e) = result {
            self.ctx
                .fatal
                .raise(format!("Failed to stop acquisition: {e}"));
            return CameraMode::Shutdown;
        }
        info!("Acquisition stopped");

        if self.ctx.camera_should_stop() {
            CameraMode::Shutdown
        } else {
            CameraMode::Idle
        }
    }

    /// Wait for one frame and queue it. Transient driver errors are logged
    /// and swallowed.
    fn poll_once(&mut self, timeout: Duration) -> Result<(), DriverError> {
        match self.driver.poll_next_frame(timeout) {
            Ok(Some(frame)) => {
                self.empty_polls = 0;
                let temperature = self.driver.temperature();
                let frame = match temperature {
                    Some(t) => frame.with_temperature(t),
                    None => frame,
                };
                self.ctx.camera_telemetry().temperature = temperature;
                self.ctx.note_frame();

                match self.ctx.frames.push(frame) {
                    PushOutcome::Accepted => {
                        debug!("Pushed frame. {} in queue", self.ctx.frames.len())
                    }
                    PushOutcome::Evicted(_) => warn!("Frame queue full. Discarding oldest frame"),
                    PushOutcome::Rejected(_) => warn!("Frame queue full. Discarding frame"),
                }
                Ok(())
            }
            Ok(None) => {
                self.empty_polls += 1;
                let threshold = self.driver.timeout_threshold().max(1);
                if self.empty_polls % threshold == 0 {
                    warn!(
                        "No frame received after {} polls. Continuing.",
                        self.empty_polls
                    );
                }
                Ok(())
            }
            Err(DriverError::FrameAllocate(reason)) => {
                warn!("Frame allocation failed ({reason}). Discarding frame.");
                Ok(())
            }
            Err(DriverError::DataLost) => {
                warn!("Frame data lost. Continuing.");
                Ok(())
            }
            Err(DriverError::ConnectionLost) => {
                warn!("Camera connection lost. Continuing.");
                Ok(())
            }
            Err(DriverError::BufferOverrun) => {
                warn!("Acquisition buffer overflow! Continuing.");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Validate, commit and publish settings.
    ///
    /// On a failed commit the worker keeps its previous settings, matching the
    /// driver, which keeps its previous parameters.
    fn apply(&mut self, requested: AcquisitionSettings) -> Result<AppliedSettings, DriverError> {
        let mut settings = requested;
        let mut adjustments = self.catalog.validate(&mut settings);
        if settings.binning == 0 {
            adjustments.push("Invalid binning: 0. Reset to 1.".to_string());
            settings.binning = 1;
        }
        for line in &adjustments {
            warn!("{line}");
        }

        let geometry = self.driver.commit_settings(&settings)?;
        if self.geometry.map(|g| g.readout_time) != Some(geometry.readout_time) {
            info!(
                "Camera readout time is now {:.2}s",
                geometry.readout_time.as_secs_f64()
            );
        }

        let exposure = clamp_exposure(settings.exposure_seconds, geometry.readout_time);
        if exposure != settings.exposure_seconds {
            let line = format!("Increasing EXPOSURE_TIME to {exposure} seconds.");
            info!("{line}");
            adjustments.push(line);
            settings.exposure_seconds = exposure;
        }

        self.settings = settings;
        self.geometry = Some(geometry);
        {
            let mut telemetry = self.ctx.camera_telemetry();
            telemetry.settings = Some(settings);
            telemetry.geometry = Some(geometry);
        }

        Ok(AppliedSettings {
            settings,
            geometry,
            adjustments,
        })
    }

    fn sample_temperature(&mut self) {
        let due = self
            .last_temperature
            .is_none_or(|at| at.elapsed() >= self.config.temperature_interval);
        if due {
            let temperature = self.driver.temperature();
            self.ctx.camera_telemetry().temperature = temperature;
            self.last_temperature = Some(Instant::now());
        }
    }

    fn finish(&mut self) {
        if self.running {
            if let Err(e) = self.driver.stop() {
                warn!("Failed to stop camera sequence during shutdown: {e}");
            }
            self.running = false;
        }
        if self.opened {
            match self.driver.close() {
                Ok(()) => info!("Camera closed"),
                Err(e) => warn!("Failed to close camera: {e}"),
            }
            self.opened = false;
        }
        self.ctx.camera_telemetry().temperature = None;
        self.ctx.camera_mode.store(CameraMode::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SettingsRequest;
    use crate::modes::TimerMode;
    use shared::camera_interface::simulated::{
        trigger_line, SimulatedCamera, SimulatedCameraConfig,
    };
    use std::time::Duration;
    use test_helpers::wait_until;

    fn fast_config() -> CameraWorkerConfig {
        CameraWorkerConfig {
            retry: RetryPolicy {
                interval: Duration::from_millis(5),
                max_attempts: Some(3),
            },
            poll_timeout: Duration::from_millis(20),
            stop_wait: Duration::from_millis(200),
            idle_tick: Duration::from_millis(5),
            temperature_interval: Duration::from_millis(10),
        }
    }

    fn small_camera() -> SimulatedCameraConfig {
        SimulatedCameraConfig {
            width: 32,
            height: 16,
            readout_time: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn wait_for_mode(ctx: &AcquisitionContext, mode: CameraMode, timeout: Duration) -> bool {
        wait_until(timeout, || ctx.camera_mode.load() == mode)
    }

    #[test]
    fn test_reaches_idle_and_shuts_down() {
        let ctx = Arc::new(AcquisitionContext::default());
        let camera = SimulatedCamera::new(small_camera());
        let stats = camera.stats();
        let handle = CameraWorker::new(
            Box::new(camera),
            Arc::clone(&ctx),
            AcquisitionSettings::default(),
            fast_config(),
        )
        .spawn()
        .unwrap();

        assert!(wait_for_mode(&ctx, CameraMode::Idle, Duration::from_secs(2)));
        assert_eq!(stats.commits(), 1);
        assert!(ctx.camera_telemetry().geometry.is_some());

        ctx.camera_desired.store(DesiredMode::Shutdown);
        handle.join().unwrap();
        assert_eq!(ctx.camera_mode.load(), CameraMode::Shutdown);
        assert!(!ctx.fatal.is_raised());
    }

    #[test]
    fn test_missing_camera_is_fatal() {
        let ctx = Arc::new(AcquisitionContext::default());
        let camera = SimulatedCamera::new(SimulatedCameraConfig {
            absent_for_attempts: 100,
            ..small_camera()
        });
        let handle = CameraWorker::new(
            Box::new(camera),
            Arc::clone(&ctx),
            AcquisitionSettings::default(),
            fast_config(),
        )
        .spawn()
        .unwrap();

        handle.join().unwrap();
        assert!(ctx.fatal.is_raised());
        assert!(ctx
            .fatal
            .message()
            .unwrap()
            .starts_with("Camera initialisation failed"));
        assert_eq!(ctx.camera_mode.load(), CameraMode::Shutdown);
    }

    #[test]
    fn test_triggered_frames_are_queued() {
        let ctx = Arc::new(AcquisitionContext::default());
        let (output, input) = trigger_line();
        let camera = SimulatedCamera::new(small_camera()).with_trigger(input);
        let handle = CameraWorker::new(
            Box::new(camera),
            Arc::clone(&ctx),
            AcquisitionSettings::default(),
            fast_config(),
        )
        .spawn()
        .unwrap();
        assert!(wait_for_mode(&ctx, CameraMode::Idle, Duration::from_secs(2)));

        ctx.set_trigger_interval(1);
        ctx.camera_desired.store(DesiredMode::Acquiring);
        assert!(wait_for_mode(&ctx, CameraMode::Acquiring, Duration::from_secs(2)));

        for _ in 0..3 {
            assert!(output.pulse());
        }
        assert!(wait_until(Duration::from_secs(2), || ctx.frames.len() == 3));
        let frame = ctx.frames.try_pop().unwrap();
        assert_eq!((frame.width(), frame.height()), (32, 16));

        ctx.camera_desired.store(DesiredMode::Idle);
        assert!(wait_for_mode(&ctx, CameraMode::Idle, Duration::from_secs(2)));

        ctx.camera_desired.store(DesiredMode::Shutdown);
        handle.join().unwrap();
    }

    #[test]
    fn test_settings_commit_while_idle() {
        let ctx = Arc::new(AcquisitionContext::default());
        let camera = SimulatedCamera::new(small_camera());
        let stats = camera.stats();
        let handle = CameraWorker::new(
            Box::new(camera),
            Arc::clone(&ctx),
            AcquisitionSettings::default(),
            fast_config(),
        )
        .spawn()
        .unwrap();
        assert!(wait_for_mode(&ctx, CameraMode::Idle, Duration::from_secs(2)));

        let (reply, replies) = crossbeam_channel::bounded(1);
        let requested = AcquisitionSettings {
            port: 7,
            binning: 2,
            exposure_seconds: 3,
            ..Default::default()
        };
        ctx.settings_sender()
            .send(SettingsRequest {
                settings: requested,
                reply,
            })
            .unwrap();

        let applied = replies
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(applied.settings.port, 0);
        assert_eq!(applied.settings.binning, 2);
        assert_eq!(applied.settings.exposure_seconds, 3);
        assert_eq!((applied.geometry.width, applied.geometry.height), (16, 8));
        assert_eq!(applied.adjustments[0], "Invalid port index: 7. Reset to 0.");
        assert_eq!(stats.commits(), 2);

        ctx.camera_desired.store(DesiredMode::Shutdown);
        handle.join().unwrap();
    }

    #[test]
    fn test_failed_commit_keeps_previous_settings() {
        let ctx = Arc::new(AcquisitionContext::default());
        let camera = SimulatedCamera::new(SimulatedCameraConfig {
            fail_commits_after: Some(1),
            ..small_camera()
        });
        let handle = CameraWorker::new(
            Box::new(camera),
            Arc::clone(&ctx),
            AcquisitionSettings::default(),
            fast_config(),
        )
        .spawn()
        .unwrap();
        assert!(wait_for_mode(&ctx, CameraMode::Idle, Duration::from_secs(2)));

        let (reply, replies) = crossbeam_channel::bounded(1);
        ctx.settings_sender()
            .send(SettingsRequest {
                settings: AcquisitionSettings {
                    binning: 4,
                    ..Default::default()
                },
                reply,
            })
            .unwrap();
        let result = replies.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(result, Err(DriverError::ParameterCommit(_))));
        assert_eq!(ctx.camera_telemetry().settings.unwrap().binning, 1);
        assert_eq!(ctx.camera_mode.load(), CameraMode::Idle);
        assert!(!ctx.fatal.is_raised());

        ctx.camera_desired.store(DesiredMode::Shutdown);
        handle.join().unwrap();
    }

    #[test]
    fn test_stop_waits_for_timer() {
        let ctx = Arc::new(AcquisitionContext::default());
        let camera = SimulatedCamera::new(small_camera());
        let stats = camera.stats();
        let handle = CameraWorker::new(
            Box::new(camera),
            Arc::clone(&ctx),
            AcquisitionSettings::default(),
            CameraWorkerConfig {
                stop_wait: Duration::from_secs(5),
                ..fast_config()
            },
        )
        .spawn()
        .unwrap();
        assert!(wait_for_mode(&ctx, CameraMode::Idle, Duration::from_secs(2)));

        ctx.camera_desired.store(DesiredMode::Acquiring);
        assert!(wait_for_mode(&ctx, CameraMode::Acquiring, Duration::from_secs(2)));
        ctx.timer_mode.store(TimerMode::Exposing);
        ctx.camera_desired.store(DesiredMode::Idle);

        assert!(wait_for_mode(&ctx, CameraMode::AcquireStop, Duration::from_secs(1)));
        assert_eq!(stats.stops(), 0);
        ctx.timer_mode.store(TimerMode::Idle);
        assert!(wait_for_mode(&ctx, CameraMode::Idle, Duration::from_secs(1)));
        assert_eq!(stats.stops(), 1);

        ctx.camera_desired.store(DesiredMode::Shutdown);
        handle.join().unwrap();
        assert_eq!(stats.stops(), 1);
    }
}
