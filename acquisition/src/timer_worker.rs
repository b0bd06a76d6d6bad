//! Timer worker thread.
//!
//! Owns the [`TimerLink`], turns the byte stream into typed messages,
//! publishes trigger timestamps and forwards coordinator commands to the
//! timer. Exposures are only started once the camera reports
//! [`CameraMode::Acquiring`], so the timer never pulses an unarmed camera.

use crate::context::AcquisitionContext;
use crate::modes::{CameraMode, TimerMode};
use hardware::timer::messages::hex_dump;
use hardware::timer::{
    send_command, FramerEvent, GpsStatus, Malformed, PacketFramer, PacketType, TimerCommand,
    TimerLink, TimerMessage,
};
use shared::{PushOutcome, Timestamp};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerWorkerConfig {
    /// Longest blocking read before re-checking commands and modes
    pub read_timeout: Duration,
}

impl Default for TimerWorkerConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(100),
        }
    }
}

pub struct TimerWorker {
    link: Box<dyn TimerLink>,
    ctx: Arc<AcquisitionContext>,
    config: TimerWorkerConfig,
    framer: PacketFramer,
    mode: TimerMode,
    /// START_EXPOSURE held back until the camera is armed
    pending_start: Option<TimerCommand>,
}

impl TimerWorker {
    pub fn new(
        link: Box<dyn TimerLink>,
        ctx: Arc<AcquisitionContext>,
        config: TimerWorkerConfig,
    ) -> Self {
        Self {
            link,
            ctx,
            config,
            framer: PacketFramer::new(),
            mode: TimerMode::Idle,
            pending_start: None,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || self.run())
    }

    pub fn run(mut self) {
        self.ctx.timer_telemetry().name = self.link.name().to_string();
        self.ctx.timer_mode.store(TimerMode::Idle);

        if let Err(e) = self.link.connect() {
            self.ctx
                .fatal
                .raise(format!("Timer connection failed: {e}"));
            self.ctx.timer_mode.store(TimerMode::Shutdown);
            return;
        }
        info!("Connected to {}", self.link.name());

        let mut buf = [0u8; 512];
        while !self.ctx.timer_should_stop() {
            match self.link.receive(&mut buf, self.config.read_timeout) {
                Ok(0) => {}
                Ok(n) => self.handle_bytes(&buf[..n]),
                Err(e) => {
                    warn!("Timer read failed: {e}. Continuing.");
                    thread::sleep(self.config.read_timeout);
                }
            }
            self.ctx.timer_telemetry().gps_status = self.gps_status();

            self.drain_commands();
            self.advance();
        }

        self.finish();
    }

    fn handle_bytes(&mut self, data: &[u8]) {
        let was_synchronised = self.framer.is_synchronised();
        for event in self.framer.push_bytes(data) {
            match event {
                FramerEvent::Packet(packet) => match TimerMessage::decode(&packet) {
                    Ok(message) => self.handle_message(message),
                    // The camera still reads out this trigger's frame
                    Err(e) if packet.kind == PacketType::DownloadTime => {
                        warn!("Unreadable trigger time: {e}. Queueing an invalid timestamp.");
                        self.queue_trigger(Timestamp::invalid());
                    }
                    Err(e) => warn!("Ignoring timer packet: {e}"),
                },
                FramerEvent::Malformed(malformed) => log_malformed(&malformed),
            }
        }
        if !was_synchronised && self.framer.is_synchronised() {
            info!("Timer synchronised");
        }
    }

    fn handle_message(&mut self, message: TimerMessage) {
        match message {
            TimerMessage::CurrentTime(timestamp) => {
                self.ctx.timer_telemetry().current_time = timestamp;
            }
            TimerMessage::DownloadTime(timestamp) => self.queue_trigger(timestamp),
            TimerMessage::Debug(text) => info!("Timer: {text}"),
            TimerMessage::DebugRaw(data) => info!("Timer: {}", hex_dump(&data)),
        }
    }

    /// One timestamp per trigger, so frames and timestamps stay paired
    fn queue_trigger(&mut self, timestamp: Timestamp) {
        self.ctx.note_trigger();
        self.ctx.timer_telemetry().download_time = timestamp;
        match self.ctx.timestamps.push(timestamp) {
            PushOutcome::Accepted => {
                debug!("Pushed timestamp. {} in queue", self.ctx.timestamps.len())
            }
            PushOutcome::Evicted(_) => warn!("Timestamp queue full. Discarding oldest timestamp"),
            PushOutcome::Rejected(_) => warn!("Timestamp queue full. Discarding timestamp"),
        }
    }

    /// A connected link is only `Active` once a packet has parsed
    fn gps_status(&self) -> GpsStatus {
        match self.link.gps_status() {
            GpsStatus::Active if !self.framer.is_synchronised() => GpsStatus::Syncing,
            status => status,
        }
    }

    fn drain_commands(&mut self) {
        while let Some(command) = self.ctx.timer_commands.try_pop() {
            match command {
                TimerCommand::StartExposure { seconds, .. } => {
                    if self.mode.is_exposing() {
                        warn!("Timer is already exposing. Ignoring start.");
                        continue;
                    }
                    debug!("Waiting for camera before starting {seconds} second exposures");
                    self.pending_start = Some(command);
                    self.set_mode(TimerMode::Align);
                }
                TimerCommand::StopExposure | TimerCommand::Reset => {
                    self.pending_start = None;
                    self.send(command);
                    self.set_mode(TimerMode::Idle);
                }
            }
        }
    }

    fn advance(&mut self) {
        match self.mode {
            TimerMode::Align => {
                if self.ctx.camera_mode.load() == CameraMode::Acquiring {
                    if let Some(start) = self.pending_start.take() {
                        self.send(start);
                    }
                    self.set_mode(TimerMode::Exposing);
                }
            }
            TimerMode::Exposing | TimerMode::Readout => {
                let mode = if self.ctx.camera_downloading() {
                    TimerMode::Readout
                } else {
                    TimerMode::Exposing
                };
                self.set_mode(mode);
            }
            TimerMode::Idle | TimerMode::Shutdown => {}
        }
    }

    fn set_mode(&mut self, mode: TimerMode) {
        if mode != self.mode {
            debug!("Timer mode {:?} -> {:?}", self.mode, mode);
            self.mode = mode;
            self.ctx.timer_mode.store(mode);
        }
    }

    fn send(&mut self, command: TimerCommand) {
        match send_command(self.link.as_mut(), command) {
            Ok(()) => debug!("Sent {command:?}"),
            Err(e) => warn!("Failed to send {command:?} to timer: {e}"),
        }
    }

    fn finish(&mut self) {
        if self.mode.is_exposing() {
            self.send(TimerCommand::StopExposure);
            info!("Stopped timer exposures");
        }
        if let Err(e) = self.link.disconnect() {
            warn!("Failed to disconnect timer: {e}");
        }
        self.ctx.timer_telemetry().gps_status = self.link.gps_status();
        self.mode = TimerMode::Shutdown;
        self.ctx.timer_mode.store(TimerMode::Shutdown);
    }
}

fn log_malformed(malformed: &Malformed) {
    if malformed.is_repeated() {
        warn!(
            "Repeated malformed timer packets ({} in a row): {:?}, {} bytes discarded",
            malformed.consecutive, malformed.reason, malformed.discarded
        );
    } else {
        warn!(
            "Malformed timer packet: {:?}, {} bytes discarded",
            malformed.reason, malformed.discarded
        );
    }
}
