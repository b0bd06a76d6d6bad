//! Software timer unit for running without the GPS hardware.
//!
//! Behaves like the real unit on the wire: reports the system clock as
//! `CURRENT_TIME` once per second and, once told to start, aligns the first
//! trigger to a whole second, then emits `DOWNLOAD_TIME` and pulses the
//! attached trigger line every exposure interval.

use super::messages::{TimerCommand, TimerMessage};
use super::protocol::{FramerEvent, PacketFramer};
use super::{GpsStatus, LinkError, TimerLink};
use chrono::{DateTime, Utc};
use shared::camera_interface::simulated::TriggerOutput;
use shared::timestamp::Timestamp;
use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Exposure {
    interval: Duration,
    next_trigger: Instant,
}

#[derive(Debug)]
pub struct SimulatedTimer {
    connected: bool,
    trigger: Option<TriggerOutput>,
    framer: PacketFramer,
    outbound: VecDeque<u8>,
    exposure: Option<Exposure>,
    next_status: Option<Instant>,
    locked: bool,
}

impl Default for SimulatedTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTimer {
    pub fn new() -> Self {
        Self {
            connected: false,
            trigger: None,
            framer: PacketFramer::new(),
            outbound: VecDeque::new(),
            exposure: None,
            next_status: None,
            locked: true,
        }
    }

    /// Pulse `trigger` on every exposure boundary
    pub fn with_trigger(mut self, trigger: TriggerOutput) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Report times as taken without a GPS fix
    pub fn unlocked(mut self) -> Self {
        self.locked = false;
        self
    }

    pub fn is_exposing(&self) -> bool {
        self.exposure.is_some()
    }

    fn now_timestamp(&self, now: DateTime<Utc>) -> Timestamp {
        Timestamp::from_datetime(now, self.locked)
    }

    fn emit(&mut self, message: TimerMessage) {
        match message.to_packet().encode() {
            Ok(bytes) => self.outbound.extend(bytes),
            Err(e) => warn!("Simulated timer dropped a report: {e}"),
        }
    }

    fn apply(&mut self, command: TimerCommand) {
        match command {
            TimerCommand::StartExposure {
                seconds,
                use_monitor,
            } => {
                let seconds = seconds.max(1);
                let now = Utc::now();
                let to_boundary =
                    Duration::from_millis(1000 - (now.timestamp_subsec_millis() % 1000) as u64);
                self.exposure = Some(Exposure {
                    interval: Duration::from_secs(seconds as u64),
                    next_trigger: Instant::now() + to_boundary + Duration::from_secs(seconds as u64),
                });
                debug!("Simulated timer starting {seconds}s exposures (monitor: {use_monitor})");
                self.emit(TimerMessage::Debug(format!(
                    "Starting {seconds} second exposures"
                )));
            }
            TimerCommand::StopExposure => {
                self.exposure = None;
                self.emit(TimerMessage::Debug("Stopping exposures".to_string()));
            }
            TimerCommand::Reset => {
                self.exposure = None;
                self.emit(TimerMessage::Debug("Resetting".to_string()));
            }
        }
    }

    /// Generate every report that has fallen due.
    fn advance(&mut self) {
        let now = Instant::now();

        let mut fired = false;
        if let Some(exposure) = &mut self.exposure {
            if now >= exposure.next_trigger {
                exposure.next_trigger += exposure.interval;
                if exposure.next_trigger <= now {
                    exposure.next_trigger = now + exposure.interval;
                }
                fired = true;
            }
        }
        if fired {
            if let Some(trigger) = &self.trigger {
                trigger.pulse();
            }
            let stamp = self.now_timestamp(Utc::now());
            self.emit(TimerMessage::DownloadTime(stamp));
        }

        let status_due = *self.next_status.get_or_insert(now);
        if now >= status_due {
            let mut stamp = self.now_timestamp(Utc::now());
            if let Some(exposure) = &self.exposure {
                let remaining = exposure.next_trigger.saturating_duration_since(now);
                stamp.remaining_exposure = remaining.as_secs_f64().ceil() as u16;
            }
            self.emit(TimerMessage::CurrentTime(stamp));
            let next = status_due + STATUS_INTERVAL;
            self.next_status = Some(if next <= now { now + STATUS_INTERVAL } else { next });
        }
    }

    fn next_event(&self) -> Option<Instant> {
        let trigger = self.exposure.as_ref().map(|e| e.next_trigger);
        match (trigger, self.next_status) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl TimerLink for SimulatedTimer {
    fn name(&self) -> &str {
        "Simulated timer"
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        self.connected = true;
        self.next_status = None;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        self.connected = false;
        self.exposure = None;
        self.outbound.clear();
        Ok(())
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        for event in self.framer.push_bytes(frame) {
            match event {
                FramerEvent::Packet(packet) => match TimerCommand::from_packet(&packet) {
                    Ok(command) => self.apply(command),
                    Err(e) => warn!("Simulated timer ignored packet: {e}"),
                },
                FramerEvent::Malformed(bad) => {
                    warn!("Simulated timer discarded {} bytes", bad.discarded)
                }
            }
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        let deadline = Instant::now() + timeout;
        loop {
            self.advance();
            if !self.outbound.is_empty() {
                let n = buf.len().min(self.outbound.len());
                for (slot, byte) in buf.iter_mut().zip(self.outbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            let wake = self.next_event().unwrap_or(deadline).min(deadline);
            thread::sleep(wake.saturating_duration_since(now).max(Duration::from_millis(1)));
        }
    }

    fn gps_status(&self) -> GpsStatus {
        if self.connected {
            GpsStatus::Active
        } else {
            GpsStatus::Unavailable
        }
    }

    fn is_simulated(&self) -> bool {
        true
    }
}
