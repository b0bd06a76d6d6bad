//! Software camera for running the acquisition chain without hardware
//!
//! The simulated camera either listens on a [`TriggerInput`] shared with a
//! simulated timer, reading out one frame per pulse, or free-runs at the
//! configured trigger interval when no trigger line is attached.

use super::{
    frame_dimensions, AcquisitionSettings, CameraDriver, CcdRegion, DriverError, DriverResult,
    Gain, Port, PortCatalog, ReadoutGeometry, Speed, EXPOSURE_MARGIN,
};
use crate::frame::Frame;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rand::Rng;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Sending half of a simulated trigger cable
#[derive(Debug, Clone)]
pub struct TriggerOutput {
    tx: Sender<()>,
}

impl TriggerOutput {
    /// Pulse the line. Returns false once the camera end has been dropped.
    pub fn pulse(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

/// Receiving half of a simulated trigger cable
#[derive(Debug)]
pub struct TriggerInput {
    rx: Receiver<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerWait {
    Pulse,
    Timeout,
    Disconnected,
}

impl TriggerInput {
    pub fn wait(&self, timeout: Duration) -> TriggerWait {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => TriggerWait::Pulse,
            Err(RecvTimeoutError::Timeout) => TriggerWait::Timeout,
            Err(RecvTimeoutError::Disconnected) => TriggerWait::Disconnected,
        }
    }

    /// Discard pulses that arrived while the camera was not armed
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }
}

/// Create a connected trigger output and input pair
pub fn trigger_line() -> (TriggerOutput, TriggerInput) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (TriggerOutput { tx }, TriggerInput { rx })
}

#[derive(Debug, Clone)]
pub struct SimulatedCameraConfig {
    pub width: u16,
    pub height: u16,
    /// Full-frame unbinned readout time
    pub readout_time: Duration,
    /// Sensor temperature before cooling starts
    pub ambient_temperature: f64,
    /// Number of `open` calls that report no camera before one appears
    pub absent_for_attempts: u32,
    /// Commits after this many successful ones fail
    pub fail_commits_after: Option<u32>,
}

impl Default for SimulatedCameraConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            readout_time: Duration::from_millis(500),
            ambient_temperature: 20.0,
            absent_for_attempts: 0,
            fail_commits_after: None,
        }
    }
}

/// Counters shared with whoever constructed the camera
#[derive(Debug, Default)]
pub struct SimulatedCameraStats {
    pub opens: AtomicU32,
    pub commits: AtomicU32,
    pub starts: AtomicU32,
    pub stops: AtomicU32,
    pub frames: AtomicU64,
}

impl SimulatedCameraStats {
    pub fn commits(&self) -> u32 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct SimulatedCamera {
    config: SimulatedCameraConfig,
    stats: Arc<SimulatedCameraStats>,
    trigger: Option<TriggerInput>,
    open: bool,
    open_attempts: u32,
    settings: AcquisitionSettings,
    geometry: Option<ReadoutGeometry>,
    acquiring: bool,
    shutter_open: bool,
    interval: Duration,
    next_free_run: Option<Instant>,
    temperature: f64,
    frame_counter: u64,
}

impl SimulatedCamera {
    pub fn new(config: SimulatedCameraConfig) -> Self {
        let temperature = config.ambient_temperature;
        Self {
            config,
            stats: Arc::new(SimulatedCameraStats::default()),
            trigger: None,
            open: false,
            open_attempts: 0,
            settings: AcquisitionSettings::default(),
            geometry: None,
            acquiring: false,
            shutter_open: false,
            interval: Duration::from_secs(1),
            next_free_run: None,
            temperature,
            frame_counter: 0,
        }
    }

    /// Read out one frame per pulse on `trigger` instead of free-running
    pub fn with_trigger(mut self, trigger: TriggerInput) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn stats(&self) -> Arc<SimulatedCameraStats> {
        Arc::clone(&self.stats)
    }

    fn readout_geometry(&self, settings: &AcquisitionSettings) -> ReadoutGeometry {
        let (width, height) = frame_dimensions(&self.ccd_region(), settings.binning);
        let bin = settings.binning.max(1) as f64;
        ReadoutGeometry {
            width,
            height,
            readout_time: self.config.readout_time.div_f64(bin * bin),
        }
    }

    fn read_out(&mut self) -> DriverResult<Frame> {
        let geometry = self.geometry.ok_or(DriverError::NotOpen)?;
        let (width, height) = (geometry.width as usize, geometry.height as usize);
        let mut rng = rand::rng();
        let counter = self.frame_counter as usize;
        let lit = self.shutter_open;

        let data: Vec<u16> = (0..width * height)
            .map(|i| {
                let (row, col) = (i / width, i % width);
                let bias = 500u16 + rng.random_range(0..32u16);
                if lit {
                    bias + ((row + col + counter) % 256) as u16
                } else {
                    bias
                }
            })
            .collect();

        self.frame_counter += 1;
        self.stats.frames.fetch_add(1, Ordering::SeqCst);
        Frame::from_raw(geometry.width, geometry.height, &data)
            .map_err(|e| DriverError::FrameAllocate(e.to_string()))
    }

    fn wait_free_run(&mut self, timeout: Duration) -> DriverResult<Option<Frame>> {
        let now = Instant::now();
        let due = *self.next_free_run.get_or_insert(now + self.interval);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                thread::sleep(timeout);
                return Ok(None);
            }
            thread::sleep(wait);
        }
        self.next_free_run = Some(due + self.interval);
        self.read_out().map(Some)
    }
}

impl CameraDriver for SimulatedCamera {
    fn name(&self) -> &str {
        "Simulated camera"
    }

    fn open(&mut self) -> DriverResult<()> {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        if self.open_attempts < self.config.absent_for_attempts {
            self.open_attempts += 1;
            return Err(DriverError::DeviceNotFound);
        }
        self.open = true;
        self.shutter_open = false;
        Ok(())
    }

    fn close(&mut self) -> DriverResult<()> {
        self.acquiring = false;
        self.open = false;
        Ok(())
    }

    fn commit_settings(&mut self, settings: &AcquisitionSettings) -> DriverResult<ReadoutGeometry> {
        if !self.open {
            return Err(DriverError::NotOpen);
        }
        if self
            .config
            .fail_commits_after
            .is_some_and(|limit| self.stats.commits() >= limit)
        {
            return Err(DriverError::ParameterCommit(
                "simulated commit failure".to_string(),
            ));
        }

        let geometry = self.readout_geometry(settings);
        self.settings = *settings;
        self.geometry = Some(geometry);
        self.stats.commits.fetch_add(1, Ordering::SeqCst);
        Ok(geometry)
    }

    fn start(&mut self, exposure_period: Duration, shutter_open: bool) -> DriverResult<()> {
        if !self.open || self.geometry.is_none() {
            return Err(DriverError::NotOpen);
        }
        if let Some(trigger) = &self.trigger {
            trigger.clear();
        }
        // Free-running frames arrive at the trigger interval the period was derived from
        self.interval = (exposure_period + EXPOSURE_MARGIN).max(Duration::from_millis(100));
        self.next_free_run = None;
        self.shutter_open = shutter_open;
        self.acquiring = true;
        self.stats.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> DriverResult<()> {
        if self.acquiring {
            self.stats.stops.fetch_add(1, Ordering::SeqCst);
        }
        self.acquiring = false;
        self.shutter_open = false;
        self.next_free_run = None;
        Ok(())
    }

    fn temperature(&mut self) -> Option<f64> {
        if !self.open {
            return None;
        }
        let target = self.settings.temperature_setpoint as f64 / 100.0;
        let step = (target - self.temperature).clamp(-0.5, 0.5);
        self.temperature += step;
        Some(self.temperature)
    }

    fn port_catalog(&mut self) -> DriverResult<PortCatalog> {
        let gains = |names: &[&str]| {
            names
                .iter()
                .map(|name| Gain {
                    name: name.to_string(),
                })
                .collect()
        };
        Ok(PortCatalog {
            ports: vec![
                Port {
                    name: "Normal".to_string(),
                    speeds: vec![
                        Speed {
                            name: "1 MHz".to_string(),
                            gains: gains(&["Low", "Medium", "High"]),
                        },
                        Speed {
                            name: "5 MHz".to_string(),
                            gains: gains(&["Low", "High"]),
                        },
                    ],
                },
                Port {
                    name: "Low Noise".to_string(),
                    speeds: vec![Speed {
                        name: "100 kHz".to_string(),
                        gains: gains(&["Low", "Medium", "High"]),
                    }],
                },
            ],
        })
    }

    fn ccd_region(&self) -> CcdRegion {
        CcdRegion {
            x: 0,
            y: 0,
            width: self.config.width,
            height: self.config.height,
        }
    }

    fn poll_next_frame(&mut self, timeout: Duration) -> DriverResult<Option<Frame>> {
        if !self.open {
            return Err(DriverError::NotOpen);
        }
        if !self.acquiring {
            thread::sleep(timeout);
            return Ok(None);
        }

        let waited = match &self.trigger {
            None => return self.wait_free_run(timeout),
            Some(trigger) => trigger.wait(timeout),
        };

        match waited {
            TriggerWait::Pulse => self.read_out().map(Some),
            TriggerWait::Timeout => Ok(None),
            TriggerWait::Disconnected => {
                thread::sleep(timeout);
                Ok(None)
            }
        }
    }

    fn is_simulated(&self) -> bool {
        true
    }
}
