//! Camera driver capability
//!
//! A [`CameraDriver`] wraps one physical (or simulated) CCD. The acquisition
//! camera worker owns the driver exclusively and sequences it through
//! open, settings commits, triggered sequences and close.

#[cfg(feature = "simulated-camera")]
pub mod simulated;

use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Longest exposure the timer can count, in seconds
pub const MAX_EXPOSURE_SECONDS: u16 = u16::MAX;

/// Margin subtracted from the trigger interval so the camera finishes
/// exposing before the next trigger arrives
pub const EXPOSURE_MARGIN: Duration = Duration::from_millis(20);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("camera not found")]
    DeviceNotFound,
    #[error("failed to open camera: {0}")]
    DeviceOpen(String),
    #[error("parameter commit failed: {0}")]
    ParameterCommit(String),
    #[error("failed to allocate acquisition buffer: {0}")]
    BufferAllocate(String),
    #[error("failed to allocate frame memory: {0}")]
    FrameAllocate(String),
    #[error("frame data lost")]
    DataLost,
    #[error("camera connection lost")]
    ConnectionLost,
    #[error("acquisition buffer overflow")]
    BufferOverrun,
    #[error("camera hardware error: {0}")]
    Hardware(String),
    #[error("camera is not open")]
    NotOpen,
}

impl DriverError {
    /// Errors after which the running sequence continues
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DriverError::DataLost
                | DriverError::ConnectionLost
                | DriverError::BufferOverrun
                | DriverError::FrameAllocate(_)
        )
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// User-selectable camera configuration.
///
/// Port, speed and gain are indices into the driver's [`PortCatalog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Trigger interval in seconds
    pub exposure_seconds: u16,
    pub port: u8,
    pub speed: u8,
    pub gain: u8,
    /// Sensor setpoint in hundredths of a degree Celsius
    pub temperature_setpoint: i32,
    pub binning: u8,
    /// Leave the shutter closed during sequences (darks)
    pub disable_shutter: bool,
    /// Ask the timer to monitor the camera's logic output
    pub monitor_logic_output: bool,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            exposure_seconds: 5,
            port: 0,
            speed: 0,
            gain: 0,
            temperature_setpoint: -5000,
            binning: 1,
            disable_shutter: false,
            monitor_logic_output: true,
        }
    }
}

impl AcquisitionSettings {
    /// Camera exposure period for the configured trigger interval
    pub fn exposure_period(&self) -> Duration {
        exposure_period(self.exposure_seconds)
    }
}

/// Camera exposure period for a trigger interval in seconds
pub fn exposure_period(trigger_interval_seconds: u16) -> Duration {
    Duration::from_secs(trigger_interval_seconds as u64).saturating_sub(EXPOSURE_MARGIN)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gain {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Speed {
    pub name: String,
    pub gains: Vec<Gain>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    pub speeds: Vec<Speed>,
}

/// Readout ports, their speeds and the gains available at each speed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCatalog {
    pub ports: Vec<Port>,
}

impl PortCatalog {
    /// Reset any out-of-range index to zero.
    ///
    /// Returns one message per reset, for logging. Indices are checked
    /// outermost first so a reset port also validates speed and gain
    /// against port zero.
    pub fn validate(&self, settings: &mut AcquisitionSettings) -> Vec<String> {
        let mut resets = Vec::new();
        if self.ports.is_empty() {
            return resets;
        }

        if settings.port as usize >= self.ports.len() {
            resets.push(format!("Invalid port index: {}. Reset to 0.", settings.port));
            settings.port = 0;
        }
        let port = &self.ports[settings.port as usize];

        if port.speeds.is_empty() {
            return resets;
        }
        if settings.speed as usize >= port.speeds.len() {
            resets.push(format!("Invalid speed index: {}. Reset to 0.", settings.speed));
            settings.speed = 0;
        }
        let speed = &port.speeds[settings.speed as usize];

        if !speed.gains.is_empty() && settings.gain as usize >= speed.gains.len() {
            resets.push(format!("Invalid gain index: {}. Reset to 0.", settings.gain));
            settings.gain = 0;
        }
        resets
    }

    /// Human readable names for the selected indices
    pub fn describe(&self, settings: &AcquisitionSettings) -> Option<(String, String, String)> {
        let port = self.ports.get(settings.port as usize)?;
        let speed = port.speeds.get(settings.speed as usize)?;
        let gain = speed.gains.get(settings.gain as usize)?;
        Some((port.name.clone(), speed.name.clone(), gain.name.clone()))
    }
}

/// Full-chip geometry in unbinned pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CcdRegion {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

/// Frame layout produced by a committed configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReadoutGeometry {
    pub width: u16,
    pub height: u16,
    pub readout_time: Duration,
}

/// Binned frame dimensions for a region; binning below 1 is treated as 1.
pub fn frame_dimensions(region: &CcdRegion, binning: u8) -> (u16, u16) {
    let bin = binning.max(1) as u16;
    (region.width / bin, region.height / bin)
}

/// Clamp an exposure to `[ceil(readout_time), MAX_EXPOSURE_SECONDS]` and at
/// least one second.
pub fn clamp_exposure(exposure_seconds: u16, readout_time: Duration) -> u16 {
    let readout = readout_time.as_secs_f64().ceil();
    let minimum = if readout >= MAX_EXPOSURE_SECONDS as f64 {
        MAX_EXPOSURE_SECONDS
    } else {
        (readout as u16).max(1)
    };
    exposure_seconds.max(minimum)
}

/// Interface every camera backend implements.
///
/// Methods are called from a single worker thread; implementations need to
/// be `Send` but not `Sync`.
pub trait CameraDriver: Send {
    fn name(&self) -> &str;

    /// Open the device and prepare it for triggered acquisition.
    ///
    /// Installs the acquisition buffer, enables frame transfer and external
    /// trigger, configures the logic output to "waiting for trigger" and
    /// closes the shutter. Returns [`DriverError::DeviceNotFound`] when no
    /// camera is attached yet.
    fn open(&mut self) -> DriverResult<()>;

    fn close(&mut self) -> DriverResult<()>;

    /// Apply settings; on failure the previous settings remain active.
    fn commit_settings(&mut self, settings: &AcquisitionSettings) -> DriverResult<ReadoutGeometry>;

    /// Arm an open-ended triggered sequence.
    fn start(&mut self, exposure_period: Duration, shutter_open: bool) -> DriverResult<()>;

    /// End any running sequence and close the shutter. Stopping an idle
    /// camera is not an error.
    fn stop(&mut self) -> DriverResult<()>;

    /// Sensor temperature in degrees Celsius, if readable
    fn temperature(&mut self) -> Option<f64>;

    fn port_catalog(&mut self) -> DriverResult<PortCatalog>;

    fn ccd_region(&self) -> CcdRegion;

    /// Wait up to `timeout` for the next frame of a running sequence.
    ///
    /// Returns `Ok(None)` on timeout. Errors for which
    /// [`DriverError::is_transient`] holds leave the sequence running.
    fn poll_next_frame(&mut self, timeout: Duration) -> DriverResult<Option<Frame>>;

    /// Consecutive empty polls after which the worker reports missing frames
    fn timeout_threshold(&self) -> u32 {
        10
    }

    fn is_simulated(&self) -> bool {
        false
    }
}

/// How long to keep looking for a camera that is not yet attached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// `None` retries until cancelled
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            max_attempts: None,
        }
    }
}

/// Outcome of [`open_with_retry`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened,
    Cancelled,
}

/// Open a camera, retrying while it reports [`DriverError::DeviceNotFound`].
///
/// `cancelled` is checked before each attempt; returning true abandons the
/// search. Any other error, or exhausting the attempt budget, is returned.
pub fn open_with_retry<F>(
    driver: &mut dyn CameraDriver,
    policy: RetryPolicy,
    cancelled: F,
) -> DriverResult<OpenOutcome>
where
    F: Fn() -> bool,
{
    let mut attempts = 0u32;
    let mut announced = false;
    loop {
        if cancelled() {
            return Ok(OpenOutcome::Cancelled);
        }

        attempts += 1;
        match driver.open() {
            Ok(()) => {
                info!("Opened camera {}", driver.name());
                return Ok(OpenOutcome::Opened);
            }
            Err(DriverError::DeviceNotFound) => {
                if policy.max_attempts.is_some_and(|max| attempts >= max) {
                    return Err(DriverError::DeviceOpen(format!(
                        "no camera found after {attempts} attempts"
                    )));
                }
                if !announced {
                    info!("Waiting for camera...");
                    announced = true;
                }
            }
            Err(e) => return Err(e),
        }

        let wake = Instant::now() + policy.interval;
        while Instant::now() < wake {
            if cancelled() {
                warn!("Camera search cancelled");
                return Ok(OpenOutcome::Cancelled);
            }
            thread::sleep(policy.interval.min(Duration::from_millis(50)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> PortCatalog {
        let gains = |n: usize| {
            (0..n)
                .map(|i| Gain {
                    name: format!("G{i}"),
                })
                .collect::<Vec<_>>()
        };
        PortCatalog {
            ports: vec![
                Port {
                    name: "Normal".into(),
                    speeds: vec![
                        Speed {
                            name: "1 MHz".into(),
                            gains: gains(3),
                        },
                        Speed {
                            name: "5 MHz".into(),
                            gains: gains(2),
                        },
                    ],
                },
                Port {
                    name: "Low Noise".into(),
                    speeds: vec![Speed {
                        name: "100 kHz".into(),
                        gains: gains(1),
                    }],
                },
            ],
        }
    }

    #[test]
    fn test_validate_keeps_valid_indices() {
        let mut settings = AcquisitionSettings {
            port: 0,
            speed: 1,
            gain: 1,
            ..Default::default()
        };
        assert!(catalog().validate(&mut settings).is_empty());
        assert_eq!((settings.port, settings.speed, settings.gain), (0, 1, 1));
    }

    #[test]
    fn test_validate_resets_out_of_range() {
        let mut settings = AcquisitionSettings {
            port: 1,
            speed: 3,
            gain: 2,
            ..Default::default()
        };
        let resets = catalog().validate(&mut settings);
        assert_eq!(
            resets,
            vec![
                "Invalid speed index: 3. Reset to 0.".to_string(),
                "Invalid gain index: 2. Reset to 0.".to_string(),
            ]
        );
        assert_eq!((settings.port, settings.speed, settings.gain), (1, 0, 0));
    }

    #[test]
    fn test_validate_invalid_port_cascades() {
        let mut settings = AcquisitionSettings {
            port: 9,
            speed: 1,
            gain: 2,
            ..Default::default()
        };
        let resets = catalog().validate(&mut settings);
        assert_eq!(resets[0], "Invalid port index: 9. Reset to 0.");
        assert_eq!(settings.port, 0);
        // speed 1 exists on port 0 but offers only two gains
        assert_eq!(settings.speed, 1);
        assert_eq!(settings.gain, 0);
    }

    #[test]
    fn test_frame_dimensions_floor() {
        let region = CcdRegion {
            x: 0,
            y: 0,
            width: 1024,
            height: 1023,
        };
        assert_eq!(frame_dimensions(&region, 1), (1024, 1023));
        assert_eq!(frame_dimensions(&region, 2), (512, 511));
        assert_eq!(frame_dimensions(&region, 3), (341, 341));
        assert_eq!(frame_dimensions(&region, 0), (1024, 1023));
    }

    #[test]
    fn test_clamp_exposure() {
        assert_eq!(clamp_exposure(5, Duration::from_millis(2300)), 5);
        assert_eq!(clamp_exposure(1, Duration::from_millis(2300)), 3);
        assert_eq!(clamp_exposure(3, Duration::from_secs(3)), 3);
        assert_eq!(clamp_exposure(0, Duration::ZERO), 1);
        assert_eq!(
            clamp_exposure(MAX_EXPOSURE_SECONDS, Duration::from_secs(100)),
            MAX_EXPOSURE_SECONDS
        );
        assert_eq!(
            clamp_exposure(10, Duration::from_secs(70_000)),
            MAX_EXPOSURE_SECONDS
        );
    }

    #[test]
    fn test_exposure_period_subtracts_margin() {
        let settings = AcquisitionSettings {
            exposure_seconds: 5,
            ..Default::default()
        };
        assert_eq!(settings.exposure_period(), Duration::from_millis(4980));
    }

    struct FlakyOpen {
        failures_left: u32,
        opens: u32,
    }

    impl CameraDriver for FlakyOpen {
        fn name(&self) -> &str {
            "flaky"
        }
        fn open(&mut self) -> DriverResult<()> {
            self.opens += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                Err(DriverError::DeviceNotFound)
            } else {
                Ok(())
            }
        }
        fn close(&mut self) -> DriverResult<()> {
            Ok(())
        }
        fn commit_settings(&mut self, _: &AcquisitionSettings) -> DriverResult<ReadoutGeometry> {
            Err(DriverError::NotOpen)
        }
        fn start(&mut self, _: Duration, _: bool) -> DriverResult<()> {
            Ok(())
        }
        fn stop(&mut self) -> DriverResult<()> {
            Ok(())
        }
        fn temperature(&mut self) -> Option<f64> {
            None
        }
        fn port_catalog(&mut self) -> DriverResult<PortCatalog> {
            Ok(PortCatalog::default())
        }
        fn ccd_region(&self) -> CcdRegion {
            CcdRegion {
                x: 0,
                y: 0,
                width: 1,
                height: 1,
            }
        }
        fn poll_next_frame(&mut self, _: Duration) -> DriverResult<Option<Frame>> {
            Ok(None)
        }
    }

    fn fast_policy(max_attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(5),
            max_attempts,
        }
    }

    #[test]
    fn test_open_with_retry_waits_for_camera() {
        let mut driver = FlakyOpen {
            failures_left: 3,
            opens: 0,
        };
        let outcome = open_with_retry(&mut driver, fast_policy(None), || false).unwrap();
        assert_eq!(outcome, OpenOutcome::Opened);
        assert_eq!(driver.opens, 4);
    }

    #[test]
    fn test_open_with_retry_gives_up() {
        let mut driver = FlakyOpen {
            failures_left: 10,
            opens: 0,
        };
        let err = open_with_retry(&mut driver, fast_policy(Some(2)), || false).unwrap_err();
        assert!(matches!(err, DriverError::DeviceOpen(_)));
        assert_eq!(driver.opens, 2);
    }

    #[test]
    fn test_open_with_retry_cancelled() {
        let mut driver = FlakyOpen {
            failures_left: 10,
            opens: 0,
        };
        let outcome = open_with_retry(&mut driver, fast_policy(None), || true).unwrap();
        assert_eq!(outcome, OpenOutcome::Cancelled);
        assert_eq!(driver.opens, 0);
    }
}
