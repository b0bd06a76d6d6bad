//! Command line configuration for the `acquire` binary.

use crate::camera_worker::CameraWorkerConfig;
use crate::coordinator::CoordinatorConfig;
use clap::Parser;
use shared::camera_interface::simulated::SimulatedCameraConfig;
use shared::camera_interface::RetryPolicy;
use shared::DEFAULT_QUEUE_CAPACITY;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("queue capacity must be at least 1")]
    QueueCapacity,
    #[error("simulated sensor must be at least 1x1 pixels")]
    SensorSize,
    #[error("no camera driver available; pass --simulate-camera")]
    NoCamera,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "GPS-triggered CCD acquisition", long_about = None)]
pub struct Args {
    /// Use the software camera
    #[arg(long)]
    pub simulate_camera: bool,

    /// Use the software timer instead of the serial unit
    #[arg(long)]
    pub simulate_timer: bool,

    /// Serial port of the timer; located by USB ID when omitted
    #[arg(long, conflicts_with = "simulate_timer")]
    pub timer_port: Option<String>,

    #[arg(long, default_value = "preferences.dat")]
    pub preferences: PathBuf,

    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,

    /// Soft capacity of the frame and timestamp queues
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    #[arg(long, default_value_t = 512)]
    pub sim_width: u16,

    #[arg(long, default_value_t = 512)]
    pub sim_height: u16,

    #[arg(long, default_value_t = 500)]
    pub camera_retry_interval_ms: u64,

    /// Attempts to find the camera before giving up, 0 for no limit
    #[arg(long, default_value_t = 0)]
    pub camera_retry_attempts: u32,

    #[arg(long, default_value = "preview.fits.gz")]
    pub preview_path: PathBuf,

    /// Run after every preview is written, with the preview path
    #[arg(long)]
    pub preview_script: Option<PathBuf>,

    /// Run after every saved frame, with the archive path
    #[arg(long)]
    pub saved_script: Option<PathBuf>,

    /// Start exposures once both devices are ready
    #[arg(long)]
    pub autostart: bool,
}

impl Args {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::QueueCapacity);
        }
        if self.sim_width == 0 || self.sim_height == 0 {
            return Err(ConfigError::SensorSize);
        }
        if !self.simulate_camera {
            return Err(ConfigError::NoCamera);
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.camera_retry_interval_ms.max(1)),
            max_attempts: match self.camera_retry_attempts {
                0 => None,
                n => Some(n),
            },
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            autostart: self.autostart,
            camera: CameraWorkerConfig {
                retry: self.retry_policy(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn simulated_camera(&self) -> SimulatedCameraConfig {
        SimulatedCameraConfig {
            width: self.sim_width,
            height: self.sim_height,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["acquire", "--simulate-camera"]);
        assert_eq!(args.preferences, PathBuf::from("preferences.dat"));
        assert_eq!(args.log_dir, PathBuf::from("logs"));
        assert_eq!(args.queue_capacity, 64);
        assert_eq!(args.retry_policy().max_attempts, None);
        assert_eq!(args.retry_policy().interval, Duration::from_millis(500));
        assert_eq!(args.simulated_camera().width, 512);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let args = Args::parse_from(["acquire", "--simulate-camera", "--queue-capacity", "0"]);
        assert_eq!(args.validate(), Err(ConfigError::QueueCapacity));

        let args = Args::parse_from(["acquire"]);
        assert_eq!(args.validate(), Err(ConfigError::NoCamera));
    }

    #[test]
    fn test_retry_attempts() {
        let args = Args::parse_from([
            "acquire",
            "--simulate-camera",
            "--camera-retry-attempts",
            "4",
        ]);
        assert_eq!(args.coordinator_config().camera.retry.max_attempts, Some(4));
    }

    #[test]
    fn test_timer_port_conflicts_with_simulation() {
        let result = Args::try_parse_from([
            "acquire",
            "--simulate-timer",
            "--timer-port",
            "/dev/ttyUSB0",
        ]);
        assert!(result.is_err());
    }
}
