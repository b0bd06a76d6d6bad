//! Delivery of paired frames to disk and to external scripts.

use anyhow::{Context, Result};
use shared::frame_writer::{save_fits_auto, FitsHeader};
use shared::preferences::{FrameType, Preferences};
use shared::{Frame, Timestamp};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use tracing::{debug, warn};

/// Observation details recorded with every delivered frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    pub object: String,
    pub frame_type: FrameType,
    pub observers: String,
    pub observatory: String,
    pub telescope: String,
    pub exposure_seconds: u16,
    pub run_number: u32,
    /// Trigger time that ended the exposure
    pub trigger_time: Timestamp,
    pub exposure_start: Timestamp,
    pub camera_temperature: f64,
    pub camera: String,
}

impl FrameMetadata {
    pub fn new(
        prefs: &Preferences,
        frame: &Frame,
        timestamp: Timestamp,
        exposure_seconds: u16,
        camera: &str,
    ) -> Self {
        Self {
            object: prefs.effective_object_name(),
            frame_type: prefs.frame_type,
            observers: prefs.observers.clone(),
            observatory: prefs.observatory.clone(),
            telescope: prefs.telescope.clone(),
            exposure_seconds,
            run_number: prefs.run_number,
            trigger_time: timestamp,
            exposure_start: timestamp.subtract_seconds(exposure_seconds as i64),
            camera_temperature: frame.temperature,
            camera: camera.to_string(),
        }
    }

    pub fn gps_locked(&self) -> bool {
        self.trigger_time.valid && self.trigger_time.locked
    }

    /// Header cards in the order they are written
    pub fn header_cards(&self) -> FitsHeader {
        let mut cards = vec![
            ("RUN", format!("{:04}", self.run_number)),
            ("OBJECT", self.object.clone()),
            ("TYPE", format!("{:?}", self.frame_type).to_uppercase()),
            ("OBSERVER", self.observers.clone()),
            ("OBSERVAT", self.observatory.clone()),
            ("TELESCOP", self.telescope.clone()),
            ("INSTRUME", self.camera.clone()),
            ("EXPTIME", self.exposure_seconds.to_string()),
            ("CCD-TEMP", format!("{:.2}", self.camera_temperature)),
        ];
        if self.trigger_time.valid {
            cards.push(("UTC-BEG", self.exposure_start.to_string()));
            cards.push(("UTC-END", self.trigger_time.to_string()));
            cards.push((
                "GPS-LOCK",
                if self.trigger_time.locked { "T" } else { "F" }.to_string(),
            ));
        } else {
            cards.push(("UTC-BEG", "unavailable".to_string()));
            cards.push(("UTC-END", "unavailable".to_string()));
            cards.push(("GPS-LOCK", "F".to_string()));
        }
        cards
    }
}

/// Storage for delivered frames
pub trait FrameSink {
    /// Overwrite the live preview with this frame
    fn write_preview(&mut self, frame: &Frame, metadata: &FrameMetadata) -> Result<PathBuf>;

    /// Persist the frame. `path` is where the archive was requested; the
    /// returned path is where it was actually written.
    fn archive(&mut self, frame: &Frame, metadata: &FrameMetadata, path: &Path) -> Result<PathBuf>;
}

/// Notifications after each delivery step
pub trait DeliveryHooks {
    fn preview_written(&mut self, path: &Path);
    fn frame_saved(&mut self, path: &Path);
}

/// Hooks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl DeliveryHooks for NoHooks {
    fn preview_written(&mut self, _path: &Path) {}
    fn frame_saved(&mut self, _path: &Path) {}
}

/// Writes previews and archives as FITS images, gzip-compressed when the
/// path ends in `.gz`.
#[derive(Debug, Clone)]
pub struct FitsSink {
    preview_path: PathBuf,
}

impl FitsSink {
    pub fn new(preview_path: impl Into<PathBuf>) -> Self {
        Self {
            preview_path: preview_path.into(),
        }
    }
}

impl FrameSink for FitsSink {
    fn write_preview(&mut self, frame: &Frame, metadata: &FrameMetadata) -> Result<PathBuf> {
        let path = self.preview_path.clone();
        save_fits_auto(frame.pixels(), &metadata.header_cards(), &path)
            .with_context(|| format!("Failed to write preview {}", path.display()))?;
        Ok(path)
    }

    fn archive(&mut self, frame: &Frame, metadata: &FrameMetadata, path: &Path) -> Result<PathBuf> {
        if path.exists() {
            anyhow::bail!("Refusing to overwrite {}", path.display());
        }
        save_fits_auto(frame.pixels(), &metadata.header_cards(), path)
            .with_context(|| format!("Failed to save {}", path.display()))?;
        Ok(path.to_path_buf())
    }
}

/// Runs user scripts after previews and saves.
///
/// Scripts receive the written path as their only argument and run in the
/// background; a reaper thread collects each child so failures are logged.
#[derive(Debug, Clone, Default)]
pub struct ScriptHooks {
    pub preview_script: Option<PathBuf>,
    pub saved_script: Option<PathBuf>,
}

impl ScriptHooks {
    pub fn new(preview_script: Option<PathBuf>, saved_script: Option<PathBuf>) -> Self {
        Self {
            preview_script,
            saved_script,
        }
    }

    fn run(script: &Path, argument: &Path) {
        let child = Command::new(script).arg(argument).spawn();
        match child {
            Ok(mut child) => {
                let script = script.display().to_string();
                let reaper = thread::Builder::new()
                    .name("script-reaper".to_string())
                    .spawn(move || match child.wait() {
                        Ok(status) if status.success() => debug!("{script} finished"),
                        Ok(status) => warn!("{script} exited with {status}"),
                        Err(e) => warn!("Failed to wait for {script}: {e}"),
                    });
                if let Err(e) = reaper {
                    warn!("Failed to watch script: {e}");
                }
            }
            Err(e) => warn!("Failed to run {}: {e}", script.display()),
        }
    }
}

impl DeliveryHooks for ScriptHooks {
    fn preview_written(&mut self, path: &Path) {
        if let Some(script) = &self.preview_script {
            Self::run(script, path);
        }
    }

    fn frame_saved(&mut self, path: &Path) {
        if let Some(script) = &self.saved_script {
            Self::run(script, path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger() -> Timestamp {
        Timestamp {
            year: 2012,
            month: 1,
            day: 1,
            hours: 0,
            minutes: 0,
            seconds: 2,
            milliseconds: 0,
            locked: true,
            remaining_exposure: 0,
            valid: true,
        }
    }

    fn frame() -> Frame {
        Frame::from_raw(6, 4, &[500u16; 24])
            .unwrap()
            .with_temperature(-49.5)
    }

    #[test]
    fn test_metadata_exposure_start_rolls_back() {
        let prefs = Preferences {
            run_number: 12,
            ..Default::default()
        };
        let metadata = FrameMetadata::new(&prefs, &frame(), trigger(), 5, "Simulated camera");
        assert_eq!(metadata.object, "ec20058");
        assert_eq!(metadata.exposure_start.year, 2011);
        assert_eq!(metadata.exposure_start.month, 12);
        assert_eq!(metadata.exposure_start.day, 31);
        assert_eq!(metadata.exposure_start.seconds, 57);
        assert!(metadata.gps_locked());

        let cards = metadata.header_cards();
        assert!(cards.contains(&("RUN", "0012".to_string())));
        assert!(cards.contains(&("UTC-END", "2012-01-01 00:00:02.000".to_string())));
        assert!(cards.contains(&("CCD-TEMP", "-49.50".to_string())));
    }

    #[test]
    fn test_metadata_for_calibration_and_missing_time() {
        let prefs = Preferences {
            frame_type: FrameType::Dark,
            ..Default::default()
        };
        let metadata = FrameMetadata::new(&prefs, &frame(), Timestamp::invalid(), 5, "cam");
        assert_eq!(metadata.object, "DARK");
        assert!(!metadata.gps_locked());
        let cards = metadata.header_cards();
        assert!(cards.contains(&("TYPE", "DARK".to_string())));
        assert!(cards.contains(&("UTC-BEG", "unavailable".to_string())));
    }

    fn is_gzip(path: &Path) -> bool {
        std::fs::read(path).unwrap().starts_with(&[0x1f, 0x8b])
    }

    #[test]
    fn test_fits_sink_writes_compressed_files_at_requested_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut sink = FitsSink::new(dir.path().join("preview.fits.gz"));
        let metadata =
            FrameMetadata::new(&Preferences::default(), &frame(), trigger(), 2, "cam");

        let preview = sink.write_preview(&frame(), &metadata).unwrap();
        assert_eq!(preview, dir.path().join("preview.fits.gz"));
        assert!(is_gzip(&preview));
        // Previews are replaced every frame
        sink.write_preview(&frame(), &metadata).unwrap();

        let requested = dir.path().join("run-0007.fits.gz");
        let written = sink.archive(&frame(), &metadata, &requested).unwrap();
        assert_eq!(written, requested);
        assert!(is_gzip(&written));
        assert!(!dir.path().join("run-0007.fits").exists());
        assert!(sink.archive(&frame(), &metadata, &requested).is_err());
    }

    #[test]
    fn test_fits_sink_plain_path_is_uncompressed() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut sink = FitsSink::new(dir.path().join("preview.fits"));
        let metadata =
            FrameMetadata::new(&Preferences::default(), &frame(), trigger(), 2, "cam");
        let preview = sink.write_preview(&frame(), &metadata).unwrap();
        assert!(std::fs::read(&preview).unwrap().starts_with(b"SIMPLE"));
    }
}
