//! Observation preferences shared between the UI and the coordinator.
//!
//! Preferences live behind a mutex in a [`PreferenceStore`] and are written
//! back to disk as JSON after every mutation, so a crash never loses more than
//! the mutation in flight.

use crate::camera_interface::AcquisitionSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error("preferences I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("preferences file is malformed: {0}")]
    Format(#[from] serde_json::Error),
    #[error("Unable to toggle save: countdown is zero.")]
    CountdownExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    Dark,
    Flat,
    Focus,
    Target,
}

impl FrameType {
    pub fn is_calibration(&self) -> bool {
        !matches!(self, FrameType::Target)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    pub output_dir: PathBuf,
    pub run_prefix: String,
    pub run_number: u32,
    pub frame_type: FrameType,
    /// Target name; calibration frames use their type name instead
    pub object_name: String,
    pub observers: String,
    pub observatory: String,
    pub telescope: String,
    /// Burst length restored whenever a calibration frame type is selected
    pub calibration_default_framecount: u32,
    /// Calibration frames still to be saved in the current burst
    pub burst_countdown: u32,
    pub save_frames: bool,
    pub camera: AcquisitionSettings,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            run_prefix: "run".to_string(),
            run_number: 0,
            frame_type: FrameType::Target,
            object_name: "ec20058".to_string(),
            observers: "DJS, PC".to_string(),
            observatory: "MJUO".to_string(),
            telescope: "MJUO 1-meter".to_string(),
            calibration_default_framecount: 30,
            burst_countdown: 30,
            save_frames: false,
            camera: AcquisitionSettings::default(),
        }
    }
}

impl Preferences {
    pub fn allow_save(&self) -> bool {
        self.frame_type == FrameType::Target || self.burst_countdown > 0
    }

    /// Object name written into frame metadata
    pub fn effective_object_name(&self) -> String {
        match self.frame_type {
            FrameType::Dark => "DARK".to_string(),
            FrameType::Flat => "FLAT".to_string(),
            FrameType::Focus => "FOCUS".to_string(),
            FrameType::Target => self.object_name.clone(),
        }
    }

    /// Archive path the next saved frame will be written to
    pub fn archive_path(&self) -> PathBuf {
        self.output_dir.join(format!(
            "{}-{:04}.fits.gz",
            self.run_prefix, self.run_number
        ))
    }

    /// Load from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, PreferenceError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Save to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), PreferenceError> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Mutex-guarded preferences with optional file persistence.
#[derive(Debug)]
pub struct PreferenceStore {
    path: Option<PathBuf>,
    inner: Mutex<Preferences>,
}

impl PreferenceStore {
    /// Load preferences from `path`, falling back to defaults if the file is
    /// missing or unreadable. The resulting state is written back immediately.
    pub fn load_or_default<P: Into<PathBuf>>(path: P) -> Result<Self, PreferenceError> {
        let path = path.into();
        let prefs = match Preferences::load_from_file(&path) {
            Ok(prefs) => prefs,
            Err(PreferenceError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Could not open `{}`. Initialising with default settings",
                    path.display()
                );
                Preferences::default()
            }
            Err(e) => {
                warn!(
                    "Ignoring unreadable preferences `{}`: {e}. Initialising with default settings",
                    path.display()
                );
                Preferences::default()
            }
        };
        prefs.save_to_file(&path)?;
        Ok(Self {
            path: Some(path),
            inner: Mutex::new(prefs),
        })
    }

    /// Store that never touches the filesystem
    pub fn in_memory(prefs: Preferences) -> Self {
        Self {
            path: None,
            inner: Mutex::new(prefs),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> Preferences {
        self.lock().clone()
    }

    /// Apply an edit and persist the result.
    pub fn update<F>(&self, edit: F) -> Result<(), PreferenceError>
    where
        F: FnOnce(&mut Preferences),
    {
        let mut prefs = self.lock();
        edit(&mut prefs);
        self.persist(&prefs)
    }

    /// Select a frame type; calibration types start a fresh burst.
    pub fn set_frame_type(&self, frame_type: FrameType) -> Result<(), PreferenceError> {
        self.update(|prefs| {
            prefs.frame_type = frame_type;
            if frame_type.is_calibration() {
                prefs.burst_countdown = prefs.calibration_default_framecount;
            }
        })
    }

    /// Record a saved frame.
    ///
    /// Bumps the run number and, for calibration frames, counts down the
    /// burst. Saving switches off when the burst completes.
    pub fn increment_run_number(&self) -> Result<u32, PreferenceError> {
        let mut prefs = self.lock();
        prefs.run_number += 1;
        if prefs.frame_type.is_calibration() && prefs.burst_countdown > 0 {
            prefs.burst_countdown -= 1;
            if prefs.burst_countdown == 0 {
                prefs.save_frames = false;
                info!("Calibration burst complete. Saving disabled.");
            }
        }
        let run_number = prefs.run_number;
        self.persist(&prefs)?;
        Ok(run_number)
    }

    pub fn allow_save(&self) -> bool {
        self.lock().allow_save()
    }

    /// Flip the save toggle, returning the new state.
    ///
    /// Refused while the calibration countdown is exhausted.
    pub fn toggle_save(&self) -> Result<bool, PreferenceError> {
        let mut prefs = self.lock();
        if !prefs.allow_save() {
            return Err(PreferenceError::CountdownExhausted);
        }
        prefs.save_frames = !prefs.save_frames;
        let saving = prefs.save_frames;
        self.persist(&prefs)?;
        Ok(saving)
    }

    pub fn acquisition_settings(&self) -> AcquisitionSettings {
        self.lock().camera
    }

    pub fn set_acquisition_settings(
        &self,
        settings: AcquisitionSettings,
    ) -> Result<(), PreferenceError> {
        self.update(|prefs| prefs.camera = settings)
    }

    fn persist(&self, prefs: &Preferences) -> Result<(), PreferenceError> {
        match &self.path {
            Some(path) => prefs.save_to_file(path),
            None => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Preferences> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn calibration(countdown: u32) -> Preferences {
        Preferences {
            frame_type: FrameType::Dark,
            burst_countdown: countdown,
            save_frames: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let prefs = Preferences::default();
        assert_eq!(prefs.observatory, "MJUO");
        assert_eq!(prefs.telescope, "MJUO 1-meter");
        assert_eq!(prefs.camera.exposure_seconds, 5);
        assert_eq!(prefs.calibration_default_framecount, 30);
        assert!(prefs.camera.monitor_logic_output);
        assert!(!prefs.save_frames);
    }

    #[test]
    fn test_increment_counts_down_calibration_burst() {
        let store = PreferenceStore::in_memory(Preferences {
            run_number: 7,
            ..calibration(2)
        });
        assert_eq!(store.increment_run_number().unwrap(), 8);
        assert_eq!(store.snapshot().burst_countdown, 1);
        assert!(store.allow_save());

        assert_eq!(store.increment_run_number().unwrap(), 9);
        let prefs = store.snapshot();
        assert_eq!(prefs.burst_countdown, 0);
        assert!(!prefs.save_frames);
        assert!(!store.allow_save());
    }

    #[test]
    fn test_increment_target_leaves_countdown() {
        let store = PreferenceStore::in_memory(Preferences {
            frame_type: FrameType::Target,
            burst_countdown: 0,
            ..Default::default()
        });
        store.increment_run_number().unwrap();
        assert_eq!(store.snapshot().burst_countdown, 0);
        assert!(store.allow_save());
    }

    #[test]
    fn test_toggle_save_refused_when_countdown_zero() {
        let store = PreferenceStore::in_memory(calibration(0));
        let err = store.toggle_save().unwrap_err();
        assert!(matches!(err, PreferenceError::CountdownExhausted));
        assert_eq!(err.to_string(), "Unable to toggle save: countdown is zero.");
    }

    #[test]
    fn test_toggle_save_flips() {
        let store = PreferenceStore::in_memory(Preferences::default());
        assert!(store.toggle_save().unwrap());
        assert!(!store.toggle_save().unwrap());
    }

    #[test]
    fn test_effective_object_name() {
        let mut prefs = Preferences::default();
        assert_eq!(prefs.effective_object_name(), "ec20058");
        prefs.frame_type = FrameType::Dark;
        assert_eq!(prefs.effective_object_name(), "DARK");
        prefs.frame_type = FrameType::Flat;
        assert_eq!(prefs.effective_object_name(), "FLAT");
    }

    #[test]
    fn test_archive_path() {
        let prefs = Preferences {
            output_dir: PathBuf::from("/data"),
            run_prefix: "ec".to_string(),
            run_number: 42,
            ..Default::default()
        };
        assert_eq!(prefs.archive_path(), PathBuf::from("/data/ec-0042.fits.gz"));
    }

    #[test]
    fn test_set_frame_type_restarts_burst() {
        let store = PreferenceStore::in_memory(calibration(0));
        store.set_frame_type(FrameType::Flat).unwrap();
        assert_eq!(store.snapshot().burst_countdown, 30);
    }

    #[test]
    fn test_load_or_default_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("preferences.dat");

        let store = PreferenceStore::load_or_default(&path).unwrap();
        assert!(path.exists());
        store.update(|p| p.run_number = 12).unwrap();

        let reloaded = PreferenceStore::load_or_default(&path).unwrap();
        assert_eq!(reloaded.snapshot().run_number, 12);
    }

    #[test]
    fn test_load_or_default_replaces_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("preferences.dat");
        std::fs::write(&path, b"\x00\x01 not json").unwrap();

        let store = PreferenceStore::load_or_default(&path).unwrap();
        assert_eq!(store.snapshot(), Preferences::default());
    }
}
