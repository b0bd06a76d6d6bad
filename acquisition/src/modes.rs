//! Worker modes published through lock-free cells.
//!
//! Each cell has exactly one writer: the coordinator writes desired modes,
//! the camera worker writes [`CameraMode`] and the timer worker writes
//! [`TimerMode`]. Stores use release ordering and loads acquire ordering, so a
//! reader that observes a mode also observes everything its writer did
//! before publishing it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};

/// Enum that can be stored in a [`ModeCell`]
pub trait AtomicMode: Copy {
    fn to_u8(self) -> u8;
    /// Decode a stored value; unknown values decode to the terminal mode
    fn from_u8(value: u8) -> Self;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CameraMode {
    Initialising = 0,
    Idle = 1,
    AcquireStart = 2,
    Acquiring = 3,
    AcquireStop = 4,
    Shutdown = 5,
}

impl AtomicMode for CameraMode {
    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => CameraMode::Initialising,
            1 => CameraMode::Idle,
            2 => CameraMode::AcquireStart,
            3 => CameraMode::Acquiring,
            4 => CameraMode::AcquireStop,
            _ => CameraMode::Shutdown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TimerMode {
    Idle = 0,
    /// Start requested, waiting for the camera to arm
    Align = 1,
    Exposing = 2,
    /// Exposing, and the camera is reading out the latest trigger
    Readout = 3,
    Shutdown = 4,
}

impl TimerMode {
    /// True while the timer may be pulsing the camera trigger
    pub fn is_exposing(&self) -> bool {
        matches!(self, TimerMode::Exposing | TimerMode::Readout)
    }
}

impl AtomicMode for TimerMode {
    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => TimerMode::Idle,
            1 => TimerMode::Align,
            2 => TimerMode::Exposing,
            3 => TimerMode::Readout,
            _ => TimerMode::Shutdown,
        }
    }
}

/// What the coordinator wants a worker to be doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DesiredMode {
    Idle = 0,
    Acquiring = 1,
    Shutdown = 2,
}

impl AtomicMode for DesiredMode {
    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => DesiredMode::Idle,
            1 => DesiredMode::Acquiring,
            _ => DesiredMode::Shutdown,
        }
    }
}

pub struct ModeCell<M> {
    value: AtomicU8,
    _mode: PhantomData<M>,
}

impl<M: AtomicMode> ModeCell<M> {
    pub fn new(initial: M) -> Self {
        Self {
            value: AtomicU8::new(initial.to_u8()),
            _mode: PhantomData,
        }
    }

    pub fn load(&self) -> M {
        M::from_u8(self.value.load(Ordering::Acquire))
    }

    pub fn store(&self, mode: M) {
        self.value.store(mode.to_u8(), Ordering::Release);
    }

    /// Store `mode` and return the previous mode
    pub fn swap(&self, mode: M) -> M {
        M::from_u8(self.value.swap(mode.to_u8(), Ordering::AcqRel))
    }
}

impl<M: AtomicMode + fmt::Debug> fmt::Debug for ModeCell<M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("ModeCell").field(&self.load()).finish()
    }
}
