//! GPS timer unit
//!
//! The timer disciplines its clock against GPS, pulses the camera's external
//! trigger at the requested exposure interval and reports the time of every
//! pulse over a USB serial link.

pub mod messages;
pub mod protocol;
pub mod replay;
pub mod serial;
pub mod simulated;

pub use messages::{DecodeError, TimerCommand, TimerMessage};
pub use protocol::{FramerEvent, Malformed, MalformedReason, Packet, PacketFramer, PacketType};
pub use replay::ReplayLink;
pub use serial::{find_timer_port, SerialTimerLink};
pub use simulated::SimulatedTimer;

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("timer link is not connected")]
    NotConnected,
    #[error("no timer unit found: {0}")]
    NotFound(String),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("timer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Link-level view of the GPS timer.
///
/// Links report `Active` once connected; the timer worker downgrades that to
/// `Syncing` until the first well-formed packet parses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpsStatus {
    #[default]
    Unavailable,
    /// Connected, waiting for the first well-formed packet
    Syncing,
    Active,
}

/// Byte transport to a timer unit.
///
/// Owned by a single worker thread; implementations need to be `Send` only.
pub trait TimerLink: Send {
    fn name(&self) -> &str;

    fn connect(&mut self) -> Result<(), LinkError>;

    fn disconnect(&mut self) -> Result<(), LinkError>;

    /// Write one already framed packet.
    fn send_frame(&mut self, frame: &[u8]) -> Result<(), LinkError>;

    /// Read whatever has arrived, waiting at most `timeout`.
    ///
    /// Returns `Ok(0)` when nothing arrived in time.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError>;

    fn gps_status(&self) -> GpsStatus;

    fn is_simulated(&self) -> bool {
        false
    }
}

/// Frame and send a command.
pub fn send_command(link: &mut dyn TimerLink, command: TimerCommand) -> Result<(), LinkError> {
    link.send_frame(&command.encode())
}
