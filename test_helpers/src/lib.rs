//! Testing utilities shared across the workspace.
//!
//! * Synthetic frames and timestamps.
//! * Timer wire-stream builders, for feeding a
//!   [`ReplayLink`](hardware::timer::ReplayLink).
//! * Log capture on the current thread.
//!
//! ```rust
//! use test_helpers::{download_time_bytes, timestamp_at};
//!
//! let bytes = download_time_bytes(timestamp_at(2012, 1, 1, 0, 0, 2));
//! assert_eq!(bytes[0], 0x10);
//! ```

use crossbeam_channel::Receiver;
use hardware::timer::{Packet, PacketType, TimerMessage};
use shared::log_stream::{LogBroadcaster, LogChannelLayer, LogEntry};
use shared::{Frame, Timestamp};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::layer::SubscriberExt;

/// A locked, valid timestamp with zero milliseconds
pub fn timestamp_at(year: i32, month: u8, day: u8, hours: u8, minutes: u8, seconds: u8) -> Timestamp {
    Timestamp {
        year,
        month,
        day,
        hours,
        minutes,
        seconds,
        milliseconds: 0,
        locked: true,
        remaining_exposure: 0,
        valid: true,
    }
}

/// Frame filled with a horizontal ramp, so rows are distinguishable
pub fn ramp_frame(width: u16, height: u16) -> Frame {
    let data: Vec<u16> = (0..height as usize * width as usize)
        .map(|i| (i % width as usize) as u16)
        .collect();
    Frame::from_raw(width, height, &data).expect("ramp dimensions are non-zero")
}

/// Framed bytes for a packet
pub fn packet_bytes(kind: PacketType, error: u8, payload: &[u8]) -> Vec<u8> {
    Packet::new(kind, error, payload.to_vec())
        .encode()
        .expect("test payload fits in a packet")
}

/// Framed `DOWNLOAD_TIME` report
pub fn download_time_bytes(timestamp: Timestamp) -> Vec<u8> {
    TimerMessage::DownloadTime(timestamp)
        .to_packet()
        .encode()
        .expect("timestamp fits in a packet")
}

/// Framed `CURRENT_TIME` report
pub fn current_time_bytes(timestamp: Timestamp) -> Vec<u8> {
    TimerMessage::CurrentTime(timestamp)
        .to_packet()
        .encode()
        .expect("timestamp fits in a packet")
}

/// Framed `DEBUG_STRING`
pub fn debug_string_bytes(text: &str) -> Vec<u8> {
    packet_bytes(PacketType::DebugString, 0, text.as_bytes())
}

/// Events logged on the current thread while the capture is alive
pub struct LogCapture {
    _guard: DefaultGuard,
    entries: Receiver<LogEntry>,
    // Keeps the subscriber list alive after the layer is dropped
    _broadcaster: Arc<LogBroadcaster>,
}

impl LogCapture {
    /// Capture INFO and above on the current thread
    pub fn start() -> Self {
        let broadcaster = Arc::new(LogBroadcaster::new(4096));
        let entries = broadcaster.subscribe();
        let subscriber =
            tracing_subscriber::registry().with(LogChannelLayer::new(Arc::clone(&broadcaster)));
        let guard = tracing::subscriber::set_default(subscriber);
        Self {
            _guard: guard,
            entries,
            _broadcaster: broadcaster,
        }
    }

    /// Messages logged since the last call
    pub fn messages(&self) -> Vec<String> {
        self.entries.try_iter().map(|entry| entry.message).collect()
    }
}

/// Poll `condition` every couple of milliseconds until it holds or `timeout`
/// passes. Returns the final result.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hardware::timer::{FramerEvent, PacketFramer};

    #[test]
    fn test_ramp_frame() {
        let frame = ramp_frame(8, 3);
        assert_eq!(frame.pixels()[[2, 5]], 5);
    }

    #[test]
    fn test_wire_builders_parse_back() {
        let mut stream = download_time_bytes(timestamp_at(2012, 1, 1, 0, 0, 2));
        stream.extend(debug_string_bytes("hello"));
        let mut framer = PacketFramer::new();
        let events = framer.push_bytes(&stream);
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|event| matches!(event, FramerEvent::Packet(_))));
    }

    #[test]
    fn test_log_capture() {
        let capture = LogCapture::start();
        tracing::info!("captured line");
        tracing::debug!("not captured");
        assert_eq!(capture.messages(), vec!["captured line".to_string()]);
    }
}
