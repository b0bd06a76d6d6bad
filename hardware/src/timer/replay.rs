//! Timer link that plays back recorded or scripted bytes.
//!
//! Used to replay captured serial dumps through the decoder and to drive the
//! timer worker deterministically in tests. Everything written to the link is
//! kept in a [`SentFrames`] log.

use super::messages::TimerCommand;
use super::protocol::{FramerEvent, PacketFramer};
use super::{GpsStatus, LinkError, TimerLink};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Producer side of a [`ReplayLink::channel`]
#[derive(Debug, Clone)]
pub struct ReplayFeed {
    tx: Sender<Vec<u8>>,
}

impl ReplayFeed {
    /// Queue bytes for the link to "receive". Returns false once the link is
    /// gone.
    pub fn push(&self, bytes: impl Into<Vec<u8>>) -> bool {
        self.tx.send(bytes.into()).is_ok()
    }
}

/// Shared record of frames written to a replay link
#[derive(Debug, Clone, Default)]
pub struct SentFrames {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl SentFrames {
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Decode everything sent so far as timer commands
    pub fn commands(&self) -> Vec<TimerCommand> {
        let mut framer = PacketFramer::new();
        self.frames()
            .iter()
            .flat_map(|frame| framer.push_bytes(frame))
            .filter_map(|event| match event {
                FramerEvent::Packet(packet) => TimerCommand::from_packet(&packet).ok(),
                FramerEvent::Malformed(_) => None,
            })
            .collect()
    }

    fn record(&self, frame: &[u8]) {
        self.frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(frame.to_vec());
    }
}

#[derive(Debug)]
pub struct ReplayLink {
    connected: bool,
    pending: VecDeque<u8>,
    feed: Option<Receiver<Vec<u8>>>,
    sent: SentFrames,
    chunk_size: usize,
    refuse_connect: bool,
}

impl ReplayLink {
    /// Replay a fixed byte stream, then go quiet
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            connected: false,
            pending: bytes.into(),
            feed: None,
            sent: SentFrames::default(),
            chunk_size: 64,
            refuse_connect: false,
        }
    }

    /// Link fed incrementally through the returned [`ReplayFeed`]
    pub fn channel() -> (ReplayFeed, Self) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut link = Self::from_bytes(Vec::new());
        link.feed = Some(rx);
        (ReplayFeed { tx }, link)
    }

    /// A link whose `connect` always fails
    pub fn unreachable() -> Self {
        let mut link = Self::from_bytes(Vec::new());
        link.refuse_connect = true;
        link
    }

    /// Deliver at most `chunk_size` bytes per `receive`
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn sent_frames(&self) -> SentFrames {
        self.sent.clone()
    }

    fn take_feed(&mut self, timeout: Duration) {
        let Some(feed) = &self.feed else {
            thread::sleep(timeout);
            return;
        };
        match feed.recv_timeout(timeout) {
            Ok(bytes) => {
                self.pending.extend(bytes);
                while let Ok(more) = feed.try_recv() {
                    self.pending.extend(more);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                self.feed = None;
                thread::sleep(timeout);
            }
        }
    }
}

impl TimerLink for ReplayLink {
    fn name(&self) -> &str {
        "Replay"
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        if self.refuse_connect {
            return Err(LinkError::NotFound("replay link set to refuse".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        self.connected = false;
        Ok(())
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        self.sent.record(frame);
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        if self.pending.is_empty() {
            self.take_feed(timeout);
        }
        let n = buf.len().min(self.chunk_size).min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn gps_status(&self) -> GpsStatus {
        if self.connected {
            GpsStatus::Active
        } else {
            GpsStatus::Unavailable
        }
    }
}
