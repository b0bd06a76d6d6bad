//! Push-style log channel for user interfaces.
//!
//! [`LogChannelLayer`] is a tracing subscriber layer that forwards every event
//! to each receiver registered with a [`LogBroadcaster`]. Interfaces render
//! entries with [`LogEntry::line`].
//!
//! # Usage
//!
//! 1. Create a `LogBroadcaster` behind an `Arc`
//! 2. Add a `LogChannelLayer` built from it to the tracing registry
//! 3. Call `subscribe` for each consumer

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<Level> for LogLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::TRACE => LogLevel::Trace,
            Level::DEBUG => LogLevel::Debug,
            Level::INFO => LogLevel::Info,
            Level::WARN => LogLevel::Warn,
            Level::ERROR => LogLevel::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
}

impl LogEntry {
    /// `[HH:MM:SS.mmm] message`
    pub fn line(&self) -> String {
        format!("[{}] {}", self.timestamp.format("%H:%M:%S%.3f"), self.message)
    }
}

/// Fan-out of log entries to any number of receivers.
#[derive(Debug)]
pub struct LogBroadcaster {
    subscribers: Mutex<Vec<Sender<LogEntry>>>,
    capacity: usize,
}

impl LogBroadcaster {
    /// `capacity` bounds each subscriber's backlog; entries for a full
    /// subscriber are dropped.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn broadcast(&self, entry: LogEntry) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|tx| match tx.try_send(entry.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscribe(&self) -> Receiver<LogEntry> {
        let (tx, rx) = crossbeam_channel::bounded(self.capacity);
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}

struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" || self.message.is_empty() {
            self.message = format!("{value:?}");
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" || self.message.is_empty() {
            self.message = value.to_string();
        }
    }
}

/// Tracing layer that forwards events to a [`LogBroadcaster`].
pub struct LogChannelLayer {
    broadcaster: Arc<LogBroadcaster>,
    min_level: Level,
}

impl LogChannelLayer {
    pub fn new(broadcaster: Arc<LogBroadcaster>) -> Self {
        Self {
            broadcaster,
            min_level: Level::INFO,
        }
    }

    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }
}

impl<S> Layer<S> for LogChannelLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > self.min_level {
            return;
        }

        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);

        self.broadcaster.broadcast(LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::from(*metadata.level()),
            target: metadata.target().to_string(),
            message: visitor.message,
        });
    }
}
