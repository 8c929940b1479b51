//! Log fan-out backing the `StreamLogs` RPC.
//!
//! A bounded broadcast delivers structured entries to live subscribers; a
//! `tracing` layer feeds it from the normal logging macros. Streams always
//! start from "now" — entries carry a sequence id so a consumer can detect
//! loss, but there is no replay buffer.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::Level;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const BROADCAST_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&Level> for LogLevel {
    fn from(level: &Level) -> Self {
        match *level {
            Level::TRACE => LogLevel::Trace,
            Level::DEBUG => LogLevel::Debug,
            Level::INFO => LogLevel::Info,
            Level::WARN => LogLevel::Warn,
            Level::ERROR => LogLevel::Error,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
    pub ts_millis: u64,
}

/// Broadcast fan-out of log entries to live subscribers.
pub struct LogBroadcaster {
    sender: broadcast::Sender<LogEntry>,
    seq: AtomicU64,
}

impl LogBroadcaster {
    pub fn new() -> Arc<Self> {
        let (sender, _) = broadcast::channel(BROADCAST_BUFFER);
        Arc::new(Self {
            sender,
            seq: AtomicU64::new(0),
        })
    }

    pub fn publish(&self, level: LogLevel, target: &str, message: String) {
        let entry = LogEntry {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            level,
            target: target.to_string(),
            message,
            ts_millis: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        };
        let _ = self.sender.send(entry);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// `tracing` layer that mirrors events into a [`LogBroadcaster`].
pub struct CaptureLayer {
    broadcaster: Arc<LogBroadcaster>,
}

impl CaptureLayer {
    pub fn new(broadcaster: Arc<LogBroadcaster>) -> Self {
        Self { broadcaster }
    }
}

impl<S: tracing::Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.broadcaster.publish(
            event.metadata().level().into(),
            event.metadata().target(),
            visitor.into_message(),
        );
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl MessageVisitor {
    fn into_message(self) -> String {
        if self.fields.is_empty() {
            return self.message;
        }
        let fields: Vec<String> = self
            .fields
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if self.message.is_empty() {
            fields.join(" ")
        } else {
            format!("{} {}", self.message, fields.join(" "))
        }
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push((field.name().to_string(), format!("{value:?}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let logs = LogBroadcaster::new();
        let mut a = logs.subscribe();
        let mut b = logs.subscribe();

        logs.publish(LogLevel::Info, "corral::registry", "client registered".into());

        let ea = a.recv().await.unwrap();
        let eb = b.recv().await.unwrap();
        assert_eq!(ea.seq, eb.seq);
        assert_eq!(ea.message, "client registered");
        assert_eq!(ea.level, LogLevel::Info);
    }

    #[tokio::test]
    async fn sequence_is_monotonic() {
        let logs = LogBroadcaster::new();
        let mut rx = logs.subscribe();
        logs.publish(LogLevel::Warn, "t", "one".into());
        logs.publish(LogLevel::Error, "t", "two".into());
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.seq > first.seq);
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let logs = LogBroadcaster::new();
        logs.publish(LogLevel::Debug, "t", "dropped".into());
        assert_eq!(logs.subscriber_count(), 0);
    }

    #[test]
    fn level_ordering_supports_min_level_filtering() {
        assert!(LogLevel::Error > LogLevel::Warn);
        assert!(LogLevel::Warn > LogLevel::Info);
        assert!(LogLevel::Info > LogLevel::Debug);
    }

    #[test]
    fn level_parses_from_str() {
        assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("ERROR".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
