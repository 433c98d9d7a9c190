use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::raft::{NodeId, RaftError, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    StateChange,
    ElectionStarted,
    SplitVote,
    VoteRequested,
    VoteGranted,
    VoteDenied,
    VoteReceived,
    BecameLeader,
    SteppedDown,
    TermAdopted,
    HeartbeatSent,
    HeartbeatReceived,
    HeartbeatRejected,
}

impl EventKind {
    /// Per-message chatter that would drown the log at `info`.
    fn is_chatter(&self) -> bool {
        matches!(
            self,
            EventKind::HeartbeatSent | EventKind::HeartbeatReceived | EventKind::VoteRequested
        )
    }
}

/// One entry of the append-only election event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionEvent {
    pub timestamp_ms: u64,
    pub kind: EventKind,
    pub node_id: NodeId,
    pub term: Term,
    /// The other party of a message exchange, if any.
    pub peer: Option<NodeId>,
    pub message: String,
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: ElectionEvent);
}

/// Writes events through the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEventSink;

/// Renders a unix-millisecond timestamp as `%Y-%m-%d %H:%M:%S` in UTC.
pub fn format_timestamp(timestamp_ms: u64) -> String {
    i64::try_from(timestamp_ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

impl EventSink for LogEventSink {
    fn record(&self, event: ElectionEvent) {
        let at = format_timestamp(event.timestamp_ms);
        if event.kind.is_chatter() {
            debug!(
                target: "elector::events",
                "[{}] Event={:?} Node={} Term={} Message={}",
                at, event.kind, event.node_id, event.term, event.message
            );
        } else {
            info!(
                target: "elector::events",
                "[{}] Event={:?} Node={} Term={} Message={}",
                at, event.kind, event.node_id, event.term, event.message
            );
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn record(&self, _event: ElectionEvent) {}
}

/// Keeps every event in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<ElectionEvent>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ElectionEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<ElectionEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemoryEventSink {
    fn record(&self, event: ElectionEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Appends one JSON document per line to a file.
pub struct JsonLinesEventSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesEventSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, RaftError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn flush(&self) -> Result<(), RaftError> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()?;
        Ok(())
    }
}

impl EventSink for JsonLinesEventSink {
    fn record(&self, event: ElectionEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode election event: {e}");
                return;
            }
        };
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(writer, "{line}") {
            warn!("Failed to append election event: {e}");
        }
    }
}

impl Drop for JsonLinesEventSink {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Failed to flush event log: {e}");
        }
    }
}

/// Forwards each event to several sinks.
#[derive(Clone, Default)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutEventSink {
    fn record(&self, event: ElectionEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}
