use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::event::{Event, EventType};
use crate::event_bus::EventBus;

// ---------------------------------------------------------------------------
// OpsLogEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpsLogLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// One line in the operations log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpsLogEntry {
    pub id: Uuid,
    pub level: OpsLogLevel,
    pub source: String,
    pub message: String,
    pub event_type: Option<EventType>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// OpsLog
// ---------------------------------------------------------------------------

/// Ring-buffer backed operations log using `VecDeque` for O(1) eviction.
///
/// Fed from the event bus (every operational event becomes a log line) and
/// readable by monitoring surfaces. Thread-safe and cheap to clone.
#[derive(Clone)]
pub struct OpsLog {
    inner: Arc<Mutex<OpsLogInner>>,
}

struct OpsLogInner {
    entries: VecDeque<OpsLogEntry>,
    max_stored: usize,
}

impl OpsLog {
    pub fn new(max_stored: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(OpsLogInner {
                entries: VecDeque::new(),
                max_stored: max_stored.max(1),
            })),
        }
    }

    /// Append an entry, evicting the oldest once over capacity. Returns
    /// the entry id.
    pub fn add(
        &self,
        level: OpsLogLevel,
        source: impl Into<String>,
        message: impl Into<String>,
        event_type: Option<EventType>,
    ) -> Uuid {
        let entry = OpsLogEntry {
            id: Uuid::new_v4(),
            level,
            source: source.into(),
            message: message.into(),
            event_type,
            created_at: Utc::now(),
        };
        let id = entry.id;
        let mut inner = self.inner.lock().expect("ops log lock poisoned");
        inner.entries.push_back(entry);
        while inner.entries.len() > inner.max_stored {
            inner.entries.pop_front();
        }
        id
    }

    /// Record a bus event as a log line.
    pub fn record_event(&self, event: &Event) -> Uuid {
        let level = match event.event_type {
            EventType::AgentError
            | EventType::BuildFailed
            | EventType::CodeReviewFailed
            | EventType::SystemError => OpsLogLevel::Error,
            EventType::TicketCompleted
            | EventType::TicketApproved
            | EventType::BuildCompleted
            | EventType::CodeReviewPassed => OpsLogLevel::Success,
            EventType::DirectiveHold => OpsLogLevel::Warning,
            _ => OpsLogLevel::Info,
        };
        self.add(
            level,
            "event_bus",
            event.event_type.as_str(),
            Some(event.event_type),
        )
    }

    /// The most recent `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<OpsLogEntry> {
        let inner = self.inner.lock().expect("ops log lock poisoned");
        inner.entries.iter().rev().take(limit).cloned().collect()
    }

    /// Entries at a given level, newest first.
    pub fn by_level(&self, level: OpsLogLevel, limit: usize) -> Vec<OpsLogEntry> {
        let inner = self.inner.lock().expect("ops log lock poisoned");
        inner
            .entries
            .iter()
            .rev()
            .filter(|e| e.level == level)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("ops log lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .expect("ops log lock poisoned")
            .entries
            .clear();
    }
}

/// Mirror every bus event into the ops log. The task ends when the bus is
/// dropped.
pub fn spawn_bus_recorder(log: OpsLog, bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let rx = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv_async().await {
            log.record_event(&event);
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
