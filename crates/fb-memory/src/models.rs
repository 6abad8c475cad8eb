use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ---------------------------------------------------------------------------
// TicketMemory
// ---------------------------------------------------------------------------

/// Record of a resolved ticket, kept for cross-session recall.
///
/// Immutable after creation except for access bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketMemory {
    pub ticket_id: String,
    pub app: String,
    #[serde(default)]
    pub app_version: Option<String>,
    pub title: String,
    pub problem_summary: String,
    pub solution_summary: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub ticket_type: String,
    /// `YYYY-MM-DD` resolution date.
    pub resolved_date: String,
    #[serde(default)]
    pub access_count: u32,
    #[serde(default)]
    pub last_accessed: Option<DateTime<Utc>>,
    /// Relevance in `[0, 1]`; decays with age during pruning.
    #[serde(default = "default_relevance")]
    pub relevance_score: f64,
}

fn default_relevance() -> f64 {
    1.0
}

impl TicketMemory {
    /// Record an access.
    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed = Some(Utc::now());
    }
}

// ---------------------------------------------------------------------------
// TicketSnapshot
// ---------------------------------------------------------------------------

/// The value-level view of a ticket handed to the memory manager when a
/// ticket resolves. Keeps the memory crate decoupled from the ticket store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketSnapshot {
    pub ticket_id: String,
    pub app: String,
    #[serde(default)]
    pub app_version: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: String,
    pub ticket_type: String,
    #[serde(default)]
    pub problem_summary: Option<String>,
    #[serde(default)]
    pub solution_summary: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub resolved_date: Option<String>,
}

// ---------------------------------------------------------------------------
// FixPattern
// ---------------------------------------------------------------------------

/// A recurring fix aggregated from multiple ticket memories. Re-derivable
/// from the underlying memories at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixPattern {
    pub pattern_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub file_patterns: Vec<String>,
    #[serde(default)]
    pub keyword_triggers: Vec<String>,
    #[serde(default)]
    pub solution_template: String,
    #[serde(default)]
    pub occurrence_count: usize,
    #[serde(default)]
    pub example_ticket_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// SessionContext
// ---------------------------------------------------------------------------

/// A discovery made mid-session, recorded append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDiscovery {
    pub discovery: String,
    pub category: String,
    pub timestamp: DateTime<Utc>,
}

/// A single agent's working set: which memories and patterns are already
/// loaded, plus discoveries made along the way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    pub agent_name: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub current_app: Option<String>,
    #[serde(default)]
    pub current_ticket: Option<String>,
    #[serde(default)]
    pub loaded_memories: BTreeSet<String>,
    #[serde(default)]
    pub loaded_patterns: BTreeSet<String>,
    #[serde(default)]
    pub session_discoveries: Vec<SessionDiscovery>,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            agent_name: agent_name.into(),
            started_at: Utc::now(),
            current_app: None,
            current_ticket: None,
            loaded_memories: BTreeSet::new(),
            loaded_patterns: BTreeSet::new(),
            session_discoveries: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
