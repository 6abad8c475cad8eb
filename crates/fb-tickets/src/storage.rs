use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::json_store::JsonTicketStore;
use crate::models::{AgentRecord, Ticket, TicketPriority, TicketStatus, TicketType};
use crate::sqlite_store::SqliteTicketStore;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TicketStoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Filters for `list`. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<TicketStatus>,
    pub priority: Option<TicketPriority>,
    pub ticket_type: Option<TicketType>,
    pub assigned_to: Option<String>,
    /// Matches tickets carrying any of these labels.
    pub labels: Vec<String>,
    pub limit: usize,
    pub offset: usize,
}

impl ListFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Self::default()
        }
    }

    pub fn status(mut self, status: TicketStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn priority(mut self, priority: TicketPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn assigned_to(mut self, agent: impl Into<String>) -> Self {
        self.assigned_to = Some(agent.into());
        self
    }
}

/// Default field set for substring search.
pub const DEFAULT_SEARCH_FIELDS: &[&str] = &["title", "description", "notes", "resolution"];

// ---------------------------------------------------------------------------
// TicketStore trait
// ---------------------------------------------------------------------------

/// Contract satisfied by both ticket storage backends.
///
/// Not-found and not-eligible outcomes surface as `None`/`false`, never as
/// errors; errors are reserved for I/O and integrity failures.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Store a new ticket, assigning an id if absent and initializing
    /// timestamps. Returns the stored ticket.
    async fn create(&self, ticket: Ticket) -> Result<Ticket, TicketStoreError>;

    async fn get(&self, id: &str) -> Result<Option<Ticket>, TicketStoreError>;

    /// Update an existing ticket. Status changes must follow the state
    /// machine and assignment rules; violations are
    /// [`TicketStoreError::InvalidTransition`]. Unknown ids return `false`.
    async fn update(&self, ticket: Ticket) -> Result<bool, TicketStoreError>;

    async fn delete(&self, id: &str) -> Result<bool, TicketStoreError>;

    /// List tickets matching the filter, sorted by
    /// `(priority_sort_order, created_at)` ascending.
    async fn list(&self, filter: ListFilter) -> Result<Vec<Ticket>, TicketStoreError>;

    /// Substring search across `fields` (default
    /// [`DEFAULT_SEARCH_FIELDS`]).
    async fn search(
        &self,
        query: &str,
        fields: Option<&[&str]>,
    ) -> Result<Vec<Ticket>, TicketStoreError>;

    async fn count(
        &self,
        status: Option<TicketStatus>,
        priority: Option<TicketPriority>,
    ) -> Result<usize, TicketStoreError>;

    /// Next id in the strictly monotonic sequence. Ids are never reused.
    async fn get_next_id(&self) -> Result<String, TicketStoreError>;

    /// Atomically claim an open ticket for `agent`: transitions
    /// open → in_progress and sets the assignee. Returns `false` when the
    /// ticket is missing or not open. Exactly one of any set of racing
    /// claims succeeds.
    async fn claim(&self, id: &str, agent: &str) -> Result<bool, TicketStoreError>;

    // --- Agents ---

    async fn get_agent(&self, name: &str) -> Result<Option<AgentRecord>, TicketStoreError>;

    /// Save or update an agent, refreshing `last_seen`.
    async fn save_agent(&self, agent: AgentRecord) -> Result<AgentRecord, TicketStoreError>;

    async fn list_agents(&self, active_only: bool) -> Result<Vec<AgentRecord>, TicketStoreError>;

    // --- Backup ---

    /// Snapshot the full store to `backup_path`.
    async fn backup(&self, backup_path: &Path) -> Result<(), TicketStoreError>;

    /// Replace the full store from a snapshot.
    async fn restore(&self, backup_path: &Path) -> Result<(), TicketStoreError>;
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Storage backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Json,
    Sqlite,
}

impl StorageBackend {
    /// Parse a config string; unknown values fall back to JSON.
    pub fn from_config(value: &str) -> Self {
        match value {
            "sqlite" => StorageBackend::Sqlite,
            _ => StorageBackend::Json,
        }
    }
}

/// Open a ticket store of the requested backend at `path`.
pub async fn open_store(
    backend: StorageBackend,
    path: impl Into<PathBuf>,
) -> Result<Arc<dyn TicketStore>, TicketStoreError> {
    match backend {
        StorageBackend::Json => Ok(Arc::new(JsonTicketStore::open(path).await?)),
        StorageBackend::Sqlite => Ok(Arc::new(SqliteTicketStore::open(path).await?)),
    }
}

// ---------------------------------------------------------------------------
// Shared backend helpers
// ---------------------------------------------------------------------------

/// Validate an update against the stored ticket: status changes must follow
/// the state machine, and the resulting `(status, assigned_to)` pair must
/// be coherent.
pub(crate) fn validate_update(old: &Ticket, new: &Ticket) -> Result<(), TicketStoreError> {
    if old.status != new.status && !old.status.can_transition_to(&new.status) {
        return Err(TicketStoreError::InvalidTransition(format!(
            "{} -> {} is not a valid ticket transition",
            old.status.as_str(),
            new.status.as_str()
        )));
    }
    new.validate_assignment()
        .map_err(TicketStoreError::InvalidTransition)
}

/// Advance `updated_at` strictly past its previous value.
pub(crate) fn advance_updated_at(previous: chrono::DateTime<chrono::Utc>) -> chrono::DateTime<chrono::Utc> {
    let now = chrono::Utc::now();
    if now > previous {
        now
    } else {
        previous + chrono::Duration::microseconds(1)
    }
}

/// True when the ticket matches the substring `query` in any of `fields`.
pub(crate) fn matches_search(ticket: &Ticket, query_lower: &str, fields: &[&str]) -> bool {
    fields.iter().any(|field| {
        let value: Option<&str> = match *field {
            "title" => Some(&ticket.title),
            "description" => Some(&ticket.description),
            "notes" => Some(&ticket.notes),
            "resolution" => ticket.resolution.as_deref(),
            "problem_summary" => ticket.problem_summary.as_deref(),
            "solution_summary" => ticket.solution_summary.as_deref(),
            "testing_notes" => ticket.testing_notes.as_deref(),
            _ => None,
        };
        value.is_some_and(|v| v.to_lowercase().contains(query_lower))
    })
}
