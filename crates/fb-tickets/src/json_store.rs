use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

use crate::models::{AgentRecord, Ticket, TicketPriority, TicketStatus};
use crate::storage::{
    advance_updated_at, matches_search, validate_update, ListFilter, TicketStore,
    TicketStoreError, DEFAULT_SEARCH_FIELDS,
};

// ---------------------------------------------------------------------------
// On-disk shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreMetadata {
    version: String,
    created_at: DateTime<Utc>,
    last_modified: DateTime<Utc>,
    next_id: u64,
}

impl Default for StoreMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            version: "1.0".into(),
            created_at: now,
            last_modified: now,
            next_id: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    tickets: HashMap<String, Ticket>,
    #[serde(default)]
    agents: HashMap<String, AgentRecord>,
    #[serde(default)]
    metadata: StoreMetadata,
}

// ---------------------------------------------------------------------------
// JsonTicketStore
// ---------------------------------------------------------------------------

/// Document-oriented ticket storage: the whole dataset lives in memory and
/// is persisted to a single JSON file with copy-on-write atomic replace.
/// All mutations serialize under one store-level lock.
pub struct JsonTicketStore {
    path: PathBuf,
    state: Mutex<StoreData>,
}

impl JsonTicketStore {
    /// Open (or create) the store at `path`.
    ///
    /// A corrupt store file is preserved under a timestamped `.corrupt-*`
    /// backup and the in-memory view reverts to empty.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, TicketStoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let state = if path.exists() {
            let raw = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<StoreData>(&raw) {
                Ok(data) => data,
                Err(e) => {
                    let backup = path.with_extension(format!(
                        "json.corrupt-{}",
                        Utc::now().format("%Y%m%d%H%M%S")
                    ));
                    warn!(
                        path = %path.display(),
                        backup = %backup.display(),
                        error = %e,
                        "ticket store file is corrupt; preserving and starting empty"
                    );
                    let _ = tokio::fs::rename(&path, &backup).await;
                    StoreData::default()
                }
            }
        } else {
            StoreData::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Persist the dataset atomically. Caller holds the state lock.
    async fn save(&self, state: &mut StoreData) -> Result<(), TicketStoreError> {
        state.metadata.last_modified = Utc::now();
        let body = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    fn take_next_id(state: &mut StoreData) -> String {
        let id = state.metadata.next_id;
        state.metadata.next_id += 1;
        id.to_string()
    }
}

#[async_trait]
impl TicketStore for JsonTicketStore {
    async fn create(&self, mut ticket: Ticket) -> Result<Ticket, TicketStoreError> {
        let mut state = self.state.lock().await;
        if ticket.id.is_empty() || state.tickets.contains_key(&ticket.id) {
            ticket.id = Self::take_next_id(&mut state);
        }
        let now = Utc::now();
        ticket.created_at = now;
        ticket.updated_at = now;
        state.tickets.insert(ticket.id.clone(), ticket.clone());
        self.save(&mut state).await?;
        Ok(ticket)
    }

    async fn get(&self, id: &str) -> Result<Option<Ticket>, TicketStoreError> {
        let state = self.state.lock().await;
        Ok(state.tickets.get(id).cloned())
    }

    async fn update(&self, mut ticket: Ticket) -> Result<bool, TicketStoreError> {
        let mut state = self.state.lock().await;
        let Some(old) = state.tickets.get(&ticket.id) else {
            return Ok(false);
        };
        validate_update(old, &ticket)?;
        ticket.updated_at = advance_updated_at(old.updated_at);
        state.tickets.insert(ticket.id.clone(), ticket);
        self.save(&mut state).await?;
        Ok(true)
    }

    async fn delete(&self, id: &str) -> Result<bool, TicketStoreError> {
        let mut state = self.state.lock().await;
        if state.tickets.remove(id).is_none() {
            return Ok(false);
        }
        self.save(&mut state).await?;
        Ok(true)
    }

    async fn list(&self, filter: ListFilter) -> Result<Vec<Ticket>, TicketStoreError> {
        let state = self.state.lock().await;
        let mut tickets: Vec<Ticket> = state
            .tickets
            .values()
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .filter(|t| filter.priority.is_none_or(|p| t.priority == p))
            .filter(|t| filter.ticket_type.is_none_or(|ty| t.ticket_type == ty))
            .filter(|t| {
                filter
                    .assigned_to
                    .as_ref()
                    .is_none_or(|agent| t.assigned_to.as_deref() == Some(agent))
            })
            .filter(|t| {
                filter.labels.is_empty()
                    || filter.labels.iter().any(|label| t.labels.contains(label))
            })
            .cloned()
            .collect();

        tickets.sort_by(|a, b| {
            (a.priority.sort_order(), a.created_at).cmp(&(b.priority.sort_order(), b.created_at))
        });
        Ok(tickets
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    async fn search(
        &self,
        query: &str,
        fields: Option<&[&str]>,
    ) -> Result<Vec<Ticket>, TicketStoreError> {
        let fields = fields.unwrap_or(DEFAULT_SEARCH_FIELDS);
        let query_lower = query.to_lowercase();
        let state = self.state.lock().await;
        Ok(state
            .tickets
            .values()
            .filter(|t| matches_search(t, &query_lower, fields))
            .cloned()
            .collect())
    }

    async fn count(
        &self,
        status: Option<TicketStatus>,
        priority: Option<TicketPriority>,
    ) -> Result<usize, TicketStoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tickets
            .values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .filter(|t| priority.is_none_or(|p| t.priority == p))
            .count())
    }

    async fn get_next_id(&self) -> Result<String, TicketStoreError> {
        let mut state = self.state.lock().await;
        let id = Self::take_next_id(&mut state);
        self.save(&mut state).await?;
        Ok(id)
    }

    async fn claim(&self, id: &str, agent: &str) -> Result<bool, TicketStoreError> {
        let mut state = self.state.lock().await;
        let Some(ticket) = state.tickets.get_mut(id) else {
            return Ok(false);
        };
        if ticket.status != TicketStatus::Open {
            return Ok(false);
        }
        ticket.status = TicketStatus::InProgress;
        ticket.assigned_to = Some(agent.to_string());
        ticket.started_at = Some(Utc::now());
        ticket.updated_at = advance_updated_at(ticket.updated_at);
        self.save(&mut state).await?;
        Ok(true)
    }

    async fn get_agent(&self, name: &str) -> Result<Option<AgentRecord>, TicketStoreError> {
        let state = self.state.lock().await;
        Ok(state.agents.get(name).cloned())
    }

    async fn save_agent(&self, mut agent: AgentRecord) -> Result<AgentRecord, TicketStoreError> {
        let mut state = self.state.lock().await;
        agent.last_seen = Utc::now();
        state.agents.insert(agent.name.clone(), agent.clone());
        self.save(&mut state).await?;
        Ok(agent)
    }

    async fn list_agents(&self, active_only: bool) -> Result<Vec<AgentRecord>, TicketStoreError> {
        let state = self.state.lock().await;
        Ok(state
            .agents
            .values()
            .filter(|a| !active_only || a.active)
            .cloned()
            .collect())
    }

    async fn backup(&self, backup_path: &Path) -> Result<(), TicketStoreError> {
        let mut state = self.state.lock().await;
        if let Some(parent) = backup_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Flush current state first so the snapshot is complete.
        self.save(&mut state).await?;
        tokio::fs::copy(&self.path, backup_path).await?;
        Ok(())
    }

    async fn restore(&self, backup_path: &Path) -> Result<(), TicketStoreError> {
        let raw = tokio::fs::read(backup_path).await?;
        let data: StoreData = serde_json::from_slice(&raw)?;
        let mut state = self.state.lock().await;
        *state = data;
        self.save(&mut state).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TicketType;

    async fn temp_store() -> (JsonTicketStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = JsonTicketStore::open(dir.path().join("tickets.json"))
            .await
            .unwrap();
        (store, dir)
    }

    fn ticket(title: &str) -> Ticket {
        Ticket::new(title, TicketType::Bug, TicketPriority::Medium)
    }

    #[tokio::test]
    async fn create_assigns_monotonic_ids() {
        let (store, _dir) = temp_store().await;
        let a = store.create(ticket("a")).await.unwrap();
        let b = store.create(ticket("b")).await.unwrap();
        assert_eq!(a.id, "1");
        assert_eq!(b.id, "2");
    }

    #[tokio::test]
    async fn ids_are_never_reused_after_delete() {
        let (store, _dir) = temp_store().await;
        let a = store.create(ticket("a")).await.unwrap();
        assert!(store.delete(&a.id).await.unwrap());
        let b = store.create(ticket("b")).await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn corrupt_file_is_preserved_and_store_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tickets.json");
        std::fs::write(&path, b"{ not json at all").unwrap();

        let store = JsonTicketStore::open(&path).await.unwrap();
        assert_eq!(store.count(None, None).await.unwrap(), 0);

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("corrupt"))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[tokio::test]
    async fn update_rejects_invalid_transition() {
        let (store, _dir) = temp_store().await;
        let mut t = store.create(ticket("a")).await.unwrap();
        t.status = TicketStatus::Resolved;
        let err = store.update(t).await.unwrap_err();
        assert!(matches!(err, TicketStoreError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn update_advances_updated_at() {
        let (store, _dir) = temp_store().await;
        let created = store.create(ticket("a")).await.unwrap();
        let mut t = created.clone();
        t.notes = "first pass".into();
        assert!(store.update(t).await.unwrap());
        let after = store.get(&created.id).await.unwrap().unwrap();
        assert!(after.updated_at > created.updated_at);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tickets.json");
        {
            let store = JsonTicketStore::open(&path).await.unwrap();
            store.create(ticket("survivor")).await.unwrap();
        }
        let store = JsonTicketStore::open(&path).await.unwrap();
        let found = store.search("survivor", None).await.unwrap();
        assert_eq!(found.len(), 1);
        // The id counter survives too.
        let next = store.get_next_id().await.unwrap();
        assert_eq!(next, "2");
    }

    #[tokio::test]
    async fn list_sorts_by_priority_then_age() {
        let (store, _dir) = temp_store().await;
        store
            .create(Ticket::new("low", TicketType::Task, TicketPriority::Low))
            .await
            .unwrap();
        store
            .create(Ticket::new("crit", TicketType::Bug, TicketPriority::Critical))
            .await
            .unwrap();
        store
            .create(Ticket::new("med", TicketType::Task, TicketPriority::Medium))
            .await
            .unwrap();

        let all = store.list(ListFilter::new()).await.unwrap();
        let titles: Vec<&str> = all.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, ["crit", "med", "low"]);
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let (store, _dir) = temp_store().await;
        for i in 0..5 {
            store.create(ticket(&format!("t{i}"))).await.unwrap();
        }
        let claimed = store.create(ticket("claimed")).await.unwrap();
        store.claim(&claimed.id, "agent-a").await.unwrap();

        let open = store
            .list(ListFilter::new().status(TicketStatus::Open))
            .await
            .unwrap();
        assert_eq!(open.len(), 5);

        let mine = store
            .list(ListFilter::new().assigned_to("agent-a"))
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);

        let mut page = ListFilter::new();
        page.limit = 2;
        page.offset = 4;
        assert_eq!(store.list(page).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn claim_requires_open_status() {
        let (store, _dir) = temp_store().await;
        let t = store.create(ticket("a")).await.unwrap();
        assert!(store.claim(&t.id, "agent-a").await.unwrap());
        assert!(!store.claim(&t.id, "agent-b").await.unwrap());

        let claimed = store.get(&t.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, TicketStatus::InProgress);
        assert_eq!(claimed.assigned_to.as_deref(), Some("agent-a"));
        assert!(claimed.started_at.is_some());

        assert!(!store.claim("999", "agent-a").await.unwrap());
    }

    #[tokio::test]
    async fn search_covers_configured_fields() {
        let (store, _dir) = temp_store().await;
        let mut t = ticket("plain title");
        t.notes = "mentions replication lag".into();
        store.create(t).await.unwrap();

        assert_eq!(store.search("replication", None).await.unwrap().len(), 1);
        assert_eq!(
            store
                .search("replication", Some(&["title"]))
                .await
                .unwrap()
                .len(),
            0
        );
    }

    #[tokio::test]
    async fn agents_roundtrip() {
        let (store, _dir) = temp_store().await;
        let mut rec = AgentRecord::new("agent-a");
        rec.active = false;
        store.save_agent(rec).await.unwrap();
        store.save_agent(AgentRecord::new("agent-b")).await.unwrap();

        assert!(store.get_agent("agent-a").await.unwrap().is_some());
        assert_eq!(store.list_agents(true).await.unwrap().len(), 1);
        assert_eq!(store.list_agents(false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn backup_and_restore_roundtrip() {
        let (store, dir) = temp_store().await;
        store.create(ticket("keep me")).await.unwrap();
        let backup = dir.path().join("backup.json");
        store.backup(&backup).await.unwrap();

        let t2 = store.create(ticket("after backup")).await.unwrap();
        store.restore(&backup).await.unwrap();

        assert_eq!(store.count(None, None).await.unwrap(), 1);
        assert!(store.get(&t2.id).await.unwrap().is_none());
        assert_eq!(store.search("keep", None).await.unwrap().len(), 1);
    }
}
