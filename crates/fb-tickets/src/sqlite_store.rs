use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio_rusqlite::Connection;

use crate::models::{AgentRecord, Ticket, TicketPriority, TicketStatus};
use crate::storage::{
    advance_updated_at, validate_update, ListFilter, TicketStore, TicketStoreError,
    DEFAULT_SEARCH_FIELDS,
};

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn json_err(e: serde_json::Error) -> tokio_rusqlite::Error {
    tokio_rusqlite::Error::Other(Box::new(e))
}

fn ticket_from_row(data: &str) -> Result<Ticket, tokio_rusqlite::Error> {
    serde_json::from_str(data).map_err(json_err)
}

/// SQL expression mapping the priority column onto its total order.
const PRIORITY_ORDER_SQL: &str =
    "CASE priority WHEN 'critical' THEN 0 WHEN 'high' THEN 1 WHEN 'medium' THEN 2 ELSE 3 END";

/// Fields searchable directly via indexed-ish columns; everything else
/// falls back to a LIKE over the JSON blob.
const COLUMN_SEARCH_FIELDS: &[&str] = &["title", "description", "notes", "resolution"];

enum UpdateOutcome {
    NotFound,
    Invalid(String),
    Updated,
}

// ---------------------------------------------------------------------------
// SqliteTicketStore
// ---------------------------------------------------------------------------

/// Indexed ticket storage: row per ticket with secondary indexes on
/// `status`, `priority`, and `assigned_to`, plus a monotonically increasing
/// `next_id` in a metadata table.
///
/// All mutations run inside a transaction on the store's single background
/// connection thread, which is what makes `claim` linearizable.
pub struct SqliteTicketStore {
    conn: Connection,
}

impl SqliteTicketStore {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, TicketStoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = Connection::open(&path).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Purely in-memory database (useful for tests).
    pub async fn open_in_memory() -> Result<Self, TicketStoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), TicketStoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS tickets (
                        id          TEXT PRIMARY KEY,
                        title       TEXT NOT NULL,
                        description TEXT,
                        ticket_type TEXT NOT NULL DEFAULT 'task',
                        priority    TEXT NOT NULL DEFAULT 'medium',
                        status      TEXT NOT NULL DEFAULT 'open',
                        assigned_to TEXT,
                        created_at  TEXT NOT NULL,
                        updated_at  TEXT NOT NULL,
                        notes       TEXT,
                        resolution  TEXT,
                        data        TEXT NOT NULL  -- full JSON document
                    );

                    CREATE INDEX IF NOT EXISTS idx_tickets_status   ON tickets(status);
                    CREATE INDEX IF NOT EXISTS idx_tickets_priority ON tickets(priority);
                    CREATE INDEX IF NOT EXISTS idx_tickets_assigned ON tickets(assigned_to);

                    CREATE TABLE IF NOT EXISTS agents (
                        name       TEXT PRIMARY KEY,
                        agent_type TEXT NOT NULL DEFAULT 'ai',
                        active     INTEGER NOT NULL DEFAULT 1,
                        created_at TEXT NOT NULL,
                        last_seen  TEXT NOT NULL,
                        data       TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS metadata (
                        key   TEXT PRIMARY KEY,
                        value TEXT NOT NULL
                    );

                    INSERT OR IGNORE INTO metadata (key, value) VALUES ('next_id', '1');
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    fn next_id_in_tx(tx: &rusqlite::Transaction<'_>) -> Result<u64, rusqlite::Error> {
        let current: String =
            tx.query_row("SELECT value FROM metadata WHERE key = 'next_id'", [], |r| r.get(0))?;
        let next_id: u64 = current.parse().unwrap_or(1);
        tx.execute(
            "UPDATE metadata SET value = ?1 WHERE key = 'next_id'",
            rusqlite::params![(next_id + 1).to_string()],
        )?;
        Ok(next_id)
    }

    fn upsert_ticket_row(
        tx: &rusqlite::Transaction<'_>,
        ticket: &Ticket,
    ) -> Result<(), tokio_rusqlite::Error> {
        let data = serde_json::to_string(ticket).map_err(json_err)?;
        tx.execute(
            "INSERT INTO tickets (id, title, description, ticket_type, priority, status,
                assigned_to, created_at, updated_at, notes, resolution, data)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
             ON CONFLICT(id) DO UPDATE SET
                title=excluded.title, description=excluded.description,
                ticket_type=excluded.ticket_type, priority=excluded.priority,
                status=excluded.status, assigned_to=excluded.assigned_to,
                updated_at=excluded.updated_at, notes=excluded.notes,
                resolution=excluded.resolution, data=excluded.data",
            rusqlite::params![
                ticket.id,
                ticket.title,
                ticket.description,
                ticket.ticket_type.as_str(),
                ticket.priority.as_str(),
                ticket.status.as_str(),
                ticket.assigned_to,
                ticket.created_at.to_rfc3339(),
                ticket.updated_at.to_rfc3339(),
                ticket.notes,
                ticket.resolution,
                data,
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl TicketStore for SqliteTicketStore {
    async fn create(&self, mut ticket: Ticket) -> Result<Ticket, TicketStoreError> {
        let now = Utc::now();
        ticket.created_at = now;
        ticket.updated_at = now;
        let created = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                if ticket.id.is_empty() {
                    ticket.id = Self::next_id_in_tx(&tx)?.to_string();
                }
                Self::upsert_ticket_row(&tx, &ticket)?;
                tx.commit()?;
                Ok(ticket)
            })
            .await?;
        Ok(created)
    }

    async fn get(&self, id: &str) -> Result<Option<Ticket>, TicketStoreError> {
        let id = id.to_string();
        let ticket = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT data FROM tickets WHERE id = ?1")?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => {
                        let data: String = row.get(0)?;
                        Ok(Some(ticket_from_row(&data)?))
                    }
                    None => Ok(None),
                }
            })
            .await?;
        Ok(ticket)
    }

    async fn update(&self, ticket: Ticket) -> Result<bool, TicketStoreError> {
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let old: Option<String> = {
                    let mut stmt = tx.prepare("SELECT data FROM tickets WHERE id = ?1")?;
                    let mut rows = stmt.query(rusqlite::params![ticket.id])?;
                    match rows.next()? {
                        Some(row) => Some(row.get(0)?),
                        None => None,
                    }
                };
                let Some(old) = old else {
                    return Ok(UpdateOutcome::NotFound);
                };
                let old = ticket_from_row(&old)?;
                if let Err(e) = validate_update(&old, &ticket) {
                    return Ok(UpdateOutcome::Invalid(e.to_string()));
                }
                let mut ticket = ticket;
                ticket.updated_at = advance_updated_at(old.updated_at);
                Self::upsert_ticket_row(&tx, &ticket)?;
                tx.commit()?;
                Ok(UpdateOutcome::Updated)
            })
            .await?;
        match outcome {
            UpdateOutcome::NotFound => Ok(false),
            UpdateOutcome::Invalid(reason) => Err(TicketStoreError::InvalidTransition(reason)),
            UpdateOutcome::Updated => Ok(true),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, TicketStoreError> {
        let id = id.to_string();
        let deleted = self
            .conn
            .call(move |conn| {
                let count = conn.execute("DELETE FROM tickets WHERE id = ?1", rusqlite::params![id])?;
                Ok(count > 0)
            })
            .await?;
        Ok(deleted)
    }

    async fn list(&self, filter: ListFilter) -> Result<Vec<Ticket>, TicketStoreError> {
        let tickets = self
            .conn
            .call(move |conn| {
                let mut sql = "SELECT data FROM tickets WHERE 1=1".to_string();
                let mut params: Vec<Box<dyn rusqlite::types::ToSql + Send>> = Vec::new();

                if let Some(status) = filter.status {
                    sql.push_str(" AND status = ?");
                    params.push(Box::new(status.as_str().to_string()));
                }
                if let Some(priority) = filter.priority {
                    sql.push_str(" AND priority = ?");
                    params.push(Box::new(priority.as_str().to_string()));
                }
                if let Some(ticket_type) = filter.ticket_type {
                    sql.push_str(" AND ticket_type = ?");
                    params.push(Box::new(ticket_type.as_str().to_string()));
                }
                if let Some(agent) = &filter.assigned_to {
                    sql.push_str(" AND assigned_to = ?");
                    params.push(Box::new(agent.clone()));
                }
                for label in &filter.labels {
                    sql.push_str(" AND data LIKE ?");
                    params.push(Box::new(format!("%\"{label}\"%")));
                }
                sql.push_str(&format!(
                    " ORDER BY {PRIORITY_ORDER_SQL}, created_at LIMIT ? OFFSET ?"
                ));
                params.push(Box::new(filter.limit as i64));
                params.push(Box::new(filter.offset as i64));

                let mut stmt = conn.prepare(&sql)?;
                let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p.as_ref() as &dyn rusqlite::types::ToSql).collect();
                let mut rows = stmt.query(param_refs.as_slice())?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let data: String = row.get(0)?;
                    out.push(ticket_from_row(&data)?);
                }
                Ok(out)
            })
            .await?;
        Ok(tickets)
    }

    async fn search(
        &self,
        query: &str,
        fields: Option<&[&str]>,
    ) -> Result<Vec<Ticket>, TicketStoreError> {
        let fields: Vec<String> = fields
            .unwrap_or(DEFAULT_SEARCH_FIELDS)
            .iter()
            .map(|f| f.to_string())
            .collect();
        let query = query.to_string();
        let tickets = self
            .conn
            .call(move |conn| {
                let mut conditions = Vec::new();
                let mut params: Vec<String> = Vec::new();
                for field in &fields {
                    if COLUMN_SEARCH_FIELDS.contains(&field.as_str()) {
                        conditions.push(format!("{field} LIKE ?"));
                        params.push(format!("%{query}%"));
                    } else {
                        conditions.push("data LIKE ?".to_string());
                        params.push(format!("%{query}%"));
                    }
                }
                if conditions.is_empty() {
                    return Ok(Vec::new());
                }
                let sql = format!("SELECT data FROM tickets WHERE {}", conditions.join(" OR "));
                let mut stmt = conn.prepare(&sql)?;
                let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
                let mut rows = stmt.query(param_refs.as_slice())?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let data: String = row.get(0)?;
                    out.push(ticket_from_row(&data)?);
                }
                Ok(out)
            })
            .await?;
        Ok(tickets)
    }

    async fn count(
        &self,
        status: Option<TicketStatus>,
        priority: Option<TicketPriority>,
    ) -> Result<usize, TicketStoreError> {
        let count = self
            .conn
            .call(move |conn| {
                let mut sql = "SELECT COUNT(*) FROM tickets WHERE 1=1".to_string();
                let mut params: Vec<String> = Vec::new();
                if let Some(status) = status {
                    sql.push_str(" AND status = ?");
                    params.push(status.as_str().to_string());
                }
                if let Some(priority) = priority {
                    sql.push_str(" AND priority = ?");
                    params.push(priority.as_str().to_string());
                }
                let mut stmt = conn.prepare(&sql)?;
                let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
                let count: i64 = stmt.query_row(param_refs.as_slice(), |r| r.get(0))?;
                Ok(count as usize)
            })
            .await?;
        Ok(count)
    }

    async fn get_next_id(&self) -> Result<String, TicketStoreError> {
        let id = self
            .conn
            .call(|conn| {
                let tx = conn.transaction()?;
                let id = Self::next_id_in_tx(&tx)?;
                tx.commit()?;
                Ok(id.to_string())
            })
            .await?;
        Ok(id)
    }

    async fn claim(&self, id: &str, agent: &str) -> Result<bool, TicketStoreError> {
        let id = id.to_string();
        let agent = agent.to_string();
        let claimed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let open: Option<String> = {
                    let mut stmt =
                        tx.prepare("SELECT data FROM tickets WHERE id = ?1 AND status = 'open'")?;
                    let mut rows = stmt.query(rusqlite::params![id])?;
                    match rows.next()? {
                        Some(row) => Some(row.get(0)?),
                        None => None,
                    }
                };
                let Some(data) = open else {
                    return Ok(false);
                };

                let mut ticket = ticket_from_row(&data)?;
                ticket.status = TicketStatus::InProgress;
                ticket.assigned_to = Some(agent.clone());
                ticket.started_at = Some(Utc::now());
                ticket.updated_at = advance_updated_at(ticket.updated_at);
                Self::upsert_ticket_row(&tx, &ticket)?;
                tx.commit()?;
                Ok(true)
            })
            .await?;
        Ok(claimed)
    }

    async fn get_agent(&self, name: &str) -> Result<Option<AgentRecord>, TicketStoreError> {
        let name = name.to_string();
        let agent = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT data FROM agents WHERE name = ?1")?;
                let mut rows = stmt.query(rusqlite::params![name])?;
                match rows.next()? {
                    Some(row) => {
                        let data: String = row.get(0)?;
                        Ok(Some(serde_json::from_str(&data).map_err(json_err)?))
                    }
                    None => Ok(None),
                }
            })
            .await?;
        Ok(agent)
    }

    async fn save_agent(&self, mut agent: AgentRecord) -> Result<AgentRecord, TicketStoreError> {
        agent.last_seen = Utc::now();
        let saved = self
            .conn
            .call(move |conn| {
                let data = serde_json::to_string(&agent).map_err(json_err)?;
                conn.execute(
                    "INSERT OR REPLACE INTO agents (name, agent_type, active, created_at, last_seen, data)
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    rusqlite::params![
                        agent.name,
                        agent.agent_type,
                        agent.active as i64,
                        agent.created_at.to_rfc3339(),
                        agent.last_seen.to_rfc3339(),
                        data,
                    ],
                )?;
                Ok(agent)
            })
            .await?;
        Ok(saved)
    }

    async fn list_agents(&self, active_only: bool) -> Result<Vec<AgentRecord>, TicketStoreError> {
        let agents = self
            .conn
            .call(move |conn| {
                let sql = if active_only {
                    "SELECT data FROM agents WHERE active = 1"
                } else {
                    "SELECT data FROM agents"
                };
                let mut stmt = conn.prepare(sql)?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let data: String = row.get(0)?;
                    out.push(serde_json::from_str(&data).map_err(json_err)?);
                }
                Ok(out)
            })
            .await?;
        Ok(agents)
    }

    async fn backup(&self, backup_path: &Path) -> Result<(), TicketStoreError> {
        if let Some(parent) = backup_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // VACUUM INTO refuses to overwrite an existing file.
        if backup_path.exists() {
            tokio::fs::remove_file(backup_path).await?;
        }
        let target = backup_path.to_string_lossy().into_owned();
        self.conn
            .call(move |conn| {
                conn.execute("VACUUM INTO ?1", rusqlite::params![target])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn restore(&self, backup_path: &Path) -> Result<(), TicketStoreError> {
        if !backup_path.exists() {
            return Err(TicketStoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("backup not found: {}", backup_path.display()),
            )));
        }
        let source = backup_path.to_string_lossy().into_owned();
        self.conn
            .call(move |conn| {
                conn.execute("ATTACH DATABASE ?1 AS backup", rusqlite::params![source])?;
                let result = (|| -> Result<(), rusqlite::Error> {
                    let tx = conn.transaction()?;
                    tx.execute("DELETE FROM tickets", [])?;
                    tx.execute("INSERT INTO tickets SELECT * FROM backup.tickets", [])?;
                    tx.execute("DELETE FROM agents", [])?;
                    tx.execute("INSERT INTO agents SELECT * FROM backup.agents", [])?;
                    tx.execute("DELETE FROM metadata", [])?;
                    tx.execute("INSERT INTO metadata SELECT * FROM backup.metadata", [])?;
                    tx.commit()
                })();
                conn.execute("DETACH DATABASE backup", [])?;
                result?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
