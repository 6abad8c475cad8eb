use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use crate::budget::TokenBudget;
use crate::tiers::TieredMemoryStore;
use fb_core::{ids, signing};

// ---------------------------------------------------------------------------
// HandoffReason / HandoffPriority
// ---------------------------------------------------------------------------

/// Why a handoff was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffReason {
    /// 60% budget threshold crossed.
    BudgetWarning,
    /// 80% budget threshold crossed.
    BudgetCritical,
    TaskComplete,
    AgentRequest,
    ErrorRecovery,
    Scheduled,
}

/// How urgently the handoff must happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffPriority {
    /// Drop everything, hand off now.
    Immediate,
    /// Finish the current action, then hand off.
    High,
    /// Complete the current subtask, then hand off.
    Normal,
    /// Hand off when convenient.
    Low,
}

// ---------------------------------------------------------------------------
// Sanitization
// ---------------------------------------------------------------------------

/// Field caps applied to every deserialized packet. Sanitization is total:
/// no packet operation may observe unsanitized input.
pub mod sanitize {
    pub const MAX_ID_LEN: usize = 64;
    pub const MAX_NAME_LEN: usize = 128;
    pub const MAX_SUMMARY_LEN: usize = 2_000;
    pub const MAX_TASK_LEN: usize = 500;
    pub const MAX_PATH_LEN: usize = 512;
    pub const MAX_NOTES_LEN: usize = 5_000;
    pub const MAX_CONTEXT_LEN: usize = 50_000;
    pub const MAX_LIST_ITEMS: usize = 100;
    pub const MAX_SHORT_LIST_ITEMS: usize = 20;
    pub const MAX_HOT_TOKENS: u64 = 200_000;
    pub const MAX_BUDGET_TOKENS: u64 = 1_000_000;
    pub const MAX_EXPANSIONS: u32 = 100;

    /// Truncate to `max` characters and strip control characters other
    /// than newline, tab, and carriage return.
    pub fn string(value: &str, max: usize) -> String {
        value
            .chars()
            .take(max)
            .filter(|c| *c >= ' ' || matches!(c, '\n' | '\t' | '\r'))
            .collect()
    }

    /// Identifiers allow only `[A-Za-z0-9_-]`, capped at 64 characters.
    pub fn id(value: &str) -> String {
        value
            .chars()
            .take(MAX_ID_LEN)
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
            .collect()
    }

    pub fn list(items: &[String], max_items: usize, item_max: usize) -> Vec<String> {
        items
            .iter()
            .take(max_items)
            .map(|item| string(item, item_max))
            .collect()
    }

    pub fn id_list(items: &[String], max_items: usize) -> Vec<String> {
        items.iter().take(max_items).map(|item| id(item)).collect()
    }
}

// ---------------------------------------------------------------------------
// HandoffPacket
// ---------------------------------------------------------------------------

/// A decision made during the session, carried to the next agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDecision {
    pub decision: String,
    pub rationale: String,
}

/// Everything the next agent needs to continue the work.
///
/// Packets carry values, never references: the hot context is a snapshot,
/// warm references are ids to re-load on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffPacket {
    pub packet_id: String,
    pub created_at: DateTime<Utc>,
    pub source_agent: String,
    pub source_session: String,
    pub reason: HandoffReason,
    pub priority: HandoffPriority,

    /// Expected recipient; `None` means any agent may accept.
    #[serde(default)]
    pub target_agent: Option<String>,
    /// Unforgeable token; the packet is signed under it.
    pub access_token: String,

    #[serde(default)]
    pub ticket_id: String,
    #[serde(default)]
    pub ticket_status: String,
    #[serde(default)]
    pub ticket_summary: String,

    #[serde(default)]
    pub completed_tasks: Vec<String>,
    #[serde(default)]
    pub pending_tasks: Vec<String>,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub blockers: Vec<String>,

    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub files_reviewed: Vec<String>,
    #[serde(default)]
    pub key_decisions: Vec<KeyDecision>,

    /// Snapshot of the HOT tier, minimal but complete.
    #[serde(default)]
    pub hot_context: String,
    #[serde(default)]
    pub hot_tokens: u64,
    /// WARM item ids, loaded on demand by the next agent.
    #[serde(default)]
    pub warm_references: Vec<String>,

    #[serde(default)]
    pub budget_used: u64,
    #[serde(default)]
    pub budget_peak: u64,
    #[serde(default)]
    pub expansion_count: u32,

    #[serde(default)]
    pub handoff_notes: String,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl HandoffPacket {
    /// Apply every field cap. Idempotent: sanitizing a sanitized packet
    /// yields the same packet.
    pub fn sanitized(mut self) -> Self {
        use sanitize as s;

        self.packet_id = s::id(&self.packet_id);
        self.source_session = s::id(&self.source_session);
        self.ticket_id = s::id(&self.ticket_id);
        self.source_agent = s::string(&self.source_agent, s::MAX_NAME_LEN);
        self.target_agent = self
            .target_agent
            .map(|agent| s::string(&agent, s::MAX_NAME_LEN));

        self.ticket_status = s::string(&self.ticket_status, 64);
        self.ticket_summary = s::string(&self.ticket_summary, s::MAX_SUMMARY_LEN);

        self.completed_tasks = s::list(&self.completed_tasks, s::MAX_LIST_ITEMS, s::MAX_TASK_LEN);
        self.pending_tasks = s::list(&self.pending_tasks, s::MAX_LIST_ITEMS, s::MAX_TASK_LEN);
        self.blockers = s::list(&self.blockers, s::MAX_SHORT_LIST_ITEMS, s::MAX_TASK_LEN);
        self.warnings = s::list(&self.warnings, s::MAX_SHORT_LIST_ITEMS, s::MAX_TASK_LEN);
        self.current_task = self
            .current_task
            .map(|task| s::string(&task, s::MAX_TASK_LEN));

        self.files_modified = s::list(&self.files_modified, s::MAX_LIST_ITEMS, s::MAX_PATH_LEN);
        self.files_reviewed = s::list(&self.files_reviewed, s::MAX_LIST_ITEMS, s::MAX_PATH_LEN);
        self.key_decisions = self
            .key_decisions
            .into_iter()
            .take(s::MAX_SHORT_LIST_ITEMS)
            .map(|d| KeyDecision {
                decision: s::string(&d.decision, s::MAX_TASK_LEN),
                rationale: s::string(&d.rationale, s::MAX_TASK_LEN),
            })
            .collect();

        self.hot_context = s::string(&self.hot_context, s::MAX_CONTEXT_LEN);
        self.hot_tokens = self.hot_tokens.min(s::MAX_HOT_TOKENS);
        self.warm_references = s::id_list(&self.warm_references, s::MAX_LIST_ITEMS);

        self.budget_used = self.budget_used.min(s::MAX_BUDGET_TOKENS);
        self.budget_peak = self.budget_peak.min(s::MAX_BUDGET_TOKENS);
        self.expansion_count = self.expansion_count.min(s::MAX_EXPANSIONS);

        self.handoff_notes = s::string(&self.handoff_notes, s::MAX_NOTES_LEN);
        self
    }

    /// Authorization check for acceptance: the target agent must match (or
    /// be unset), and a provided token must equal the access token under
    /// constant-time comparison.
    pub fn can_accept(&self, agent_name: &str, token: Option<&str>) -> Result<(), String> {
        if let Some(target) = &self.target_agent {
            if target != agent_name {
                return Err(format!("handoff intended for {target}, not {agent_name}"));
            }
        }
        if let Some(token) = token {
            if !signing::constant_time_eq(token, &self.access_token) {
                return Err("invalid access token".to_string());
            }
        }
        Ok(())
    }

    /// Render the onboarding briefing the receiving agent sees first.
    pub fn onboarding_context(&self) -> String {
        let mut lines = vec![
            "# HANDOFF RECEIVED".to_string(),
            String::new(),
            format!("**From:** {}", self.source_agent),
            format!("**Reason:** {:?}", self.reason),
            format!("**Ticket:** {} ({})", self.ticket_id, self.ticket_status),
            String::new(),
            "## Summary".to_string(),
            self.ticket_summary.clone(),
            String::new(),
            "## Completed".to_string(),
        ];
        for task in &self.completed_tasks {
            lines.push(format!("- [x] {task}"));
        }
        lines.push(String::new());
        lines.push("## Pending".to_string());
        for task in &self.pending_tasks {
            lines.push(format!("- [ ] {task}"));
        }
        if let Some(current) = &self.current_task {
            lines.push(String::new());
            lines.push("## Current Task".to_string());
            lines.push(format!("**In Progress:** {current}"));
        }
        if !self.blockers.is_empty() {
            lines.push(String::new());
            lines.push("## Blockers".to_string());
            for blocker in &self.blockers {
                lines.push(format!("- {blocker}"));
            }
        }
        if !self.key_decisions.is_empty() {
            lines.push(String::new());
            lines.push("## Key Decisions Made".to_string());
            for d in &self.key_decisions {
                lines.push(format!("- **{}**: {}", d.decision, d.rationale));
            }
        }
        if !self.files_modified.is_empty() {
            lines.push(String::new());
            lines.push("## Files Modified".to_string());
            for file in self.files_modified.iter().take(10) {
                lines.push(format!("- {file}"));
            }
            if self.files_modified.len() > 10 {
                lines.push(format!("- ... and {} more", self.files_modified.len() - 10));
            }
        }
        if !self.warnings.is_empty() {
            lines.push(String::new());
            lines.push("## Warnings".to_string());
            for warning in &self.warnings {
                lines.push(format!("- {warning}"));
            }
        }
        if !self.handoff_notes.is_empty() {
            lines.push(String::new());
            lines.push("## Notes from Previous Agent".to_string());
            lines.push(self.handoff_notes.clone());
        }
        lines.join("\n")
    }
}

// ---------------------------------------------------------------------------
// Ticket context input
// ---------------------------------------------------------------------------

/// Ticket-side context handed to `create_handoff_packet`; everything is a
/// value copied into the packet.
#[derive(Debug, Clone, Default)]
pub struct TicketHandoffContext {
    pub ticket_id: String,
    pub status: String,
    pub summary: String,
    pub completed_tasks: Vec<String>,
    pub pending_tasks: Vec<String>,
    pub current_task: Option<String>,
    pub blockers: Vec<String>,
    pub files_modified: Vec<String>,
    pub files_reviewed: Vec<String>,
    pub key_decisions: Vec<KeyDecision>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("id generation: {0}")]
    Id(#[from] ids::IdError),
    #[error("packet encryption is not supported")]
    EncryptionUnsupported,
}

// ---------------------------------------------------------------------------
// HandoffManager
// ---------------------------------------------------------------------------

/// Pending/archived packet counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffStats {
    pub pending_handoffs: usize,
    pub completed_handoffs: usize,
    pub storage_path: String,
}

/// Manages packet creation, signed persistence, and authorized acceptance.
///
/// Packets live under `<root>/pending/<packet_id>.json` until accepted,
/// then move to `<root>/archive/` with acceptance metadata. Archives older
/// than 48 hours are swept on each accept.
pub struct HandoffManager {
    storage_path: PathBuf,
}

/// Archive retention window.
const ARCHIVE_RETENTION: Duration = Duration::from_secs(48 * 60 * 60);

impl HandoffManager {
    /// Create the manager, ensuring `pending/` and `archive/` exist with
    /// 0700 permissions.
    pub async fn new(storage_path: impl Into<PathBuf>) -> Result<Self, HandoffError> {
        let storage_path = storage_path.into();
        let manager = Self { storage_path };
        for dir in [
            manager.storage_path.clone(),
            manager.pending_dir(),
            manager.archive_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
            restrict_dir_permissions(&dir).await?;
        }
        Ok(manager)
    }

    fn pending_dir(&self) -> PathBuf {
        self.storage_path.join("pending")
    }

    fn archive_dir(&self) -> PathBuf {
        self.storage_path.join("archive")
    }

    fn pending_file(&self, packet_id: &str) -> PathBuf {
        self.pending_dir().join(format!("{packet_id}.json"))
    }

    /// Consult the budget for a handoff trigger.
    ///
    /// 80% usage demands an immediate critical handoff; 60% asks for a
    /// normal-priority warning handoff.
    pub fn check_handoff_needed(
        &self,
        budget: &TokenBudget,
    ) -> Option<(HandoffReason, HandoffPriority)> {
        if budget.must_handoff() {
            Some((HandoffReason::BudgetCritical, HandoffPriority::Immediate))
        } else if budget.should_handoff() {
            Some((HandoffReason::BudgetWarning, HandoffPriority::Normal))
        } else {
            None
        }
    }

    /// Build a packet snapshotting the ticket context and, when given, the
    /// memory store's HOT tier, WARM references, and budget state. A fresh
    /// cryptographically random packet id and access token are generated
    /// here.
    #[allow(clippy::too_many_arguments)]
    pub fn create_handoff_packet(
        &self,
        agent_name: &str,
        session_id: &str,
        reason: HandoffReason,
        priority: HandoffPriority,
        ticket: TicketHandoffContext,
        memory_store: Option<&TieredMemoryStore>,
        notes: &str,
        target_agent: Option<&str>,
    ) -> Result<HandoffPacket, HandoffError> {
        let mut packet = HandoffPacket {
            packet_id: ids::packet_id()?,
            created_at: Utc::now(),
            source_agent: agent_name.to_string(),
            source_session: session_id.to_string(),
            reason,
            priority,
            target_agent: target_agent.map(str::to_string),
            access_token: ids::access_token()?,
            ticket_id: ticket.ticket_id,
            ticket_status: ticket.status,
            ticket_summary: ticket.summary,
            completed_tasks: ticket.completed_tasks,
            pending_tasks: ticket.pending_tasks,
            current_task: ticket.current_task,
            blockers: ticket.blockers,
            files_modified: ticket.files_modified,
            files_reviewed: ticket.files_reviewed,
            key_decisions: ticket.key_decisions,
            hot_context: String::new(),
            hot_tokens: 0,
            warm_references: Vec::new(),
            budget_used: 0,
            budget_peak: 0,
            expansion_count: 0,
            handoff_notes: notes.to_string(),
            warnings: Vec::new(),
        };

        if let Some(store) = memory_store {
            packet.hot_context = store.get_hot_context();
            packet.hot_tokens = store.hot_tokens();
            packet.warm_references = store.warm_keys();
            let budget = store.budget().lock().expect("budget lock poisoned");
            packet.budget_used = budget.used;
            packet.budget_peak = budget.peak;
            packet.expansion_count = budget.expansion_count;
        }

        if reason == HandoffReason::BudgetCritical {
            packet
                .warnings
                .push("URGENT: previous agent hit 80% budget limit".to_string());
        }
        if !packet.blockers.is_empty() {
            packet
                .warnings
                .push(format!("BLOCKED: {} blocker(s) identified", packet.blockers.len()));
        }

        Ok(packet.sanitized())
    }

    /// Persist a packet to `pending/` with a 0600 file mode.
    ///
    /// The on-disk wrapper is `{packet, signature, encrypted: false}` where
    /// the signature is HMAC-SHA256 keyed by the packet's own access token
    /// over the canonical key-sorted serialization. Encryption is not
    /// supported in this port.
    pub async fn store_packet(
        &self,
        packet: &HandoffPacket,
        encrypt: bool,
    ) -> Result<PathBuf, HandoffError> {
        if encrypt {
            return Err(HandoffError::EncryptionUnsupported);
        }

        let packet_value = serde_json::to_value(packet)?;
        let signature = signing::sign_value(&packet_value, &packet.access_token);
        let wrapper = serde_json::json!({
            "packet": packet_value,
            "signature": signature,
            "encrypted": false,
        });

        let path = self.pending_file(&packet.packet_id);
        tokio::fs::write(&path, serde_json::to_vec_pretty(&wrapper)?).await?;
        restrict_file_permissions(&path).await?;
        debug!(packet_id = %packet.packet_id, "stored handoff packet");
        Ok(path)
    }

    /// Read a packet back from `pending/`.
    ///
    /// Signature mismatch, missing file, parse failure, and encrypted
    /// payloads all return `None`; integrity failures are never degraded
    /// into success. Legacy packets without the signed wrapper are accepted
    /// without verification for backward compatibility only.
    pub async fn retrieve_packet(
        &self,
        packet_id: &str,
        verify_signature: bool,
    ) -> Option<HandoffPacket> {
        let path = self.pending_file(&sanitize::id(packet_id));
        let raw = tokio::fs::read(&path).await.ok()?;
        let stored: serde_json::Value = match serde_json::from_slice(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(packet_id, error = %e, "failed to parse handoff packet");
                return None;
            }
        };

        // Legacy format: the file is the bare packet itself.
        if stored.get("packet").is_none() && stored.get("encrypted").is_none() {
            return Self::packet_from_value(stored);
        }

        if stored.get("encrypted").and_then(|v| v.as_bool()) == Some(true) {
            warn!(
                packet_id,
                "packet is encrypted but decryption is not supported; rejecting"
            );
            return None;
        }

        let packet_value = stored.get("packet")?.clone();
        if verify_signature {
            let signature = stored.get("signature").and_then(|v| v.as_str()).unwrap_or("");
            let token = packet_value
                .get("access_token")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if !signature.is_empty()
                && !token.is_empty()
                && !signing::verify_value(&packet_value, signature, token)
            {
                warn!(packet_id, "signature verification failed; packet may be tampered");
                return None;
            }
        }

        Self::packet_from_value(packet_value)
    }

    fn packet_from_value(value: serde_json::Value) -> Option<HandoffPacket> {
        match serde_json::from_value::<HandoffPacket>(value) {
            Ok(packet) => Some(packet.sanitized()),
            Err(e) => {
                warn!(error = %e, "handoff packet failed validation");
                None
            }
        }
    }

    /// List pending packets, newest first, optionally filtered by ticket.
    /// Unreadable files are skipped.
    pub async fn pending_handoffs(&self, ticket_id: Option<&str>) -> Vec<HandoffPacket> {
        let mut packets = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(self.pending_dir()).await else {
            return packets;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(packet) = self.retrieve_packet(stem, false).await {
                if ticket_id.is_none() || ticket_id == Some(packet.ticket_id.as_str()) {
                    packets.push(packet);
                }
            }
        }
        packets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        packets
    }

    /// Accept a handoff with authorization checks.
    ///
    /// On success the packet file moves from `pending/` to `archive/` with
    /// acceptance metadata appended, and stale archives are swept. Failed
    /// authorization logs a warning and returns `None` with the pending
    /// file untouched.
    pub async fn accept_handoff(
        &self,
        packet_id: &str,
        accepting_agent: &str,
        access_token: Option<&str>,
    ) -> Option<HandoffPacket> {
        let packet = self.retrieve_packet(packet_id, true).await?;

        if let Err(reason) = packet.can_accept(accepting_agent, access_token) {
            warn!(
                packet_id,
                agent = accepting_agent,
                reason,
                "unauthorized handoff acceptance attempt"
            );
            return None;
        }

        let mut archived = match serde_json::to_value(&packet) {
            Ok(value) => value,
            Err(e) => {
                warn!(packet_id, error = %e, "failed to serialize packet for archive");
                return None;
            }
        };
        if let Some(map) = archived.as_object_mut() {
            map.insert("accepted_by".into(), accepting_agent.into());
            map.insert("accepted_at".into(), Utc::now().to_rfc3339().into());
        }

        let archive_file = self.archive_dir().join(format!("{}.json", packet.packet_id));
        let body = match serde_json::to_vec_pretty(&archived) {
            Ok(body) => body,
            Err(e) => {
                warn!(packet_id, error = %e, "failed to serialize archive body");
                return None;
            }
        };
        if let Err(e) = tokio::fs::write(&archive_file, body).await {
            warn!(packet_id, error = %e, "failed to archive handoff packet");
            return None;
        }
        let _ = restrict_file_permissions(&archive_file).await;
        let _ = tokio::fs::remove_file(self.pending_file(&packet.packet_id)).await;

        let deleted = self
            .cleanup_archives_before(SystemTime::now() - ARCHIVE_RETENTION)
            .await;
        if deleted > 0 {
            debug!(deleted, "swept expired handoff archives");
        }

        Some(packet)
    }

    /// Delete archived packets whose modification time is at or before
    /// `cutoff`. Returns the number deleted.
    async fn cleanup_archives_before(&self, cutoff: SystemTime) -> usize {
        let mut deleted = 0;
        let Ok(mut entries) = tokio::fs::read_dir(self.archive_dir()).await else {
            return 0;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            if modified <= cutoff && tokio::fs::remove_file(entry.path()).await.is_ok() {
                deleted += 1;
            }
        }
        deleted
    }

    /// Pending/archived counts for monitoring.
    pub async fn stats(&self) -> HandoffStats {
        HandoffStats {
            pending_handoffs: count_json_files(&self.pending_dir()).await,
            completed_handoffs: count_json_files(&self.archive_dir()).await,
            storage_path: self.storage_path.display().to_string(),
        }
    }
}

async fn count_json_files(dir: &Path) -> usize {
    let mut count = 0;
    if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                count += 1;
            }
        }
    }
    count
}

#[cfg(unix)]
async fn restrict_dir_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await
}

#[cfg(not(unix))]
async fn restrict_dir_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
async fn restrict_file_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict_file_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
