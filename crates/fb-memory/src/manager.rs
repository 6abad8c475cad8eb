use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::models::{FixPattern, SessionContext, SessionDiscovery, TicketMemory, TicketSnapshot};
use fb_core::ids;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const SCHEMA_VERSION: &str = "1.0.0";
/// Memories decay to zero relevance over this many days.
const MEMORY_DECAY_DAYS: i64 = 180;
/// Memories whose decayed relevance falls below this are pruned.
const PRUNE_THRESHOLD: f64 = 0.1;
const MAX_MEMORIES_PER_QUERY: usize = 50;
/// A file needs at least this many resolved tickets to form a pattern.
const PATTERN_MIN_OCCURRENCES: usize = 3;

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "were", "been", "be", "have", "has", "had", "do", "does",
    "did", "will", "would", "could", "should", "may", "might", "must", "shall", "can", "need",
    "this", "that", "these", "those", "it", "its", "not", "no", "yes", "when", "where", "which",
    "who", "whom", "whose", "why", "how", "all", "each", "every", "both", "few", "more", "most",
    "other", "some", "such", "only", "own", "same", "so", "than", "too", "very", "just", "also",
    "now", "here", "there", "then", "once", "always",
];

// ---------------------------------------------------------------------------
// Persisted index structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SemanticIndex {
    keyword_to_tickets: BTreeMap<String, Vec<String>>,
    file_to_tickets: BTreeMap<String, Vec<String>>,
    type_to_tickets: BTreeMap<String, Vec<String>>,
    app_to_tickets: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemoryMetadata {
    schema_version: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    total_memories: i64,
    #[serde(default)]
    total_patterns: i64,
    #[serde(default)]
    last_pruned: Option<DateTime<Utc>>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}

impl Default for MemoryMetadata {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.into(),
            created_at: Utc::now(),
            total_memories: 0,
            total_patterns: 0,
            last_pruned: None,
            last_updated: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PatternsFile {
    patterns: Vec<FixPattern>,
    #[serde(default)]
    last_extracted: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrunedMemory {
    pub ticket_id: String,
    pub app: String,
    pub adjusted_relevance: f64,
    pub days_old: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneReport {
    pub dry_run: bool,
    pub pruned_count: usize,
    pub kept_count: usize,
    pub pruned_memories: Vec<PrunedMemory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternExtractionReport {
    pub patterns_found: usize,
    pub total_patterns: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    pub schema_version: String,
    pub total_memories: usize,
    pub total_patterns: usize,
    pub total_sessions: usize,
    pub index_keywords: usize,
    pub index_files: usize,
    pub last_pruned: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("id generation: {0}")]
    Id(#[from] ids::IdError),
}

// ---------------------------------------------------------------------------
// MemoryManager
// ---------------------------------------------------------------------------

/// File-backed memory of resolved tickets with a keyword/file/type/app
/// index and relevance-scored retrieval.
///
/// Layout under the base path:
/// `tickets/<app>_<id>.json`, `patterns/fix_patterns.json`,
/// `sessions/<session_id>.json`, `index/{metadata,semantic_index}.json`.
pub struct MemoryManager {
    base_path: PathBuf,
    index: SemanticIndex,
}

impl MemoryManager {
    /// Open (or initialize) the memory store rooted at `base_path`.
    pub async fn new(base_path: impl Into<PathBuf>) -> Result<Self, MemoryError> {
        let base_path = base_path.into();
        for sub in ["tickets", "patterns", "sessions", "index"] {
            tokio::fs::create_dir_all(base_path.join(sub)).await?;
        }

        let metadata_path = base_path.join("index").join("metadata.json");
        if !metadata_path.exists() {
            save_json(&metadata_path, &MemoryMetadata::default()).await?;
        }

        let index_path = base_path.join("index").join("semantic_index.json");
        let index = if index_path.exists() {
            load_json(&index_path).await.unwrap_or_default()
        } else {
            SemanticIndex::default()
        };

        Ok(Self { base_path, index })
    }

    fn ticket_path(&self, app: &str, ticket_id: &str) -> PathBuf {
        let safe_app: String = app
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.base_path
            .join("tickets")
            .join(format!("{safe_app}_{ticket_id}.json"))
    }

    fn index_path(&self) -> PathBuf {
        self.base_path.join("index").join("semantic_index.json")
    }

    fn metadata_path(&self) -> PathBuf {
        self.base_path.join("index").join("metadata.json")
    }

    fn patterns_path(&self) -> PathBuf {
        self.base_path.join("patterns").join("fix_patterns.json")
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.base_path.join("sessions").join(format!("{session_id}.json"))
    }

    // -----------------------------------------------------------------------
    // Ticket memories
    // -----------------------------------------------------------------------

    /// Persist a ticket memory and update the semantic index.
    pub async fn save_ticket_memory(&mut self, memory: &TicketMemory) -> Result<(), MemoryError> {
        let path = self.ticket_path(&memory.app, &memory.ticket_id);
        save_json(&path, memory).await?;

        self.index_memory(memory);
        save_json(&self.index_path(), &self.index).await?;
        self.update_metadata(1, 0, None).await?;
        Ok(())
    }

    /// Retrieve a memory by ticket id (optionally scoped to an app),
    /// bumping its access bookkeeping.
    pub async fn get_ticket_memory(
        &self,
        ticket_id: &str,
        app: Option<&str>,
    ) -> Option<TicketMemory> {
        let path = match app {
            Some(app) => {
                let path = self.ticket_path(app, ticket_id);
                path.exists().then_some(path)?
            }
            None => self.find_ticket_file(ticket_id).await?,
        };

        let mut memory: TicketMemory = load_json(&path).await?;
        memory.touch();
        if let Err(e) = save_json(&path, &memory).await {
            warn!(ticket_id, error = %e, "failed to persist memory access bump");
        }
        Some(memory)
    }

    async fn find_ticket_file(&self, ticket_id: &str) -> Option<PathBuf> {
        let suffix = format!("_{ticket_id}");
        let mut entries = tokio::fs::read_dir(self.base_path.join("tickets")).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if stem.ends_with(&suffix) {
                    return Some(path);
                }
            }
        }
        None
    }

    async fn all_ticket_ids(&self) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        let Ok(mut entries) = tokio::fs::read_dir(self.base_path.join("tickets")).await else {
            return ids;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Some((_, id)) = stem.rsplit_once('_') {
                    ids.insert(id.to_string());
                }
            }
        }
        ids
    }

    fn index_memory(&mut self, memory: &TicketMemory) {
        fn add(map: &mut BTreeMap<String, Vec<String>>, key: String, ticket_id: &str) {
            let ids = map.entry(key).or_default();
            if !ids.iter().any(|id| id == ticket_id) {
                ids.push(ticket_id.to_string());
            }
        }

        for kw in &memory.keywords {
            add(&mut self.index.keyword_to_tickets, kw.to_lowercase(), &memory.ticket_id);
        }
        for file in &memory.files_modified {
            add(&mut self.index.file_to_tickets, file.to_lowercase(), &memory.ticket_id);
        }
        add(
            &mut self.index.type_to_tickets,
            memory.ticket_type.to_lowercase(),
            &memory.ticket_id,
        );
        add(&mut self.index.app_to_tickets, memory.app.to_lowercase(), &memory.ticket_id);
    }

    // -----------------------------------------------------------------------
    // Relevance-scored retrieval
    // -----------------------------------------------------------------------

    /// Query memories with relevance scoring, highest first.
    ///
    /// Candidates come from the semantic index (keywords, files, type,
    /// app); an empty candidate set falls back to a full scan. Memories
    /// already loaded in `session` are skipped, and returned ids are marked
    /// loaded.
    pub async fn query_memories(
        &self,
        query: &str,
        app: Option<&str>,
        ticket_type: Option<&str>,
        files: &[String],
        mut session: Option<&mut SessionContext>,
        max_results: Option<usize>,
    ) -> Vec<(TicketMemory, f64)> {
        let max_results = max_results.unwrap_or(MAX_MEMORIES_PER_QUERY);
        let query_words = words_of(query);

        let mut candidate_ids: BTreeSet<String> = BTreeSet::new();
        for word in &query_words {
            if let Some(ids) = self.index.keyword_to_tickets.get(word) {
                candidate_ids.extend(ids.iter().cloned());
            }
        }
        for file in files {
            if let Some(ids) = self.index.file_to_tickets.get(&file.to_lowercase()) {
                candidate_ids.extend(ids.iter().cloned());
            }
        }
        if let Some(ticket_type) = ticket_type {
            if let Some(ids) = self.index.type_to_tickets.get(&ticket_type.to_lowercase()) {
                candidate_ids.extend(ids.iter().cloned());
            }
        }
        if let Some(app) = app {
            if let Some(ids) = self.index.app_to_tickets.get(&app.to_lowercase()) {
                candidate_ids.extend(ids.iter().cloned());
            }
        }
        if candidate_ids.is_empty() {
            candidate_ids = self.all_ticket_ids().await;
        }

        let mut scored = Vec::new();
        for ticket_id in candidate_ids {
            if let Some(session) = session.as_deref() {
                if session.loaded_memories.contains(&ticket_id) {
                    continue;
                }
            }
            let Some(memory) = self.get_ticket_memory(&ticket_id, None).await else {
                continue;
            };
            if let Some(app) = app {
                if !memory.app.eq_ignore_ascii_case(app) {
                    continue;
                }
            }
            let score = relevance_score(&memory, &query_words, files, ticket_type);
            if score > PRUNE_THRESHOLD {
                scored.push((memory, score));
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);

        if let Some(session) = session.as_deref_mut() {
            for (memory, _) in &scored {
                session.loaded_memories.insert(memory.ticket_id.clone());
            }
        }
        scored
    }

    // -----------------------------------------------------------------------
    // Pattern extraction
    // -----------------------------------------------------------------------

    /// Analyze resolved-ticket memories and extract recurring fix patterns
    /// from files touched by at least three tickets.
    pub async fn extract_fix_patterns(&mut self) -> Result<PatternExtractionReport, MemoryError> {
        let mut file_groups: BTreeMap<String, Vec<TicketMemory>> = BTreeMap::new();
        for ticket_id in self.all_ticket_ids().await {
            let Some(memory) = self.get_ticket_memory(&ticket_id, None).await else {
                continue;
            };
            for file in &memory.files_modified {
                file_groups.entry(file.clone()).or_default().push(memory.clone());
            }
        }

        let mut found = Vec::new();
        for (file_path, memories) in &file_groups {
            if memories.len() < PATTERN_MIN_OCCURRENCES {
                continue;
            }

            let mut solution_words: HashMap<String, usize> = HashMap::new();
            for memory in memories {
                for word in words_of(&memory.solution_summary) {
                    *solution_words.entry(word).or_default() += 1;
                }
            }
            let threshold = (memories.len() as f64 * 0.5).ceil() as usize;
            let mut common: Vec<String> = solution_words
                .into_iter()
                .filter(|(_, count)| *count >= threshold)
                .map(|(word, _)| word)
                .collect();
            common.sort();
            if common.is_empty() {
                continue;
            }

            let file_name = Path::new(file_path)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(file_path);
            found.push(FixPattern {
                pattern_id: pattern_id_for(file_path),
                name: format!("Common fixes for {file_name}"),
                description: format!("Pattern from {} tickets", memories.len()),
                file_patterns: vec![file_path.clone()],
                keyword_triggers: common.into_iter().take(5).collect(),
                solution_template: memories
                    .iter()
                    .take(5)
                    .map(|m| m.solution_summary.as_str())
                    .max_by_key(|s| s.len())
                    .unwrap_or("Check similar resolved tickets for solution approach.")
                    .to_string(),
                occurrence_count: memories.len(),
                example_ticket_ids: memories.iter().take(3).map(|m| m.ticket_id.clone()).collect(),
            });
        }

        let mut existing: PatternsFile = if self.patterns_path().exists() {
            load_json(&self.patterns_path()).await.unwrap_or_default()
        } else {
            PatternsFile::default()
        };

        let mut by_id: BTreeMap<String, FixPattern> = existing
            .patterns
            .drain(..)
            .map(|p| (p.pattern_id.clone(), p))
            .collect();
        for pattern in &found {
            match by_id.get_mut(&pattern.pattern_id) {
                Some(known) => known.occurrence_count = pattern.occurrence_count,
                None => {
                    by_id.insert(pattern.pattern_id.clone(), pattern.clone());
                }
            }
        }

        let total = by_id.len();
        let merged = PatternsFile {
            patterns: by_id.into_values().collect(),
            last_extracted: Some(Utc::now()),
        };
        save_json(&self.patterns_path(), &merged).await?;

        Ok(PatternExtractionReport {
            patterns_found: found.len(),
            total_patterns: total,
        })
    }

    /// Patterns relevant to the current problem, by keyword triggers or
    /// file overlap. Patterns already loaded in `session` are skipped.
    pub async fn get_relevant_patterns(
        &self,
        query: &str,
        files: &[String],
        mut session: Option<&mut SessionContext>,
    ) -> Vec<FixPattern> {
        let Some(data) = load_json::<PatternsFile>(&self.patterns_path()).await else {
            return Vec::new();
        };

        let query_words = words_of(query);
        let query_files: BTreeSet<String> = files.iter().map(|f| f.to_lowercase()).collect();

        let mut relevant = Vec::new();
        for pattern in data.patterns {
            if let Some(session) = session.as_deref() {
                if session.loaded_patterns.contains(&pattern.pattern_id) {
                    continue;
                }
            }
            let keyword_hit = pattern
                .keyword_triggers
                .iter()
                .any(|kw| query_words.contains(&kw.to_lowercase()));
            let file_hit = pattern
                .file_patterns
                .iter()
                .any(|f| query_files.contains(&f.to_lowercase()));
            if keyword_hit || file_hit {
                relevant.push(pattern);
            }
        }

        if let Some(session) = session.as_deref_mut() {
            for pattern in &relevant {
                session.loaded_patterns.insert(pattern.pattern_id.clone());
            }
        }
        relevant
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Create and persist a new session context.
    pub async fn create_session(
        &self,
        agent_name: &str,
        session_id: Option<&str>,
    ) -> Result<SessionContext, MemoryError> {
        let session_id = match session_id {
            Some(id) => id.to_string(),
            None => ids::session_id()?,
        };
        let session = SessionContext::new(session_id, agent_name);
        self.save_session(&session).await?;
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SessionContext> {
        load_json(&self.session_path(session_id)).await
    }

    pub async fn save_session(&self, session: &SessionContext) -> Result<(), MemoryError> {
        save_json(&self.session_path(&session.session_id), session).await
    }

    /// Append a discovery to the session's log and persist it.
    pub async fn add_session_discovery(
        &self,
        session: &mut SessionContext,
        discovery: &str,
        category: &str,
    ) -> Result<(), MemoryError> {
        session.session_discoveries.push(SessionDiscovery {
            discovery: discovery.to_string(),
            category: category.to_string(),
            timestamp: Utc::now(),
        });
        self.save_session(session).await
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Remove memories whose age-decayed relevance falls below threshold.
    pub async fn prune_stale_memories(&mut self, dry_run: bool) -> Result<PruneReport, MemoryError> {
        let mut pruned = Vec::new();
        let mut kept = 0;

        for ticket_id in self.all_ticket_ids().await {
            let Some(memory) = self.get_ticket_memory(&ticket_id, None).await else {
                continue;
            };

            let days_old = NaiveDate::parse_from_str(&memory.resolved_date, "%Y-%m-%d")
                .ok()
                .map(|date| (Utc::now().date_naive() - date).num_days());
            let decay = match days_old {
                Some(days) => (1.0 - days as f64 / MEMORY_DECAY_DAYS as f64).max(0.1),
                None => 0.5,
            };
            let adjusted = memory.relevance_score * decay;

            if adjusted < PRUNE_THRESHOLD {
                if !dry_run {
                    let path = self.ticket_path(&memory.app, &ticket_id);
                    let _ = tokio::fs::remove_file(path).await;
                }
                pruned.push(PrunedMemory {
                    ticket_id,
                    app: memory.app,
                    adjusted_relevance: adjusted,
                    days_old,
                });
            } else {
                kept += 1;
            }
        }

        if !dry_run {
            self.update_metadata(0, 0, Some(Utc::now())).await?;
        }

        let pruned_count = pruned.len();
        pruned.truncate(20);
        Ok(PruneReport {
            dry_run,
            pruned_count,
            kept_count: kept,
            pruned_memories: pruned,
        })
    }

    async fn update_metadata(
        &self,
        memories_delta: i64,
        patterns_delta: i64,
        last_pruned: Option<DateTime<Utc>>,
    ) -> Result<(), MemoryError> {
        let mut meta: MemoryMetadata =
            load_json(&self.metadata_path()).await.unwrap_or_default();
        meta.total_memories += memories_delta;
        meta.total_patterns += patterns_delta;
        if last_pruned.is_some() {
            meta.last_pruned = last_pruned;
        }
        meta.last_updated = Some(Utc::now());
        save_json(&self.metadata_path(), &meta).await
    }

    pub async fn get_stats(&self) -> MemoryStats {
        let meta: MemoryMetadata = load_json(&self.metadata_path()).await.unwrap_or_default();
        let total_memories = count_json_files(&self.base_path.join("tickets")).await;
        let total_sessions = count_json_files(&self.base_path.join("sessions")).await;
        let total_patterns = load_json::<PatternsFile>(&self.patterns_path())
            .await
            .map(|f| f.patterns.len())
            .unwrap_or(0);

        MemoryStats {
            schema_version: SCHEMA_VERSION.into(),
            total_memories,
            total_patterns,
            total_sessions,
            index_keywords: self.index.keyword_to_tickets.len(),
            index_files: self.index.file_to_tickets.len(),
            last_pruned: meta.last_pruned,
            last_updated: meta.last_updated,
        }
    }

    // -----------------------------------------------------------------------
    // Ticket resolution integration
    // -----------------------------------------------------------------------

    /// Build a memory from a resolved ticket snapshot.
    ///
    /// Returns `None` for unresolved tickets and for tickets without both a
    /// problem and a solution worth remembering.
    pub fn create_memory_from_ticket(&self, ticket: &TicketSnapshot) -> Option<TicketMemory> {
        let status = ticket.status.to_lowercase();
        if !status.contains("resolved") && !status.contains("closed") {
            return None;
        }

        let text = format!("{} {}", ticket.title, ticket.description);
        let keywords = extract_keywords(&text);

        let problem = ticket
            .problem_summary
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| ticket.description.chars().take(200).collect());
        let solution = ticket
            .solution_summary
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| ticket.resolution.clone())
            .map(|s| s.chars().take(300).collect::<String>())
            .unwrap_or_default();

        if problem.is_empty() || solution.is_empty() {
            return None;
        }

        Some(TicketMemory {
            ticket_id: ticket.ticket_id.clone(),
            app: if ticket.app.is_empty() { "unknown".into() } else { ticket.app.clone() },
            app_version: ticket.app_version.clone(),
            title: ticket.title.clone(),
            problem_summary: problem,
            solution_summary: solution,
            files_modified: ticket.files_modified.clone(),
            keywords,
            ticket_type: ticket.ticket_type.clone(),
            resolved_date: ticket
                .resolved_date
                .clone()
                .unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string()),
            access_count: 0,
            last_accessed: None,
            relevance_score: 1.0,
        })
    }
}

// ---------------------------------------------------------------------------
// Scoring helpers
// ---------------------------------------------------------------------------

/// Lowercased word set (`[a-z0-9_]+` runs).
fn words_of(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Weighted relevance of a memory against a query.
///
/// Keyword overlap contributes up to 0.3, free-text overlap 0.1, file
/// overlap 0.3, type match 0.1, recency 0.1, access frequency 0.1.
fn relevance_score(
    memory: &TicketMemory,
    query_words: &BTreeSet<String>,
    files: &[String],
    ticket_type: Option<&str>,
) -> f64 {
    let mut score = 0.0;

    let memory_keywords: BTreeSet<String> =
        memory.keywords.iter().map(|k| k.to_lowercase()).collect();
    let memory_text = format!(
        "{} {} {}",
        memory.title, memory.problem_summary, memory.solution_summary
    );
    let memory_words = words_of(&memory_text);

    let keyword_overlap = query_words.intersection(&memory_keywords).count();
    let text_overlap = query_words.intersection(&memory_words).count();

    if !memory_keywords.is_empty() && !query_words.is_empty() {
        score += 0.3 * keyword_overlap as f64 / query_words.len() as f64;
    }
    score += 0.1 * (text_overlap as f64 / 5.0).min(1.0);

    if !files.is_empty() {
        let memory_files: BTreeSet<String> =
            memory.files_modified.iter().map(|f| f.to_lowercase()).collect();
        let query_files: BTreeSet<String> = files.iter().map(|f| f.to_lowercase()).collect();
        let file_overlap = query_files.intersection(&memory_files).count();
        score += 0.3 * file_overlap as f64 / query_files.len() as f64;
    }

    if let Some(ticket_type) = ticket_type {
        if memory.ticket_type.eq_ignore_ascii_case(ticket_type) {
            score += 0.1;
        }
    }

    if let Ok(resolved) = NaiveDate::parse_from_str(&memory.resolved_date, "%Y-%m-%d") {
        let days_old = (Utc::now().date_naive() - resolved).num_days();
        let recency = (1.0 - days_old as f64 / MEMORY_DECAY_DAYS as f64).max(0.0);
        score += 0.1 * recency;
    }

    score += 0.1 * (memory.access_count as f64 / 10.0).min(1.0);
    score
}

/// Top keywords by frequency (length >= 3, stopwords removed).
fn extract_keywords(text: &str) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
    {
        if word.len() >= 3
            && word.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && !STOPWORDS.contains(&word)
        {
            *counts.entry(word.to_string()).or_default() += 1;
        }
    }
    let mut words: Vec<(String, usize)> = counts.into_iter().collect();
    words.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    words.into_iter().take(15).map(|(w, _)| w).collect()
}

/// Stable pattern id derived from the file path.
fn pattern_id_for(file_path: &str) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, file_path.as_bytes());
    hex::encode(&digest.as_ref()[..4])
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

async fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load json");
            None
        }
    }
}

/// Atomic save: write to a sibling temp file, then rename.
async fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), MemoryError> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(value)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
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

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
