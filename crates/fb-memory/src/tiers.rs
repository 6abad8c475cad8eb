use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::budget::{BudgetManager, BudgetSummary, TokenBudget};

// ---------------------------------------------------------------------------
// MemoryTier
// ---------------------------------------------------------------------------

/// Memory tiers ordered hottest to coldest.
///
/// HOT is in-context and counted against the session budget; WARM is
/// session-local; COOL and COLD are shared across sessions; FROZEN is a
/// lazy reference tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MemoryTier {
    Hot,
    Warm,
    Cool,
    Cold,
    Frozen,
}

impl MemoryTier {
    /// All tiers, hottest first.
    pub const ALL: [MemoryTier; 5] = [
        MemoryTier::Hot,
        MemoryTier::Warm,
        MemoryTier::Cool,
        MemoryTier::Cold,
        MemoryTier::Frozen,
    ];
}

// ---------------------------------------------------------------------------
// MemoryItem
// ---------------------------------------------------------------------------

/// A single item in the tiered memory system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub item_id: String,
    pub tier: MemoryTier,
    pub content: String,
    pub token_count: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_accessed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub access_count: u32,
    /// Present only for semantic (COOL) items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl MemoryItem {
    pub fn new(
        item_id: impl Into<String>,
        tier: MemoryTier,
        content: impl Into<String>,
        token_count: u64,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            tier,
            content: content.into(),
            token_count,
            created_at: Utc::now(),
            last_accessed: None,
            access_count: 0,
            embedding: None,
        }
    }

    /// Record an access, returning the content.
    pub fn access(&mut self) -> &str {
        self.last_accessed = Some(Utc::now());
        self.access_count += 1;
        &self.content
    }
}

// ---------------------------------------------------------------------------
// TieredMemoryStore
// ---------------------------------------------------------------------------

/// Per-tier usage statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierUsage {
    pub count: usize,
    pub tokens: u64,
}

/// Snapshot of a store's tier usage plus its budget state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierStats {
    pub hot: TierUsage,
    pub warm: TierUsage,
    pub cool: TierUsage,
    pub cold: TierUsage,
    pub frozen: TierUsage,
    pub budget_allocated: u64,
    pub budget_used: u64,
    pub budget_available: u64,
}

/// Memory store for a single agent session across all five tiers.
///
/// Owned by the session task; callers guarantee single-threaded access, so
/// the store holds no lock of its own. Only the borrowed budget is locked,
/// and never across an await point.
pub struct TieredMemoryStore {
    session_id: String,
    budget: Arc<Mutex<TokenBudget>>,
    hot: HashMap<String, MemoryItem>,
    warm: HashMap<String, MemoryItem>,
    cool: HashMap<String, MemoryItem>,
    cold: HashMap<String, MemoryItem>,
    frozen: HashMap<String, MemoryItem>,
    /// HOT-tier LRU order: front is least recently stored/promoted.
    access_order: Vec<String>,
}

impl TieredMemoryStore {
    pub fn new(session_id: impl Into<String>, budget: Arc<Mutex<TokenBudget>>) -> Self {
        Self {
            session_id: session_id.into(),
            budget,
            hot: HashMap::new(),
            warm: HashMap::new(),
            cool: HashMap::new(),
            cold: HashMap::new(),
            frozen: HashMap::new(),
            access_order: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn budget(&self) -> &Arc<Mutex<TokenBudget>> {
        &self.budget
    }

    fn tier_store(&self, tier: MemoryTier) -> &HashMap<String, MemoryItem> {
        match tier {
            MemoryTier::Hot => &self.hot,
            MemoryTier::Warm => &self.warm,
            MemoryTier::Cool => &self.cool,
            MemoryTier::Cold => &self.cold,
            MemoryTier::Frozen => &self.frozen,
        }
    }

    fn tier_store_mut(&mut self, tier: MemoryTier) -> &mut HashMap<String, MemoryItem> {
        match tier {
            MemoryTier::Hot => &mut self.hot,
            MemoryTier::Warm => &mut self.warm,
            MemoryTier::Cool => &mut self.cool,
            MemoryTier::Cold => &mut self.cold,
            MemoryTier::Frozen => &mut self.frozen,
        }
    }

    fn consume_budget(&self, tokens: u64) -> bool {
        self.budget.lock().expect("budget lock poisoned").consume(tokens)
    }

    fn release_budget(&self, tokens: u64) {
        self.budget.lock().expect("budget lock poisoned").release(tokens);
    }

    /// Store an item in its designated tier.
    ///
    /// HOT items consume their token count from the session budget; if
    /// consumption fails the store evicts HOT LRU items down to WARM until
    /// enough room exists. Returns `false` without mutating state when even
    /// eviction cannot make room.
    pub fn store(&mut self, item: MemoryItem) -> bool {
        if item.tier == MemoryTier::Hot && !self.consume_budget(item.token_count) {
            if !self.evict_lru(item.token_count) {
                return false;
            }
            if !self.consume_budget(item.token_count) {
                return false;
            }
        }

        let id = item.item_id.clone();
        let tier = item.tier;
        self.tier_store_mut(tier).insert(id.clone(), item);
        if tier == MemoryTier::Hot {
            self.access_order.push(id);
        }
        true
    }

    /// Retrieve an item, updating its access bookkeeping.
    ///
    /// When `tier` is given only that tier is consulted; otherwise all
    /// tiers are searched hottest-first.
    pub fn retrieve(&mut self, item_id: &str, tier: Option<MemoryTier>) -> Option<&MemoryItem> {
        let found = match tier {
            Some(t) => self.tier_store(t).contains_key(item_id).then_some(t),
            None => MemoryTier::ALL
                .into_iter()
                .find(|t| self.tier_store(*t).contains_key(item_id)),
        }?;
        let item = self.tier_store_mut(found).get_mut(item_id)?;
        item.access();
        Some(&*item)
    }

    /// Promote an item from any cooler tier into HOT, consuming budget.
    /// May evict HOT LRU items to make room. Returns `false` when the item
    /// does not exist outside HOT or the budget cannot hold it.
    pub fn promote_to_hot(&mut self, item_id: &str) -> bool {
        let source = MemoryTier::ALL
            .into_iter()
            .skip(1)
            .find(|t| self.tier_store(*t).contains_key(item_id));
        let Some(source) = source else {
            return false;
        };

        let tokens = self.tier_store(source)[item_id].token_count;
        if !self.consume_budget(tokens) {
            if !self.evict_lru(tokens) {
                return false;
            }
            if !self.consume_budget(tokens) {
                return false;
            }
        }

        let mut item = self
            .tier_store_mut(source)
            .remove(item_id)
            .expect("item checked above");
        item.tier = MemoryTier::Hot;
        self.hot.insert(item_id.to_string(), item);
        self.access_order.push(item_id.to_string());
        true
    }

    /// Demote an item out of HOT into a cooler tier, releasing its tokens
    /// back to the budget. Always succeeds when the item is in HOT.
    pub fn demote_from_hot(&mut self, item_id: &str, target: MemoryTier) -> bool {
        let Some(mut item) = self.hot.remove(item_id) else {
            return false;
        };
        self.release_budget(item.token_count);
        item.tier = target;
        self.tier_store_mut(target).insert(item_id.to_string(), item);
        self.access_order.retain(|id| id != item_id);
        true
    }

    /// Evict least-recently-used HOT items down to WARM until at least
    /// `tokens_needed` tokens are freed. Returns `false` (without evicting)
    /// when HOT cannot cover the request.
    fn evict_lru(&mut self, tokens_needed: u64) -> bool {
        let mut freed = 0u64;
        let mut to_evict = Vec::new();
        for item_id in &self.access_order {
            if let Some(item) = self.hot.get(item_id) {
                to_evict.push(item_id.clone());
                freed += item.token_count;
                if freed >= tokens_needed {
                    break;
                }
            }
        }

        if freed < tokens_needed {
            return false;
        }

        for item_id in to_evict {
            self.demote_from_hot(&item_id, MemoryTier::Warm);
        }
        true
    }

    /// All HOT memory as a single context string, most-accessed first.
    pub fn get_hot_context(&self) -> String {
        let mut items: Vec<&MemoryItem> = self.hot.values().collect();
        items.sort_by(|a, b| b.access_count.cmp(&a.access_count));
        items
            .iter()
            .map(|i| i.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Total tokens currently held in HOT.
    pub fn hot_tokens(&self) -> u64 {
        self.hot.values().map(|i| i.token_count).sum()
    }

    /// Ids of every WARM item (load-on-demand references for handoff).
    pub fn warm_keys(&self) -> Vec<String> {
        self.warm.keys().cloned().collect()
    }

    pub(crate) fn drain_warm(&mut self) -> Vec<MemoryItem> {
        self.warm.drain().map(|(_, item)| item).collect()
    }

    /// Per-tier usage statistics plus the budget snapshot.
    pub fn get_tier_stats(&self) -> TierStats {
        fn usage(store: &HashMap<String, MemoryItem>) -> TierUsage {
            TierUsage {
                count: store.len(),
                tokens: store.values().map(|i| i.token_count).sum(),
            }
        }
        let budget = self.budget.lock().expect("budget lock poisoned");
        TierStats {
            hot: usage(&self.hot),
            warm: usage(&self.warm),
            cool: usage(&self.cool),
            cold: usage(&self.cold),
            frozen: usage(&self.frozen),
            budget_allocated: budget.allocated,
            budget_used: budget.used,
            budget_available: budget.allocated - budget.used,
        }
    }
}

// ---------------------------------------------------------------------------
// TieredMemoryManager
// ---------------------------------------------------------------------------

/// Limits on the process-wide shared tiers.
#[derive(Debug, Clone)]
pub struct SharedTierLimits {
    pub max_cool_items: usize,
    pub max_cool_tokens: u64,
    pub max_cold_items: usize,
    pub max_cold_tokens: u64,
}

impl Default for SharedTierLimits {
    fn default() -> Self {
        Self {
            max_cool_items: 100,
            max_cool_tokens: 50_000,
            max_cold_items: 500,
            max_cold_tokens: 200_000,
        }
    }
}

/// Stats returned when a session store is closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseStats {
    pub tier_stats: TierStats,
    pub promoted_to_shared: usize,
    pub evicted_from_shared: usize,
    pub budget_summary: Option<BudgetSummary>,
}

/// Aggregate view across all sessions and shared tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalMemoryStats {
    pub active_sessions: usize,
    pub shared_cool_items: usize,
    pub shared_cold_items: usize,
    pub total_allocated: u64,
    pub total_used: u64,
}

#[derive(Default)]
struct SharedTiers {
    cool: HashMap<String, MemoryItem>,
    cold: HashMap<String, MemoryItem>,
    open_sessions: usize,
}

/// Process-wide manager for tiered memory.
///
/// Hands out per-session stores (owned by their session task) and holds the
/// shared COOL/COLD tiers behind a single lock. Shared tiers are read-only
/// from sessions except via promotion at close.
pub struct TieredMemoryManager {
    budgets: Arc<BudgetManager>,
    limits: SharedTierLimits,
    shared: Mutex<SharedTiers>,
}

/// At close time, WARM items accessed at least this often move to shared COOL.
const SHARE_ACCESS_THRESHOLD: u32 = 3;
/// Cap on promotions per closing session.
const MAX_PROMOTIONS_PER_CLOSE: usize = 10;

impl TieredMemoryManager {
    pub fn new(budgets: Arc<BudgetManager>, limits: SharedTierLimits) -> Self {
        Self {
            budgets,
            limits,
            shared: Mutex::new(SharedTiers::default()),
        }
    }

    /// Create a store (and its budget) for a new agent session. The caller
    /// owns the returned store.
    pub fn create_store(&self, session_id: &str, agent_name: &str) -> TieredMemoryStore {
        let budget = self.budgets.create_budget(agent_name, session_id, None);
        self.shared.lock().expect("shared tier lock poisoned").open_sessions += 1;
        TieredMemoryStore::new(session_id, budget)
    }

    /// Close a session's store: promote frequently accessed WARM items into
    /// shared COOL (within limits), close the budget, and report stats.
    pub fn close_store(&self, mut store: TieredMemoryStore) -> CloseStats {
        let tier_stats = store.get_tier_stats();
        let session_id = store.session_id().to_string();

        let mut candidates = store.drain_warm();
        candidates.sort_by(|a, b| b.access_count.cmp(&a.access_count));

        let mut promoted = 0;
        let mut evicted = 0;
        {
            let mut shared = self.shared.lock().expect("shared tier lock poisoned");
            for mut item in candidates {
                if item.access_count < SHARE_ACCESS_THRESHOLD || promoted >= MAX_PROMOTIONS_PER_CLOSE
                {
                    continue;
                }
                evicted += Self::evict_shared(
                    &mut shared.cool,
                    self.limits.max_cool_items,
                    self.limits.max_cool_tokens,
                    item.token_count,
                );
                item.tier = MemoryTier::Cool;
                shared.cool.insert(item.item_id.clone(), item);
                promoted += 1;
            }
            shared.open_sessions = shared.open_sessions.saturating_sub(1);
        }

        debug!(session = %session_id, promoted, evicted, "closed tiered memory store");

        CloseStats {
            tier_stats,
            promoted_to_shared: promoted,
            evicted_from_shared: evicted,
            budget_summary: self.budgets.close_session(&session_id),
        }
    }

    /// Evict coolest shared items (lexicographic `(last_accessed,
    /// access_count)` order) until the store fits within limits with
    /// `tokens_needed` headroom. Returns the number of items evicted.
    fn evict_shared(
        store: &mut HashMap<String, MemoryItem>,
        max_items: usize,
        max_tokens: u64,
        tokens_needed: u64,
    ) -> usize {
        if store.is_empty() {
            return 0;
        }
        let mut order: Vec<(Option<DateTime<Utc>>, u32, String)> = store
            .values()
            .map(|i| (i.last_accessed, i.access_count, i.item_id.clone()))
            .collect();
        order.sort();

        let mut current_tokens: u64 = store.values().map(|i| i.token_count).sum();
        let token_limit = max_tokens.saturating_sub(tokens_needed);
        let mut evicted = 0;
        for (_, _, item_id) in order {
            if store.len() < max_items && current_tokens <= token_limit {
                break;
            }
            if let Some(item) = store.remove(&item_id) {
                current_tokens -= item.token_count;
                evicted += 1;
            }
        }
        evicted
    }

    /// Substring query over a shared tier. COOL holds semantic memory,
    /// COLD the keyword-indexed archive; other tiers return nothing.
    pub fn query_shared_memory(
        &self,
        query: &str,
        tier: MemoryTier,
        limit: usize,
    ) -> Vec<MemoryItem> {
        let items: Vec<MemoryItem> = {
            let shared = self.shared.lock().expect("shared tier lock poisoned");
            match tier {
                MemoryTier::Cool => shared.cool.values().cloned().collect(),
                MemoryTier::Cold => shared.cold.values().cloned().collect(),
                _ => return Vec::new(),
            }
        };

        // Search outside the lock.
        let query_lower = query.to_lowercase();
        items
            .into_iter()
            .filter(|item| item.content.to_lowercase().contains(&query_lower))
            .take(limit)
            .collect()
    }

    /// Semantic query over shared COOL memory by embedding similarity,
    /// best matches first. Items without embeddings are skipped.
    pub fn query_shared_by_embedding(
        &self,
        embedding: &[f32],
        limit: usize,
    ) -> Vec<(MemoryItem, f32)> {
        let items: Vec<MemoryItem> = {
            let shared = self.shared.lock().expect("shared tier lock poisoned");
            shared
                .cool
                .values()
                .filter(|item| item.embedding.is_some())
                .cloned()
                .collect()
        };

        let mut scored: Vec<(MemoryItem, f32)> = items
            .into_iter()
            .filter_map(|item| {
                let score = cosine_similarity(item.embedding.as_deref()?, embedding);
                Some((item, score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        scored
    }

    pub fn get_global_stats(&self) -> GlobalMemoryStats {
        let (sessions, cool, cold) = {
            let shared = self.shared.lock().expect("shared tier lock poisoned");
            (shared.open_sessions, shared.cool.len(), shared.cold.len())
        };
        let usage = self.budgets.get_total_usage();
        GlobalMemoryStats {
            active_sessions: sessions,
            shared_cool_items: cool,
            shared_cold_items: cold,
            total_allocated: usage.total_allocated,
            total_used: usage.total_used,
        }
    }
}

/// Cosine similarity of two vectors; 0.0 for mismatched dimensions or a
/// zero vector.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
