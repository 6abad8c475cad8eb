use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

// ---------------------------------------------------------------------------
// BudgetTier
// ---------------------------------------------------------------------------

/// Allocation tier of a session budget. Each expansion moves one step down
/// the ladder; `Critical` is the hard ceiling and cannot expand further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetTier {
    Base,
    Expanded,
    Critical,
}

/// Handoff warning threshold: start preparing a handoff at 60% usage.
const SHOULD_HANDOFF_PERCENT: u64 = 60;
/// Handoff critical threshold: must hand off at 80% usage.
const MUST_HANDOFF_PERCENT: u64 = 80;

// ---------------------------------------------------------------------------
// TokenBudget
// ---------------------------------------------------------------------------

/// Token allocation for a single agent session.
///
/// Invariants: `used <= allocated` and `peak >= used` at all times; once
/// `expansion_count` reaches its cap no further expansion is permitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBudget {
    pub agent_name: String,
    pub session_id: String,
    pub allocated: u64,
    pub used: u64,
    pub peak: u64,
    pub expansion_count: u32,
    pub max_expansions: u32,
    pub tier: BudgetTier,
    pub created_at: DateTime<Utc>,
}

impl TokenBudget {
    pub fn new(
        agent_name: impl Into<String>,
        session_id: impl Into<String>,
        allocated: u64,
        max_expansions: u32,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            session_id: session_id.into(),
            allocated,
            used: 0,
            peak: 0,
            expansion_count: 0,
            max_expansions,
            tier: BudgetTier::Base,
            created_at: Utc::now(),
        }
    }

    /// Consume `n` tokens. Succeeds iff `used + n <= allocated`.
    pub fn consume(&mut self, n: u64) -> bool {
        if self.used + n > self.allocated {
            return false;
        }
        self.used += n;
        self.peak = self.peak.max(self.used);
        true
    }

    /// Release `n` tokens, clamping at zero. Peak is a watermark and is
    /// never lowered here.
    pub fn release(&mut self, n: u64) {
        self.used = self.used.saturating_sub(n);
    }

    /// Attempt to expand the allocation by the tier-dependent factor.
    ///
    /// `Base` grows 1.5x into `Expanded`, `Expanded` grows 1.25x into
    /// `Critical`, and `Critical` is the hard ceiling. Returns `false` once
    /// the expansion cap or the ceiling is reached.
    pub fn try_expand(&mut self) -> bool {
        if self.expansion_count >= self.max_expansions {
            return false;
        }
        let (factor, next_tier) = match self.tier {
            BudgetTier::Base => (1.5, BudgetTier::Expanded),
            BudgetTier::Expanded => (1.25, BudgetTier::Critical),
            BudgetTier::Critical => return false,
        };
        self.allocated = (self.allocated as f64 * factor) as u64;
        self.tier = next_tier;
        self.expansion_count += 1;
        debug!(
            session = %self.session_id,
            allocated = self.allocated,
            tier = ?self.tier,
            "budget expanded"
        );
        true
    }

    pub fn available(&self) -> u64 {
        self.allocated - self.used
    }

    /// True at or past 60% usage: start preparing a handoff.
    pub fn should_handoff(&self) -> bool {
        self.used * 100 >= self.allocated * SHOULD_HANDOFF_PERCENT
    }

    /// True at or past 80% usage: hand off immediately.
    pub fn must_handoff(&self) -> bool {
        self.used * 100 >= self.allocated * MUST_HANDOFF_PERCENT
    }
}

// ---------------------------------------------------------------------------
// BudgetSummary
// ---------------------------------------------------------------------------

/// Final accounting returned when a session's budget is closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSummary {
    pub agent_name: String,
    pub session_id: String,
    pub used: u64,
    pub peak: u64,
    pub expansion_count: u32,
    pub final_tier: BudgetTier,
    pub duration_seconds: i64,
}

/// Aggregate usage across all live budgets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TotalUsage {
    pub active_sessions: usize,
    pub total_allocated: u64,
    pub total_used: u64,
}

// ---------------------------------------------------------------------------
// BudgetManager
// ---------------------------------------------------------------------------

/// Owns every session budget. One lock per budget, so contention is
/// per-session; the outer map lock is held only for lookups.
pub struct BudgetManager {
    base_allocation: u64,
    max_expansions: u32,
    budgets: RwLock<HashMap<String, Arc<Mutex<TokenBudget>>>>,
}

impl BudgetManager {
    pub fn new(base_allocation: u64, max_expansions: u32) -> Self {
        Self {
            base_allocation,
            max_expansions,
            budgets: RwLock::new(HashMap::new()),
        }
    }

    /// Create (or replace) the budget for a session.
    pub fn create_budget(
        &self,
        agent_name: &str,
        session_id: &str,
        base_allocation: Option<u64>,
    ) -> Arc<Mutex<TokenBudget>> {
        let allocation = base_allocation.unwrap_or(self.base_allocation);
        let budget = Arc::new(Mutex::new(TokenBudget::new(
            agent_name,
            session_id,
            allocation,
            self.max_expansions,
        )));
        self.budgets
            .write()
            .expect("budget map lock poisoned")
            .insert(session_id.to_string(), Arc::clone(&budget));
        budget
    }

    pub fn get_budget(&self, session_id: &str) -> Option<Arc<Mutex<TokenBudget>>> {
        self.budgets
            .read()
            .expect("budget map lock poisoned")
            .get(session_id)
            .cloned()
    }

    /// Consume tokens for a session. Unknown sessions are a no-op `false`.
    pub fn consume(&self, session_id: &str, n: u64) -> bool {
        match self.get_budget(session_id) {
            Some(budget) => budget.lock().expect("budget lock poisoned").consume(n),
            None => false,
        }
    }

    /// Release tokens for a session. Unknown sessions are a no-op.
    pub fn release(&self, session_id: &str, n: u64) {
        if let Some(budget) = self.get_budget(session_id) {
            budget.lock().expect("budget lock poisoned").release(n);
        }
    }

    /// Attempt a tier expansion for a session.
    pub fn try_expand(&self, session_id: &str) -> bool {
        match self.get_budget(session_id) {
            Some(budget) => budget.lock().expect("budget lock poisoned").try_expand(),
            None => false,
        }
    }

    /// Close a session's budget and free its entry. Idempotent: closing an
    /// unknown or already-closed session returns `None`.
    pub fn close_session(&self, session_id: &str) -> Option<BudgetSummary> {
        let budget = self
            .budgets
            .write()
            .expect("budget map lock poisoned")
            .remove(session_id)?;
        let budget = budget.lock().expect("budget lock poisoned");
        Some(BudgetSummary {
            agent_name: budget.agent_name.clone(),
            session_id: budget.session_id.clone(),
            used: budget.used,
            peak: budget.peak,
            expansion_count: budget.expansion_count,
            final_tier: budget.tier,
            duration_seconds: (Utc::now() - budget.created_at).num_seconds(),
        })
    }

    /// Snapshot of aggregate usage across every live budget.
    pub fn get_total_usage(&self) -> TotalUsage {
        let budgets = self.budgets.read().expect("budget map lock poisoned");
        let mut usage = TotalUsage {
            active_sessions: budgets.len(),
            ..TotalUsage::default()
        };
        for budget in budgets.values() {
            let budget = budget.lock().expect("budget lock poisoned");
            usage.total_allocated += budget.allocated;
            usage.total_used += budget.used;
        }
        usage
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
