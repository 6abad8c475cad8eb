//! Memory subsystem for fastband — token budgets, tiered session memory,
//! signed handoff packets, and the semantic ticket-memory index.
//!
//! The pieces compose bottom-up: a [`budget::BudgetManager`] owns one
//! [`budget::TokenBudget`] per session; a [`tiers::TieredMemoryStore`]
//! borrows its session's budget and charges the HOT tier against it; the
//! [`handoff::HandoffManager`] snapshots a store into a signed packet when
//! the budget crosses its 60%/80% thresholds; and [`manager::MemoryManager`]
//! indexes resolved tickets for cross-session recall.

pub mod budget;
pub mod handoff;
pub mod manager;
pub mod models;
pub mod tiers;
