//! Ticket store for fastband — work items with lifecycle state, assignment,
//! and atomic claim semantics.
//!
//! Two interchangeable backends satisfy the same [`storage::TicketStore`]
//! contract: a document-oriented JSON store (whole-file copy-on-write) and
//! an indexed SQLite store (row-per-ticket with secondary indexes). `claim`
//! is the core concurrency primitive in both: of any number of agents
//! racing for an open ticket, exactly one wins.

pub mod json_store;
pub mod models;
pub mod sqlite_store;
pub mod storage;
