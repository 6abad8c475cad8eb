//! Codebase context facade for fastband — a read-through TTL+LRU cache
//! over an external analyzer. The core consumes analysis results through
//! the narrow [`codebase::CodebaseAnalyzer`] contract and never parses
//! code itself.

pub mod cache;
pub mod codebase;
