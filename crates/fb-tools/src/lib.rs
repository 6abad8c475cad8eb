//! Tool execution layer for fastband — typed tool definitions, the
//! registry with eager and lazy registration, per-tool performance
//! accounting, and the provider contracts the core consumes from external
//! AI collaborators.

pub mod provider;
pub mod registry;
pub mod tool;
