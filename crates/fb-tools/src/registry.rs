use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::tool::{safe_execute, Tool, ToolCategory, ToolResult};

// ---------------------------------------------------------------------------
// Registration records
// ---------------------------------------------------------------------------

/// Constructor for a lazily registered tool, invoked exactly once on first
/// resolve.
pub type ToolFactory = Box<dyn Fn() -> Arc<dyn Tool> + Send + Sync>;

struct LazyToolSpec {
    category: ToolCategory,
    factory: ToolFactory,
    instance: Option<Arc<dyn Tool>>,
}

impl LazyToolSpec {
    fn get_instance(&mut self) -> Arc<dyn Tool> {
        if self.instance.is_none() {
            self.instance = Some((self.factory)());
        }
        Arc::clone(self.instance.as_ref().expect("instance just materialized"))
    }
}

/// Status of one load operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolLoadStatus {
    pub name: String,
    pub loaded: bool,
    pub category: ToolCategory,
    pub load_time_ms: f64,
    #[serde(default)]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Execution stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ToolExecutionStats {
    total_executions: u64,
    total_time_ms: f64,
    min_time_ms: f64,
    max_time_ms: f64,
    last_execution: Option<DateTime<Utc>>,
    error_count: u64,
}

impl ToolExecutionStats {
    fn new() -> Self {
        Self {
            total_executions: 0,
            total_time_ms: 0.0,
            min_time_ms: f64::INFINITY,
            max_time_ms: 0.0,
            last_execution: None,
            error_count: 0,
        }
    }

    fn record(&mut self, execution_time_ms: f64, success: bool) {
        self.total_executions += 1;
        self.total_time_ms += execution_time_ms;
        self.min_time_ms = self.min_time_ms.min(execution_time_ms);
        self.max_time_ms = self.max_time_ms.max(execution_time_ms);
        self.last_execution = Some(Utc::now());
        if !success {
            self.error_count += 1;
        }
    }
}

/// Point-in-time view of one tool's execution statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStatsSnapshot {
    pub name: String,
    pub total_executions: u64,
    pub average_time_ms: f64,
    pub min_time_ms: f64,
    pub max_time_ms: f64,
    pub error_count: u64,
    pub last_execution: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Performance report
// ---------------------------------------------------------------------------

/// Registry load status: `optimal` (≤40 active), `moderate` (≤50),
/// `heavy` (≤max), `overloaded` (>max).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryStatus {
    Optimal,
    Moderate,
    Heavy,
    Overloaded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub active_tools: usize,
    pub available_tools: usize,
    pub max_recommended: usize,
    pub status: RegistryStatus,
    pub categories: HashMap<String, usize>,
    pub recommendation: Option<String>,
    pub total_executions: u64,
    pub average_execution_time_ms: f64,
}

// ---------------------------------------------------------------------------
// ToolRegistry
// ---------------------------------------------------------------------------

/// Registry of available and active tools.
///
/// Registration and loading are driven from a single control task (`&mut
/// self`); execution is concurrent (`&self`) with stats behind per-tool
/// shard locks.
pub struct ToolRegistry {
    available: HashMap<String, Arc<dyn Tool>>,
    active: HashMap<String, Arc<dyn Tool>>,
    lazy: HashMap<String, LazyToolSpec>,
    max_active: usize,
    load_history: Vec<ToolLoadStatus>,
    stats: DashMap<String, ToolExecutionStats>,
}

impl ToolRegistry {
    pub fn new(max_active: usize) -> Self {
        Self {
            available: HashMap::new(),
            active: HashMap::new(),
            lazy: HashMap::new(),
            max_active,
            load_history: Vec::new(),
            stats: DashMap::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a tool instance. Re-registering a name replaces the prior
    /// entry and logs a warning.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.available.contains_key(&name) || self.lazy.contains_key(&name) {
            warn!(tool = %name, "tool already registered, replacing");
            self.lazy.remove(&name);
        }
        debug!(tool = %name, category = tool.category().as_str(), "registered tool");
        self.available.insert(name, tool);
    }

    /// Register a tool constructor for lazy materialization on first
    /// access.
    pub fn register_lazy(
        &mut self,
        name: impl Into<String>,
        category: ToolCategory,
        factory: ToolFactory,
    ) {
        let name = name.into();
        if self.available.contains_key(&name) {
            warn!(tool = %name, "tool already registered as instance, skipping lazy registration");
            return;
        }
        if self.lazy.contains_key(&name) {
            warn!(tool = %name, "tool already registered for lazy loading, replacing");
        }
        debug!(tool = %name, category = category.as_str(), "registered lazy tool");
        self.lazy.insert(
            name,
            LazyToolSpec {
                category,
                factory,
                instance: None,
            },
        );
    }

    /// Remove a tool entirely (unloading it first). Returns `true` when
    /// anything was removed.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.active.remove(name);
        let removed_eager = self.available.remove(name).is_some();
        let removed_lazy = self.lazy.remove(name).is_some();
        if removed_eager || removed_lazy {
            debug!(tool = %name, "unregistered tool");
        }
        removed_eager || removed_lazy
    }

    // -----------------------------------------------------------------------
    // Loading / unloading
    // -----------------------------------------------------------------------

    fn resolve(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        if let Some(tool) = self.available.get(name) {
            return Some(Arc::clone(tool));
        }
        if let Some(spec) = self.lazy.get_mut(name) {
            let tool = spec.get_instance();
            self.available.insert(name.to_string(), Arc::clone(&tool));
            debug!(tool = %name, "lazy-loaded tool");
            return Some(tool);
        }
        None
    }

    /// Move a tool into the active set, materializing it if lazy.
    ///
    /// The soft active cap emits a warning once exceeded but never blocks.
    pub fn load(&mut self, name: &str) -> ToolLoadStatus {
        let start = Instant::now();

        if let Some(tool) = self.active.get(name) {
            return ToolLoadStatus {
                name: name.to_string(),
                loaded: true,
                category: tool.category(),
                load_time_ms: 0.0,
                error: Some("already loaded".into()),
            };
        }

        let Some(tool) = self.resolve(name) else {
            let category = self
                .lazy
                .get(name)
                .map(|spec| spec.category)
                .unwrap_or(ToolCategory::Core);
            let status = ToolLoadStatus {
                name: name.to_string(),
                loaded: false,
                category,
                load_time_ms: start.elapsed().as_secs_f64() * 1_000.0,
                error: Some(format!("tool not found: {name}")),
            };
            self.load_history.push(status.clone());
            return status;
        };

        if self.active.len() >= self.max_active {
            warn!(
                active = self.active.len(),
                max = self.max_active,
                "active tool count at limit; performance may be impacted"
            );
        }

        let category = tool.category();
        self.active.insert(name.to_string(), tool);
        let status = ToolLoadStatus {
            name: name.to_string(),
            loaded: true,
            category,
            load_time_ms: start.elapsed().as_secs_f64() * 1_000.0,
            error: None,
        };
        self.load_history.push(status.clone());
        status
    }

    /// Load every available tool in a category.
    pub fn load_category(&mut self, category: ToolCategory) -> Vec<ToolLoadStatus> {
        let mut names: Vec<String> = self
            .available
            .iter()
            .filter(|(name, tool)| {
                tool.category() == category && !self.active.contains_key(*name)
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.extend(
            self.lazy
                .iter()
                .filter(|(name, spec)| {
                    spec.category == category
                        && !self.active.contains_key(*name)
                        && !self.available.contains_key(*name)
                })
                .map(|(name, _)| name.clone()),
        );
        names.sort();
        names.into_iter().map(|name| self.load(&name)).collect()
    }

    /// Load all core tools.
    pub fn load_core(&mut self) -> Vec<ToolLoadStatus> {
        self.load_category(ToolCategory::Core)
    }

    /// Remove a tool from the active set. Core tools are refused unless
    /// `force` is set.
    pub fn unload(&mut self, name: &str, force: bool) -> bool {
        let Some(tool) = self.active.get(name) else {
            return false;
        };
        if tool.category() == ToolCategory::Core && !force {
            warn!(tool = %name, "cannot unload core tool");
            return false;
        }
        self.active.remove(name);
        debug!(tool = %name, "unloaded tool");
        true
    }

    /// Unload every active tool in a non-core category. Returns the count.
    pub fn unload_category(&mut self, category: ToolCategory) -> usize {
        if category == ToolCategory::Core {
            warn!("cannot unload core tools");
            return 0;
        }
        let names: Vec<String> = self
            .active
            .iter()
            .filter(|(_, tool)| tool.category() == category)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            self.active.remove(name);
        }
        names.len()
    }

    // -----------------------------------------------------------------------
    // Access
    // -----------------------------------------------------------------------

    /// Active tool lookup.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.active.get(name).map(Arc::clone)
    }

    /// Lookup across the available set, materializing lazy tools.
    pub fn get_available(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        self.resolve(name)
    }

    /// Names of everything registered, without materializing lazy specs.
    pub fn available_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.available.keys().cloned().collect();
        names.extend(self.lazy.keys().cloned());
        names.sort();
        names.dedup();
        names
    }

    pub fn lazy_names(&self) -> Vec<String> {
        self.lazy.keys().cloned().collect()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.active.contains_key(name)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.available.contains_key(name) || self.lazy.contains_key(name)
    }

    /// True for tools registered lazily and not yet materialized.
    pub fn is_lazy(&self, name: &str) -> bool {
        self.lazy.contains_key(name) && !self.available.contains_key(name)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Schemas for every active tool.
    pub fn get_schemas(&self) -> Vec<Value> {
        self.active
            .values()
            .map(|tool| tool.definition().to_schema())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Execute an active tool, recording per-tool stats. Unloaded tools
    /// fail without executing.
    pub async fn execute(
        &self,
        name: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> ToolResult {
        let Some(tool) = self.get(name) else {
            return ToolResult::err(format!("tool not loaded: {name}"));
        };

        let result = safe_execute(tool.as_ref(), params, timeout).await;

        self.stats
            .entry(name.to_string())
            .or_insert_with(ToolExecutionStats::new)
            .record(result.execution_time_ms, result.success);

        result
    }

    // -----------------------------------------------------------------------
    // Performance monitoring
    // -----------------------------------------------------------------------

    pub fn get_performance_report(&self) -> PerformanceReport {
        let active_count = self.active.len();
        let available_count = self.available_names().len();

        let status = if active_count <= 40 {
            RegistryStatus::Optimal
        } else if active_count <= 50 {
            RegistryStatus::Moderate
        } else if active_count <= self.max_active {
            RegistryStatus::Heavy
        } else {
            RegistryStatus::Overloaded
        };

        let mut categories: HashMap<String, usize> = HashMap::new();
        for tool in self.active.values() {
            *categories.entry(tool.category().as_str().to_string()).or_default() += 1;
        }

        let mut total_executions = 0u64;
        let mut total_time = 0.0f64;
        for entry in self.stats.iter() {
            total_executions += entry.total_executions;
            total_time += entry.total_time_ms;
        }
        let average = if total_executions > 0 {
            total_time / total_executions as f64
        } else {
            0.0
        };

        PerformanceReport {
            active_tools: active_count,
            available_tools: available_count,
            max_recommended: self.max_active,
            status,
            categories,
            recommendation: self.recommendation(active_count),
            total_executions,
            average_execution_time_ms: average,
        }
    }

    fn recommendation(&self, active_count: usize) -> Option<String> {
        if active_count < 20 {
            None
        } else if active_count < 40 {
            Some("Consider reviewing unused tools".into())
        } else if active_count < self.max_active {
            Some("Tool count is high. Consider unloading unused tools".into())
        } else {
            Some("WARNING: tool count exceeds recommended limit. Performance may be degraded".into())
        }
    }

    pub fn get_tool_stats(&self, name: &str) -> Option<ToolStatsSnapshot> {
        let stats = self.stats.get(name)?;
        Some(ToolStatsSnapshot {
            name: name.to_string(),
            total_executions: stats.total_executions,
            average_time_ms: if stats.total_executions > 0 {
                stats.total_time_ms / stats.total_executions as f64
            } else {
                0.0
            },
            min_time_ms: if stats.min_time_ms.is_finite() {
                stats.min_time_ms
            } else {
                0.0
            },
            max_time_ms: stats.max_time_ms,
            error_count: stats.error_count,
            last_execution: stats.last_execution,
        })
    }

    pub fn load_history(&self) -> &[ToolLoadStatus] {
        &self.load_history
    }

    /// Clear execution statistics and load history.
    pub fn clear_stats(&mut self) {
        self.stats.clear();
        self.load_history.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
