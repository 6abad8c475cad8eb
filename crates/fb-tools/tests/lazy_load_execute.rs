//! Lazy registration end-to-end: the constructor runs exactly once, the
//! tool enters the active set with a recorded load time, and subsequent
//! executions update its stats.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fb_tools::registry::ToolRegistry;
use fb_tools::tool::{Tool, ToolCategory, ToolDefinition, ToolParameter, ParameterType};

static CONSTRUCTED: AtomicUsize = AtomicUsize::new(0);

struct LintTool {
    definition: ToolDefinition,
}

impl LintTool {
    fn construct() -> Arc<dyn Tool> {
        CONSTRUCTED.fetch_add(1, Ordering::SeqCst);
        Arc::new(Self {
            definition: ToolDefinition {
                name: "lint".into(),
                description: "Run the configured linter".into(),
                category: ToolCategory::Quality,
                parameters: vec![ToolParameter::required(
                    "path",
                    "file or directory to lint",
                    ParameterType::String,
                )],
            },
        })
    }
}

#[async_trait]
impl Tool for LintTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn execute(&self, params: Value) -> anyhow::Result<Value> {
        Ok(json!({"path": params["path"], "issues": 0}))
    }
}

#[tokio::test]
async fn lazy_tool_loads_once_and_accumulates_stats() {
    let mut registry = ToolRegistry::new(60);
    registry.register_lazy("lint", ToolCategory::Quality, Box::new(LintTool::construct));

    assert!(registry.is_lazy("lint"));
    assert!(!registry.is_loaded("lint"));
    assert_eq!(CONSTRUCTED.load(Ordering::SeqCst), 0);

    let status = registry.load("lint");
    assert!(status.loaded);
    assert_eq!(status.category, ToolCategory::Quality);
    assert!(status.load_time_ms >= 0.0);
    assert_eq!(CONSTRUCTED.load(Ordering::SeqCst), 1);
    assert!(registry.is_loaded("lint"));

    let result = registry
        .execute("lint", json!({"path": "src/lib.rs"}), None)
        .await;
    assert!(result.success);
    assert_eq!(result.data.unwrap()["issues"], 0);

    let stats = registry.get_tool_stats("lint").unwrap();
    assert_eq!(stats.total_executions, 1);
    assert_eq!(stats.error_count, 0);
    assert_eq!(CONSTRUCTED.load(Ordering::SeqCst), 1);
}
