use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

use fb_memory::budget::BudgetManager;
use fb_memory::manager::MemoryManager;
use fb_tickets::models::{TicketPriority, TicketStatus};
use fb_tickets::storage::{ListFilter, TicketStore};
use fb_tools::registry::ToolRegistry;
use fb_tools::tool::{ParameterType, Tool, ToolCategory, ToolDefinition, ToolParameter};

// ---------------------------------------------------------------------------
// Built-in core tools
//
// Always-registered tools agents use to drive the orchestration core
// itself: list_tickets, claim_ticket, ticket_stats, budget_status,
// recall_memories.
// ---------------------------------------------------------------------------

/// Shared state needed to execute built-in tools.
#[derive(Clone)]
pub struct BuiltinToolContext {
    pub tickets: Arc<dyn TicketStore>,
    pub budgets: Arc<BudgetManager>,
    pub memory_index: Arc<Mutex<MemoryManager>>,
}

/// Register every built-in tool (eagerly, CORE category) and load them.
pub fn register_builtin_tools(registry: &mut ToolRegistry, ctx: &BuiltinToolContext) {
    registry.register(Arc::new(ListTicketsTool::new(Arc::clone(&ctx.tickets))));
    registry.register(Arc::new(ClaimTicketTool::new(Arc::clone(&ctx.tickets))));
    registry.register(Arc::new(TicketStatsTool::new(Arc::clone(&ctx.tickets))));
    registry.register(Arc::new(BudgetStatusTool::new(Arc::clone(&ctx.budgets))));
    registry.register(Arc::new(RecallMemoriesTool::new(Arc::clone(&ctx.memory_index))));
    registry.load_core();
}

fn status_param() -> ToolParameter {
    ToolParameter::optional(
        "status",
        "Filter by ticket status",
        ParameterType::Enum(vec![
            "open".into(),
            "in_progress".into(),
            "blocked".into(),
            "resolved".into(),
            "closed".into(),
        ]),
        None,
    )
}

fn parse_status(value: &Value) -> Option<TicketStatus> {
    match value.as_str()? {
        "open" => Some(TicketStatus::Open),
        "in_progress" => Some(TicketStatus::InProgress),
        "blocked" => Some(TicketStatus::Blocked),
        "resolved" => Some(TicketStatus::Resolved),
        "closed" => Some(TicketStatus::Closed),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// list_tickets
// ---------------------------------------------------------------------------

struct ListTicketsTool {
    tickets: Arc<dyn TicketStore>,
    definition: ToolDefinition,
}

impl ListTicketsTool {
    fn new(tickets: Arc<dyn TicketStore>) -> Self {
        Self {
            tickets,
            definition: ToolDefinition {
                name: "list_tickets".into(),
                description: "List tickets, optionally filtered by status, sorted by priority."
                    .into(),
                category: ToolCategory::Core,
                parameters: vec![
                    status_param(),
                    ToolParameter::optional(
                        "limit",
                        "Maximum number of tickets to return",
                        ParameterType::Integer,
                        Some(json!(20)),
                    ),
                ],
            },
        }
    }
}

#[async_trait]
impl Tool for ListTicketsTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn execute(&self, params: Value) -> anyhow::Result<Value> {
        let mut filter = ListFilter::new();
        filter.status = parse_status(&params["status"]);
        filter.limit = params["limit"].as_u64().unwrap_or(20) as usize;

        let tickets = self.tickets.list(filter).await?;
        let rows: Vec<Value> = tickets
            .iter()
            .map(|t| {
                json!({
                    "id": t.id,
                    "title": t.title,
                    "status": t.status.as_str(),
                    "priority": t.priority.as_str(),
                    "assigned_to": t.assigned_to,
                })
            })
            .collect();
        Ok(json!({"tickets": rows, "count": rows.len()}))
    }
}

// ---------------------------------------------------------------------------
// claim_ticket
// ---------------------------------------------------------------------------

struct ClaimTicketTool {
    tickets: Arc<dyn TicketStore>,
    definition: ToolDefinition,
}

impl ClaimTicketTool {
    fn new(tickets: Arc<dyn TicketStore>) -> Self {
        Self {
            tickets,
            definition: ToolDefinition {
                name: "claim_ticket".into(),
                description: "Atomically claim an open ticket for an agent.".into(),
                category: ToolCategory::Core,
                parameters: vec![
                    ToolParameter::required("ticket_id", "Ticket to claim", ParameterType::String),
                    ToolParameter::required("agent", "Claiming agent name", ParameterType::String),
                ],
            },
        }
    }
}

#[async_trait]
impl Tool for ClaimTicketTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn execute(&self, params: Value) -> anyhow::Result<Value> {
        let ticket_id = params["ticket_id"].as_str().unwrap_or_default();
        let agent = params["agent"].as_str().unwrap_or_default();
        let claimed = self.tickets.claim(ticket_id, agent).await?;
        Ok(json!({"claimed": claimed, "ticket_id": ticket_id, "agent": agent}))
    }
}

// ---------------------------------------------------------------------------
// ticket_stats
// ---------------------------------------------------------------------------

struct TicketStatsTool {
    tickets: Arc<dyn TicketStore>,
    definition: ToolDefinition,
}

impl TicketStatsTool {
    fn new(tickets: Arc<dyn TicketStore>) -> Self {
        Self {
            tickets,
            definition: ToolDefinition {
                name: "ticket_stats".into(),
                description: "Count tickets per status and per priority.".into(),
                category: ToolCategory::Core,
                parameters: vec![],
            },
        }
    }
}

#[async_trait]
impl Tool for TicketStatsTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn execute(&self, _params: Value) -> anyhow::Result<Value> {
        let mut by_status = serde_json::Map::new();
        for status in [
            TicketStatus::Open,
            TicketStatus::InProgress,
            TicketStatus::Blocked,
            TicketStatus::Resolved,
            TicketStatus::Closed,
        ] {
            let count = self.tickets.count(Some(status), None).await?;
            by_status.insert(status.as_str().into(), json!(count));
        }

        let mut by_priority = serde_json::Map::new();
        for priority in [
            TicketPriority::Critical,
            TicketPriority::High,
            TicketPriority::Medium,
            TicketPriority::Low,
        ] {
            let count = self.tickets.count(None, Some(priority)).await?;
            by_priority.insert(priority.as_str().into(), json!(count));
        }

        Ok(json!({
            "total": self.tickets.count(None, None).await?,
            "by_status": by_status,
            "by_priority": by_priority,
        }))
    }
}

// ---------------------------------------------------------------------------
// budget_status
// ---------------------------------------------------------------------------

struct BudgetStatusTool {
    budgets: Arc<BudgetManager>,
    definition: ToolDefinition,
}

impl BudgetStatusTool {
    fn new(budgets: Arc<BudgetManager>) -> Self {
        Self {
            budgets,
            definition: ToolDefinition {
                name: "budget_status".into(),
                description:
                    "Report a session budget (or aggregate usage when no session is given)."
                        .into(),
                category: ToolCategory::Core,
                parameters: vec![ToolParameter::optional(
                    "session_id",
                    "Session to inspect",
                    ParameterType::String,
                    None,
                )],
            },
        }
    }
}

#[async_trait]
impl Tool for BudgetStatusTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn execute(&self, params: Value) -> anyhow::Result<Value> {
        if let Some(session_id) = params["session_id"].as_str() {
            let Some(budget) = self.budgets.get_budget(session_id) else {
                anyhow::bail!("unknown session: {session_id}");
            };
            let budget = budget.lock().expect("budget lock poisoned");
            return Ok(json!({
                "session_id": session_id,
                "allocated": budget.allocated,
                "used": budget.used,
                "peak": budget.peak,
                "tier": budget.tier,
                "should_handoff": budget.should_handoff(),
                "must_handoff": budget.must_handoff(),
            }));
        }

        let usage = self.budgets.get_total_usage();
        Ok(json!({
            "active_sessions": usage.active_sessions,
            "total_allocated": usage.total_allocated,
            "total_used": usage.total_used,
        }))
    }
}

// ---------------------------------------------------------------------------
// recall_memories
// ---------------------------------------------------------------------------

struct RecallMemoriesTool {
    memory_index: Arc<Mutex<MemoryManager>>,
    definition: ToolDefinition,
}

impl RecallMemoriesTool {
    fn new(memory_index: Arc<Mutex<MemoryManager>>) -> Self {
        Self {
            memory_index,
            definition: ToolDefinition {
                name: "recall_memories".into(),
                description: "Query resolved-ticket memories by relevance.".into(),
                category: ToolCategory::Core,
                parameters: vec![
                    ToolParameter::required("query", "What to recall", ParameterType::String),
                    ToolParameter::optional("app", "Restrict to one app", ParameterType::String, None),
                    ToolParameter::optional(
                        "limit",
                        "Maximum memories to return",
                        ParameterType::Integer,
                        Some(json!(5)),
                    ),
                ],
            },
        }
    }
}

#[async_trait]
impl Tool for RecallMemoriesTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn execute(&self, params: Value) -> anyhow::Result<Value> {
        let query = params["query"].as_str().unwrap_or_default();
        let app = params["app"].as_str();
        let limit = params["limit"].as_u64().unwrap_or(5) as usize;

        let index = self.memory_index.lock().await;
        let results = index
            .query_memories(query, app, None, &[], None, Some(limit))
            .await;

        let rows: Vec<Value> = results
            .iter()
            .map(|(memory, score)| {
                json!({
                    "ticket_id": memory.ticket_id,
                    "title": memory.title,
                    "problem": memory.problem_summary,
                    "solution": memory.solution_summary,
                    "relevance": score,
                })
            })
            .collect();
        Ok(json!({"memories": rows, "count": rows.len()}))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use fb_tickets::models::{Ticket, TicketType};
    use fb_tickets::storage::{open_store, StorageBackend};

    async fn context(dir: &tempfile::TempDir) -> BuiltinToolContext {
        BuiltinToolContext {
            tickets: open_store(StorageBackend::Json, dir.path().join("tickets.json"))
                .await
                .unwrap(),
            budgets: Arc::new(BudgetManager::new(10_000, 3)),
            memory_index: Arc::new(Mutex::new(
                MemoryManager::new(dir.path().join("memory")).await.unwrap(),
            )),
        }
    }

    #[tokio::test]
    async fn builtins_register_into_core_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let mut registry = ToolRegistry::new(60);
        register_builtin_tools(&mut registry, &ctx);

        for name in [
            "list_tickets",
            "claim_ticket",
            "ticket_stats",
            "budget_status",
            "recall_memories",
        ] {
            assert!(registry.is_loaded(name), "{name} should be loaded");
        }
    }

    #[tokio::test]
    async fn list_and_claim_through_tools() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let ticket = ctx
            .tickets
            .create(Ticket::new("tool work", TicketType::Task, TicketPriority::High))
            .await
            .unwrap();

        let mut registry = ToolRegistry::new(60);
        register_builtin_tools(&mut registry, &ctx);

        let listed = registry
            .execute("list_tickets", json!({"status": "open"}), None)
            .await;
        assert!(listed.success);
        assert_eq!(listed.data.unwrap()["count"], 1);

        let claimed = registry
            .execute(
                "claim_ticket",
                json!({"ticket_id": ticket.id, "agent": "agent-a"}),
                None,
            )
            .await;
        assert!(claimed.success);
        assert_eq!(claimed.data.unwrap()["claimed"], true);

        let stats = registry.execute("ticket_stats", json!({}), None).await;
        let data = stats.data.unwrap();
        assert_eq!(data["by_status"]["in_progress"], 1);
        assert_eq!(data["by_status"]["open"], 0);
        assert_eq!(data["by_priority"]["high"], 1);
    }

    #[tokio::test]
    async fn budget_status_reports_session_and_totals() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        ctx.budgets.create_budget("agent-a", "s1", None);
        ctx.budgets.consume("s1", 7_000);

        let mut registry = ToolRegistry::new(60);
        register_builtin_tools(&mut registry, &ctx);

        let session = registry
            .execute("budget_status", json!({"session_id": "s1"}), None)
            .await;
        let data = session.data.unwrap();
        assert_eq!(data["used"], 7_000);
        assert_eq!(data["should_handoff"], true);
        assert_eq!(data["must_handoff"], false);

        let totals = registry.execute("budget_status", json!({}), None).await;
        assert_eq!(totals.data.unwrap()["active_sessions"], 1);

        let unknown = registry
            .execute("budget_status", json!({"session_id": "ghost"}), None)
            .await;
        assert!(!unknown.success);
    }

    #[tokio::test]
    async fn recall_memories_returns_scored_rows() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        {
            let mut index = ctx.memory_index.lock().await;
            index
                .save_ticket_memory(&fb_memory::models::TicketMemory {
                    ticket_id: "1".into(),
                    app: "webapp".into(),
                    app_version: None,
                    title: "pool exhaustion".into(),
                    problem_summary: "pool drained".into(),
                    solution_summary: "raise pool size".into(),
                    files_modified: vec![],
                    keywords: vec!["pool".into()],
                    ticket_type: "bug".into(),
                    resolved_date: chrono::Utc::now().format("%Y-%m-%d").to_string(),
                    access_count: 0,
                    last_accessed: None,
                    relevance_score: 1.0,
                })
                .await
                .unwrap();
        }

        let mut registry = ToolRegistry::new(60);
        register_builtin_tools(&mut registry, &ctx);

        let result = registry
            .execute("recall_memories", json!({"query": "pool"}), None)
            .await;
        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["count"], 1);
        assert_eq!(data["memories"][0]["ticket_id"], "1");
    }
}
