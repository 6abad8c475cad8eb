//! Composition root for the fastband orchestration core.
//!
//! The [`Orchestrator`] constructs and wires every component at startup —
//! budgets, tiered memory, the memory index, handoffs, the ticket store,
//! the tool registry, the event bus, the WebSocket hub, and the webhook
//! dispatcher — and owns no domain state of its own. All global state from
//! the reference design lives in explicitly constructed components here.

pub mod builtin_tools;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use fb_context::codebase::{CodebaseAnalyzer, CodebaseContextService};
use fb_core::config::Config;
use fb_core::paths::ProjectPaths;
use fb_hub::event::{Event, EventType};
use fb_hub::event_bus::EventBus;
use fb_hub::ops_log::{spawn_bus_recorder, OpsLog};
use fb_hub::webhook_service::{spawn_bus_forwarder, WebhookService, WebhookServiceConfig};
use fb_hub::websocket::WsHub;
use fb_memory::budget::BudgetManager;
use fb_memory::handoff::{
    HandoffManager, HandoffPacket, HandoffPriority, HandoffReason, TicketHandoffContext,
};
use fb_memory::manager::MemoryManager;
use fb_memory::models::TicketSnapshot;
use fb_memory::tiers::{CloseStats, SharedTierLimits, TieredMemoryManager, TieredMemoryStore};
use fb_tickets::models::{Ticket, TicketStatus};
use fb_tickets::storage::{open_store, StorageBackend, TicketStore};
use fb_tools::registry::ToolRegistry;
use fb_tools::tool::ToolResult;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("config error: {0}")]
    Config(#[from] fb_core::config::ConfigError),
    #[error("ticket store error: {0}")]
    Tickets(#[from] fb_tickets::storage::TicketStoreError),
    #[error("memory error: {0}")]
    Memory(#[from] fb_memory::manager::MemoryError),
    #[error("handoff error: {0}")]
    Handoff(#[from] fb_memory::handoff::HandoffError),
    #[error("webhook error: {0}")]
    Webhooks(#[from] fb_hub::webhook_service::WebhookError),
    #[error("unknown session: {0}")]
    UnknownSession(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of recording token usage against a session budget.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenOutcome {
    /// Whether the tokens were granted (possibly after an expansion).
    pub consumed: bool,
    /// Whether the budget expanded to satisfy the request.
    pub expanded: bool,
    /// Set when the budget has crossed a handoff threshold.
    pub handoff_needed: Option<(HandoffReason, HandoffPriority)>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Wires the orchestration core together and drives cross-component flows:
/// session lifecycle, budget-triggered handoffs, ticket lifecycle events,
/// and bus fan-out to WebSockets and webhooks.
pub struct Orchestrator {
    budgets: Arc<BudgetManager>,
    memory: Arc<TieredMemoryManager>,
    memory_index: Arc<Mutex<MemoryManager>>,
    handoffs: Arc<HandoffManager>,
    tickets: Arc<dyn TicketStore>,
    tools: Arc<RwLock<ToolRegistry>>,
    bus: EventBus,
    hub: Arc<WsHub>,
    webhooks: Arc<WebhookService>,
    ops_log: OpsLog,
    sessions: Mutex<HashMap<String, TieredMemoryStore>>,
    forwarders: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Orchestrator {
    /// Construct the full core under `<project_root>/.fastband/`, reading
    /// `config.yaml` when present.
    pub async fn new(project_root: impl AsRef<Path>) -> Result<Self> {
        let config = Config::load(&project_root)?;
        let paths = ProjectPaths::new(&project_root);

        let budgets = Arc::new(BudgetManager::new(
            config.memory.base_allocation,
            config.memory.max_expansions,
        ));
        let memory = Arc::new(TieredMemoryManager::new(
            Arc::clone(&budgets),
            SharedTierLimits::default(),
        ));
        let memory_index = Arc::new(Mutex::new(MemoryManager::new(paths.memory_dir()).await?));
        let handoffs = Arc::new(HandoffManager::new(paths.handoffs_dir()).await?);

        let backend = StorageBackend::from_config(&config.tickets.backend);
        let tickets = open_store(backend, paths.tickets_file(&config.tickets.backend)).await?;

        let tools = Arc::new(RwLock::new(ToolRegistry::new(config.tools.max_active)));
        let bus = EventBus::new();
        let hub = Arc::new(WsHub::new(config.hub.max_connections, config.hub.max_per_ip));

        let mut webhook_config = WebhookServiceConfig::new(paths.webhooks_file());
        webhook_config.timeout = Duration::from_secs(config.webhooks.timeout_seconds);
        webhook_config.max_retries = config.webhooks.max_retries;
        let webhooks = Arc::new(WebhookService::new(webhook_config)?);

        Ok(Self {
            budgets,
            memory,
            memory_index,
            handoffs,
            tickets,
            tools,
            bus,
            hub,
            webhooks,
            ops_log: OpsLog::new(1000),
            sessions: Mutex::new(HashMap::new()),
            forwarders: Mutex::new(Vec::new()),
        })
    }

    /// Register and load the built-in core tools against this core's
    /// components.
    pub async fn register_builtin_tools(&self) {
        let ctx = builtin_tools::BuiltinToolContext {
            tickets: Arc::clone(&self.tickets),
            budgets: Arc::clone(&self.budgets),
            memory_index: Arc::clone(&self.memory_index),
        };
        let mut tools = self.tools.write().await;
        builtin_tools::register_builtin_tools(&mut tools, &ctx);
    }

    /// Start background plumbing: webhook dispatch, bus→hub forwarding,
    /// and the WebSocket heartbeat.
    pub async fn start(&self) -> Result<()> {
        self.webhooks.start().await?;

        let hub = Arc::clone(&self.hub);
        let rx = self.bus.subscribe();
        let hub_forwarder = tokio::spawn(async move {
            while let Ok(event) = rx.recv_async().await {
                hub.broadcast(&event).await;
            }
        });
        let webhook_forwarder = spawn_bus_forwarder(Arc::clone(&self.webhooks), &self.bus);
        let ops_recorder = spawn_bus_recorder(self.ops_log.clone(), &self.bus);

        Arc::clone(&self.hub).start_heartbeat().await;

        let mut forwarders = self.forwarders.lock().await;
        forwarders.push(hub_forwarder);
        forwarders.push(webhook_forwarder);
        forwarders.push(ops_recorder);
        info!("orchestrator started");
        Ok(())
    }

    /// Stop background plumbing. In-flight deliveries finish; forwarders
    /// are aborted after the components stop accepting work.
    pub async fn shutdown(&self) {
        self.hub.stop_heartbeat().await;
        self.webhooks.stop().await;
        for task in self.forwarders.lock().await.drain(..) {
            task.abort();
        }
        info!("orchestrator stopped");
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Start an agent session: a persisted session context, a budget, and
    /// a tiered memory store. Publishes `agent.started`.
    pub async fn start_session(&self, agent_name: &str) -> Result<String> {
        let context = {
            let index = self.memory_index.lock().await;
            index.create_session(agent_name, None).await?
        };
        let store = self.memory.create_store(&context.session_id, agent_name);
        self.sessions
            .lock()
            .await
            .insert(context.session_id.clone(), store);

        self.publish(
            EventType::AgentStarted,
            json!({"agent": agent_name, "session_id": context.session_id}),
        );
        Ok(context.session_id)
    }

    /// Close a session, promoting shareable memory and freeing the budget.
    /// Publishes `agent.stopped`. Unknown sessions return `None`.
    pub async fn end_session(&self, session_id: &str) -> Option<CloseStats> {
        let store = self.sessions.lock().await.remove(session_id)?;
        let stats = self.memory.close_store(store);
        self.publish(EventType::AgentStopped, json!({"session_id": session_id}));
        Some(stats)
    }

    /// Record token usage for a session, expanding the budget when the
    /// initial consume fails, and report whether a handoff is due.
    ///
    /// The budget itself never initiates handoffs; this is the
    /// orchestration point that consults the trigger after every change.
    pub async fn record_token_usage(&self, session_id: &str, tokens: u64) -> TokenOutcome {
        let mut consumed = self.budgets.consume(session_id, tokens);
        let mut expanded = false;
        if !consumed && self.budgets.try_expand(session_id) {
            expanded = true;
            consumed = self.budgets.consume(session_id, tokens);
        }

        let handoff_needed = self.budgets.get_budget(session_id).and_then(|budget| {
            let budget = budget.lock().expect("budget lock poisoned");
            self.handoffs.check_handoff_needed(&budget)
        });

        TokenOutcome {
            consumed,
            expanded,
            handoff_needed,
        }
    }

    /// Package and persist a signed handoff packet for a session.
    pub async fn initiate_handoff(
        &self,
        session_id: &str,
        reason: HandoffReason,
        priority: HandoffPriority,
        ticket: TicketHandoffContext,
        notes: &str,
        target_agent: Option<&str>,
    ) -> Result<HandoffPacket> {
        let sessions = self.sessions.lock().await;
        let store = sessions.get(session_id);
        let agent_name = store
            .map(|s| {
                s.budget()
                    .lock()
                    .expect("budget lock poisoned")
                    .agent_name
                    .clone()
            })
            .ok_or_else(|| OrchestratorError::UnknownSession(session_id.to_string()))?;

        let packet = self.handoffs.create_handoff_packet(
            &agent_name,
            session_id,
            reason,
            priority,
            ticket,
            store,
            notes,
            target_agent,
        )?;
        drop(sessions);

        self.handoffs.store_packet(&packet, false).await?;
        Ok(packet)
    }

    /// Accept a pending handoff for an agent. Failures (unauthorized,
    /// tampered, missing) surface as `None`.
    pub async fn accept_handoff(
        &self,
        packet_id: &str,
        agent_name: &str,
        access_token: Option<&str>,
    ) -> Option<HandoffPacket> {
        self.handoffs
            .accept_handoff(packet_id, agent_name, access_token)
            .await
    }

    // -----------------------------------------------------------------------
    // Tickets
    // -----------------------------------------------------------------------

    /// Create a ticket and publish `ticket.created`.
    pub async fn create_ticket(&self, ticket: Ticket) -> Result<Ticket> {
        let created = self.tickets.create(ticket).await?;
        self.publish(
            EventType::TicketCreated,
            json!({"ticket_id": created.id, "title": created.title}),
        );
        Ok(created)
    }

    /// Atomically claim a ticket for an agent; publishes `ticket.claimed`
    /// on the winning claim only.
    pub async fn claim_ticket(&self, ticket_id: &str, agent_name: &str) -> Result<bool> {
        let claimed = self.tickets.claim(ticket_id, agent_name).await?;
        if claimed {
            self.publish(
                EventType::TicketClaimed,
                json!({"ticket_id": ticket_id, "agent": agent_name}),
            );
        }
        Ok(claimed)
    }

    /// Resolve an in-progress ticket, feed it into the ticket memory
    /// index, and publish `ticket.completed`.
    pub async fn resolve_ticket(&self, ticket_id: &str, solution_summary: &str) -> Result<bool> {
        let Some(mut ticket) = self.tickets.get(ticket_id).await? else {
            return Ok(false);
        };
        ticket.status = TicketStatus::Resolved;
        ticket.solution_summary = Some(solution_summary.to_string());
        ticket.completed_at = Some(Utc::now());
        if !self.tickets.update(ticket.clone()).await? {
            return Ok(false);
        }

        let snapshot = snapshot_of(&ticket);
        {
            let mut index = self.memory_index.lock().await;
            if let Some(memory) = index.create_memory_from_ticket(&snapshot) {
                if let Err(e) = index.save_ticket_memory(&memory).await {
                    warn!(ticket_id, error = %e, "failed to index resolved ticket");
                }
            }
        }

        self.publish(
            EventType::TicketCompleted,
            json!({"ticket_id": ticket_id, "solution": solution_summary}),
        );
        Ok(true)
    }

    /// Close a resolved ticket and publish `ticket.closed`.
    pub async fn close_ticket(&self, ticket_id: &str) -> Result<bool> {
        let Some(mut ticket) = self.tickets.get(ticket_id).await? else {
            return Ok(false);
        };
        ticket.status = TicketStatus::Closed;
        if !self.tickets.update(ticket).await? {
            return Ok(false);
        }
        self.publish(EventType::TicketClosed, json!({"ticket_id": ticket_id}));
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Tools
    // -----------------------------------------------------------------------

    /// Execute a loaded tool. Tool failures become failed results and a
    /// `system.error` event; they are never swallowed silently.
    pub async fn execute_tool(
        &self,
        name: &str,
        params: serde_json::Value,
        timeout: Option<Duration>,
    ) -> ToolResult {
        let result = {
            let tools = self.tools.read().await;
            tools.execute(name, params, timeout).await
        };
        if !result.success {
            self.publish(
                EventType::SystemError,
                json!({"tool": name, "error": result.error}),
            );
        }
        result
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    fn publish(&self, event_type: EventType, payload: serde_json::Value) {
        self.bus.publish(Event::new(event_type, payload));
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn hub(&self) -> &Arc<WsHub> {
        &self.hub
    }

    pub fn webhooks(&self) -> &Arc<WebhookService> {
        &self.webhooks
    }

    pub fn ops_log(&self) -> &OpsLog {
        &self.ops_log
    }

    pub fn tickets(&self) -> &Arc<dyn TicketStore> {
        &self.tickets
    }

    pub fn tools(&self) -> &Arc<RwLock<ToolRegistry>> {
        &self.tools
    }

    pub fn budgets(&self) -> &Arc<BudgetManager> {
        &self.budgets
    }

    pub fn handoffs(&self) -> &Arc<HandoffManager> {
        &self.handoffs
    }

    pub fn memory(&self) -> &Arc<TieredMemoryManager> {
        &self.memory
    }

    pub fn memory_index(&self) -> &Arc<Mutex<MemoryManager>> {
        &self.memory_index
    }

    /// Build a read-through context facade over an external analyzer.
    pub fn context_service(&self, analyzer: Arc<dyn CodebaseAnalyzer>) -> CodebaseContextService {
        CodebaseContextService::new(analyzer)
    }
}

/// Value-level snapshot of a ticket for the memory index.
fn snapshot_of(ticket: &Ticket) -> TicketSnapshot {
    TicketSnapshot {
        ticket_id: ticket.id.clone(),
        app: ticket.app.clone().unwrap_or_default(),
        app_version: ticket.app_version.clone(),
        title: ticket.title.clone(),
        description: ticket.description.clone(),
        status: ticket.status.as_str().to_string(),
        ticket_type: ticket.ticket_type.as_str().to_string(),
        problem_summary: ticket.problem_summary.clone(),
        solution_summary: ticket.solution_summary.clone(),
        resolution: ticket.resolution.clone(),
        files_modified: Vec::new(),
        resolved_date: ticket
            .completed_at
            .map(|at| at.format("%Y-%m-%d").to_string()),
    }
}
