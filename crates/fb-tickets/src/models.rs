use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ---------------------------------------------------------------------------
// TicketStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Blocked,
    Resolved,
    Closed,
}

impl TicketStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// The main line is open → in_progress → resolved → closed, with side
    /// branches in_progress ↔ blocked and resolved → in_progress (reopen).
    /// `closed` is terminal.
    pub fn can_transition_to(&self, target: &TicketStatus) -> bool {
        matches!(
            (self, target),
            (TicketStatus::Open, TicketStatus::InProgress)
                | (TicketStatus::InProgress, TicketStatus::Resolved)
                | (TicketStatus::InProgress, TicketStatus::Blocked)
                | (TicketStatus::Blocked, TicketStatus::InProgress)
                | (TicketStatus::Resolved, TicketStatus::Closed)
                | (TicketStatus::Resolved, TicketStatus::InProgress)
        )
    }

    /// Wire/storage string form (`snake_case`).
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::Blocked => "blocked",
            TicketStatus::Resolved => "resolved",
            TicketStatus::Closed => "closed",
        }
    }
}

// ---------------------------------------------------------------------------
// TicketPriority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl TicketPriority {
    /// Total order for list sorting: critical sorts first.
    pub fn sort_order(&self) -> u8 {
        match self {
            TicketPriority::Critical => 0,
            TicketPriority::High => 1,
            TicketPriority::Medium => 2,
            TicketPriority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TicketPriority::Critical => "critical",
            TicketPriority::High => "high",
            TicketPriority::Medium => "medium",
            TicketPriority::Low => "low",
        }
    }
}

// ---------------------------------------------------------------------------
// TicketType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketType {
    Bug,
    Feature,
    Task,
    Enhancement,
    Documentation,
}

impl TicketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketType::Bug => "bug",
            TicketType::Feature => "feature",
            TicketType::Task => "task",
            TicketType::Enhancement => "enhancement",
            TicketType::Documentation => "documentation",
        }
    }
}

// ---------------------------------------------------------------------------
// Ticket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    /// Monotonically assigned by the store; empty until `create`.
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub ticket_type: TicketType,
    pub priority: TicketPriority,
    pub status: TicketStatus,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default = "default_created_by")]
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub app: Option<String>,
    #[serde(default)]
    pub app_version: Option<String>,
    #[serde(default)]
    pub problem_summary: Option<String>,
    #[serde(default)]
    pub solution_summary: Option<String>,
    #[serde(default)]
    pub testing_notes: Option<String>,
}

fn default_created_by() -> String {
    "system".into()
}

impl Ticket {
    pub fn new(title: impl Into<String>, ticket_type: TicketType, priority: TicketPriority) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            title: title.into(),
            description: String::new(),
            ticket_type,
            priority,
            status: TicketStatus::Open,
            assigned_to: None,
            created_by: default_created_by(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            due_date: None,
            labels: BTreeSet::new(),
            notes: String::new(),
            resolution: None,
            app: None,
            app_version: None,
            problem_summary: None,
            solution_summary: None,
            testing_notes: None,
        }
    }

    /// Validate the `(status, assigned_to)` pairing: `in_progress` requires
    /// an assignee, `open` requires none.
    pub fn validate_assignment(&self) -> Result<(), String> {
        match (self.status, &self.assigned_to) {
            (TicketStatus::InProgress, None) => {
                Err("in_progress ticket requires an assignee".into())
            }
            (TicketStatus::Open, Some(agent)) => {
                Err(format!("open ticket cannot be assigned to {agent}"))
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// AgentRecord
// ---------------------------------------------------------------------------

/// An agent known to the ticket store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    #[serde(default = "default_true")]
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

fn default_agent_type() -> String {
    "ai".into()
}
fn default_true() -> bool {
    true
}

impl AgentRecord {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            agent_type: default_agent_type(),
            active: true,
            created_at: now,
            last_seen: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_line_transitions() {
        assert!(TicketStatus::Open.can_transition_to(&TicketStatus::InProgress));
        assert!(TicketStatus::InProgress.can_transition_to(&TicketStatus::Resolved));
        assert!(TicketStatus::Resolved.can_transition_to(&TicketStatus::Closed));
    }

    #[test]
    fn side_branches() {
        assert!(TicketStatus::InProgress.can_transition_to(&TicketStatus::Blocked));
        assert!(TicketStatus::Blocked.can_transition_to(&TicketStatus::InProgress));
        assert!(TicketStatus::Resolved.can_transition_to(&TicketStatus::InProgress));
    }

    #[test]
    fn closed_is_terminal() {
        for target in [
            TicketStatus::Open,
            TicketStatus::InProgress,
            TicketStatus::Blocked,
            TicketStatus::Resolved,
        ] {
            assert!(!TicketStatus::Closed.can_transition_to(&target));
        }
    }

    #[test]
    fn skipping_states_is_invalid() {
        assert!(!TicketStatus::Open.can_transition_to(&TicketStatus::Resolved));
        assert!(!TicketStatus::Open.can_transition_to(&TicketStatus::Closed));
        assert!(!TicketStatus::Blocked.can_transition_to(&TicketStatus::Resolved));
    }

    #[test]
    fn priority_total_order() {
        assert!(TicketPriority::Critical.sort_order() < TicketPriority::High.sort_order());
        assert!(TicketPriority::High.sort_order() < TicketPriority::Medium.sort_order());
        assert!(TicketPriority::Medium.sort_order() < TicketPriority::Low.sort_order());
    }

    #[test]
    fn assignment_validation() {
        let mut ticket = Ticket::new("t", TicketType::Bug, TicketPriority::Medium);
        assert!(ticket.validate_assignment().is_ok());

        ticket.assigned_to = Some("agent".into());
        assert!(ticket.validate_assignment().is_err());

        ticket.status = TicketStatus::InProgress;
        assert!(ticket.validate_assignment().is_ok());

        ticket.assigned_to = None;
        assert!(ticket.validate_assignment().is_err());
    }

    #[test]
    fn ticket_roundtrips_through_json() {
        let mut ticket = Ticket::new("Fix login", TicketType::Bug, TicketPriority::High);
        ticket.id = "12".into();
        ticket.labels.insert("auth".into());
        ticket.labels.insert("regression".into());
        let json = serde_json::to_string(&ticket).unwrap();
        let back: Ticket = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ticket);
    }
}
