use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::websocket::SubscriptionType;

// ---------------------------------------------------------------------------
// EventType
// ---------------------------------------------------------------------------

/// Closed vocabulary of operational events, shared by the WebSocket and
/// webhook paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "ticket.created")]
    TicketCreated,
    #[serde(rename = "ticket.claimed")]
    TicketClaimed,
    #[serde(rename = "ticket.updated")]
    TicketUpdated,
    #[serde(rename = "ticket.completed")]
    TicketCompleted,
    #[serde(rename = "ticket.approved")]
    TicketApproved,
    #[serde(rename = "ticket.rejected")]
    TicketRejected,
    #[serde(rename = "ticket.closed")]
    TicketClosed,
    #[serde(rename = "ticket.comment_added")]
    TicketCommentAdded,
    #[serde(rename = "agent.started")]
    AgentStarted,
    #[serde(rename = "agent.stopped")]
    AgentStopped,
    #[serde(rename = "agent.error")]
    AgentError,
    #[serde(rename = "code_review.started")]
    CodeReviewStarted,
    #[serde(rename = "code_review.passed")]
    CodeReviewPassed,
    #[serde(rename = "code_review.failed")]
    CodeReviewFailed,
    #[serde(rename = "build.started")]
    BuildStarted,
    #[serde(rename = "build.completed")]
    BuildCompleted,
    #[serde(rename = "build.failed")]
    BuildFailed,
    #[serde(rename = "directive.hold")]
    DirectiveHold,
    #[serde(rename = "directive.clearance")]
    DirectiveClearance,
    #[serde(rename = "ops_log.entry")]
    OpsLogEntry,
    #[serde(rename = "system.error")]
    SystemError,
}

impl EventType {
    pub const ALL: [EventType; 21] = [
        EventType::TicketCreated,
        EventType::TicketClaimed,
        EventType::TicketUpdated,
        EventType::TicketCompleted,
        EventType::TicketApproved,
        EventType::TicketRejected,
        EventType::TicketClosed,
        EventType::TicketCommentAdded,
        EventType::AgentStarted,
        EventType::AgentStopped,
        EventType::AgentError,
        EventType::CodeReviewStarted,
        EventType::CodeReviewPassed,
        EventType::CodeReviewFailed,
        EventType::BuildStarted,
        EventType::BuildCompleted,
        EventType::BuildFailed,
        EventType::DirectiveHold,
        EventType::DirectiveClearance,
        EventType::OpsLogEntry,
        EventType::SystemError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TicketCreated => "ticket.created",
            EventType::TicketClaimed => "ticket.claimed",
            EventType::TicketUpdated => "ticket.updated",
            EventType::TicketCompleted => "ticket.completed",
            EventType::TicketApproved => "ticket.approved",
            EventType::TicketRejected => "ticket.rejected",
            EventType::TicketClosed => "ticket.closed",
            EventType::TicketCommentAdded => "ticket.comment_added",
            EventType::AgentStarted => "agent.started",
            EventType::AgentStopped => "agent.stopped",
            EventType::AgentError => "agent.error",
            EventType::CodeReviewStarted => "code_review.started",
            EventType::CodeReviewPassed => "code_review.passed",
            EventType::CodeReviewFailed => "code_review.failed",
            EventType::BuildStarted => "build.started",
            EventType::BuildCompleted => "build.completed",
            EventType::BuildFailed => "build.failed",
            EventType::DirectiveHold => "directive.hold",
            EventType::DirectiveClearance => "directive.clearance",
            EventType::OpsLogEntry => "ops_log.entry",
            EventType::SystemError => "system.error",
        }
    }

    /// Which subscription types receive this event over WebSockets.
    pub fn subscription_targets(&self) -> &'static [SubscriptionType] {
        match self {
            EventType::TicketCreated
            | EventType::TicketClaimed
            | EventType::TicketUpdated
            | EventType::TicketCompleted
            | EventType::TicketApproved
            | EventType::TicketRejected
            | EventType::TicketClosed
            | EventType::TicketCommentAdded => {
                &[SubscriptionType::All, SubscriptionType::Tickets]
            }
            EventType::AgentStarted | EventType::AgentStopped | EventType::AgentError => {
                &[SubscriptionType::All, SubscriptionType::Agents]
            }
            EventType::DirectiveHold | EventType::DirectiveClearance => {
                &[SubscriptionType::All, SubscriptionType::Directives]
            }
            EventType::OpsLogEntry => &[SubscriptionType::All, SubscriptionType::OpsLog],
            _ => &[SubscriptionType::All],
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// One operational event: a typed name, a JSON payload, and a UTC stamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            payload,
            timestamp: Utc::now(),
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
    fn event_type_serde_uses_dotted_names() {
        let json = serde_json::to_string(&EventType::TicketCommentAdded).unwrap();
        assert_eq!(json, "\"ticket.comment_added\"");
        let back: EventType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EventType::TicketCommentAdded);
    }

    #[test]
    fn from_str_round_trips_whole_vocabulary() {
        for event in EventType::ALL {
            assert_eq!(event.as_str().parse::<EventType>().unwrap(), event);
        }
        assert!("ticket.exploded".parse::<EventType>().is_err());
    }

    #[test]
    fn ticket_events_target_tickets_subscription() {
        let targets = EventType::TicketCreated.subscription_targets();
        assert!(targets.contains(&SubscriptionType::All));
        assert!(targets.contains(&SubscriptionType::Tickets));
        assert!(!targets.contains(&SubscriptionType::Agents));
    }

    #[test]
    fn build_events_only_target_all() {
        assert_eq!(
            EventType::BuildFailed.subscription_targets(),
            &[SubscriptionType::All]
        );
    }
}
