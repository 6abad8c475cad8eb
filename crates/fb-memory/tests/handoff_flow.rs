//! End-to-end flow: a session consumes tokens until the budget crosses its
//! critical threshold, the orchestration layer packages a handoff, and the
//! next agent accepts it.

use std::sync::Arc;

use fb_memory::budget::BudgetManager;
use fb_memory::handoff::{
    HandoffManager, HandoffPriority, HandoffReason, TicketHandoffContext,
};
use fb_memory::tiers::{MemoryItem, MemoryTier, SharedTierLimits, TieredMemoryManager};

#[tokio::test]
async fn budget_driven_handoff() {
    let dir = tempfile::tempdir().unwrap();
    let budgets = Arc::new(BudgetManager::new(10_000, 3));
    let memory = TieredMemoryManager::new(Arc::clone(&budgets), SharedTierLimits::default());
    let handoffs = HandoffManager::new(dir.path().join("handoffs")).await.unwrap();

    let mut store = memory.create_store("sess-1", "agent-a");

    // Work the session up to 7999 used tokens.
    assert!(store.store(MemoryItem::new("ctx-1", MemoryTier::Hot, "current diff", 7_000)));
    assert!(store.store(MemoryItem::new("ctx-2", MemoryTier::Hot, "test output", 999)));
    assert!(store.store(MemoryItem::new("ref-1", MemoryTier::Warm, "api notes", 50)));

    {
        let budget = store.budget().lock().unwrap();
        assert_eq!(
            handoffs.check_handoff_needed(&budget),
            Some((HandoffReason::BudgetWarning, HandoffPriority::Normal))
        );
    }

    // Two more tokens push usage to 8001: critical.
    assert!(budgets.consume("sess-1", 2));
    let (reason, priority) = {
        let budget = store.budget().lock().unwrap();
        assert_eq!(budget.used, 8_001);
        assert!(budget.should_handoff());
        assert!(budget.must_handoff());
        handoffs.check_handoff_needed(&budget).unwrap()
    };
    assert_eq!(reason, HandoffReason::BudgetCritical);
    assert_eq!(priority, HandoffPriority::Immediate);

    let packet = handoffs
        .create_handoff_packet(
            "agent-a",
            "sess-1",
            reason,
            priority,
            TicketHandoffContext {
                ticket_id: "1".into(),
                status: "in_progress".into(),
                summary: "migrate login flow".into(),
                pending_tasks: vec!["update session middleware".into()],
                ..TicketHandoffContext::default()
            },
            Some(&store),
            "pick up from the failing integration test",
            None,
        )
        .unwrap();

    assert_eq!(packet.budget_used, 8_001);
    assert_eq!(packet.hot_tokens, 7_999);
    assert_eq!(packet.warm_references, vec!["ref-1".to_string()]);
    assert!(packet.hot_context.contains("current diff"));

    handoffs.store_packet(&packet, false).await.unwrap();

    // The retrieved packet is field-for-field identical after verification.
    let retrieved = handoffs.retrieve_packet(&packet.packet_id, true).await.unwrap();
    assert_eq!(retrieved, packet);

    // The next agent accepts with the access token and gets onboarded.
    let accepted = handoffs
        .accept_handoff(&packet.packet_id, "agent-b", Some(&packet.access_token))
        .await
        .unwrap();
    assert!(accepted.onboarding_context().contains("migrate login flow"));

    let stats = handoffs.stats().await;
    assert_eq!(stats.pending_handoffs, 0);
    assert_eq!(stats.completed_handoffs, 1);

    let close = memory.close_store(store);
    assert!(close.budget_summary.is_some());
    let summary = close.budget_summary.unwrap();
    assert_eq!(summary.peak, 8_001);
}
