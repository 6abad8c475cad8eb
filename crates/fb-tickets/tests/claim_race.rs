//! Concurrency tests for the atomic claim primitive: of any number of
//! agents racing for the same open ticket, exactly one wins, on both
//! storage backends.

use std::sync::Arc;

use fb_tickets::models::{Ticket, TicketPriority, TicketStatus, TicketType};
use fb_tickets::storage::{open_store, ListFilter, StorageBackend, TicketStore};

async fn run_claim_race(store: Arc<dyn TicketStore>) {
    let ticket = store
        .create(Ticket::new(
            "contested ticket",
            TicketType::Task,
            TicketPriority::High,
        ))
        .await
        .unwrap();

    let contenders = ["A", "B", "C", "D", "E", "F", "G", "H"];
    let mut handles = Vec::new();
    for agent in contenders {
        let store = Arc::clone(&store);
        let id = ticket.id.clone();
        handles.push(tokio::spawn(async move {
            store.claim(&id, agent).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one claim must succeed");

    let after = store.get(&ticket.id).await.unwrap().unwrap();
    assert_eq!(after.status, TicketStatus::InProgress);
    let assignee = after.assigned_to.expect("winner recorded");
    assert!(contenders.contains(&assignee.as_str()));
    assert!(after.started_at.is_some());

    // No further changes: subsequent claims fail and leave state alone.
    assert!(!store.claim(&ticket.id, "Z").await.unwrap());
    let unchanged = store.get(&ticket.id).await.unwrap().unwrap();
    assert_eq!(unchanged.assigned_to.as_deref(), Some(assignee.as_str()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn claim_race_json_backend() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(StorageBackend::Json, dir.path().join("tickets.json"))
        .await
        .unwrap();
    run_claim_race(store).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn claim_race_sqlite_backend() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(StorageBackend::Sqlite, dir.path().join("tickets.db"))
        .await
        .unwrap();
    run_claim_race(store).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_claims_across_many_tickets() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(StorageBackend::Sqlite, dir.path().join("tickets.db"))
        .await
        .unwrap();

    for _ in 0..10 {
        store
            .create(Ticket::new("work", TicketType::Task, TicketPriority::Medium))
            .await
            .unwrap();
    }

    // Two agents sweep the whole backlog concurrently.
    let sweep = |agent: &'static str| {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let mut claimed = 0;
            let open = store
                .list(ListFilter::new().status(TicketStatus::Open))
                .await
                .unwrap();
            for ticket in open {
                if store.claim(&ticket.id, agent).await.unwrap() {
                    claimed += 1;
                }
            }
            claimed
        })
    };

    let (a, b) = tokio::join!(sweep("A"), sweep("B"));
    assert_eq!(a.unwrap() + b.unwrap(), 10);
    assert_eq!(
        store.count(Some(TicketStatus::InProgress), None).await.unwrap(),
        10
    );
    assert_eq!(store.count(Some(TicketStatus::Open), None).await.unwrap(), 0);

    // A list never yields duplicates.
    let all = store.list(ListFilter::new()).await.unwrap();
    let mut ids: Vec<&str> = all.iter().map(|t| t.id.as_str()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), all.len());
}
