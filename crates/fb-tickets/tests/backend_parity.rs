//! Both storage backends satisfy the same contract: run the same workload
//! against each and compare observable behavior.

use std::sync::Arc;

use fb_tickets::models::{AgentRecord, Ticket, TicketPriority, TicketStatus, TicketType};
use fb_tickets::storage::{open_store, ListFilter, StorageBackend, TicketStore};

async fn stores() -> (Vec<(&'static str, Arc<dyn TicketStore>)>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let json = open_store(StorageBackend::Json, dir.path().join("tickets.json"))
        .await
        .unwrap();
    let sqlite = open_store(StorageBackend::Sqlite, dir.path().join("tickets.db"))
        .await
        .unwrap();
    (vec![("json", json), ("sqlite", sqlite)], dir)
}

#[tokio::test]
async fn crud_behaves_identically() {
    let (stores, _dir) = stores().await;
    for (backend, store) in stores {
        let mut ticket = Ticket::new("parity check", TicketType::Bug, TicketPriority::High);
        ticket.description = "same everywhere".into();
        let created = store.create(ticket).await.unwrap();
        assert_eq!(created.id, "1", "{backend}: first id");

        let loaded = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(loaded, created, "{backend}: get equals create");

        let mut updated = loaded.clone();
        updated.notes = "reviewed".into();
        assert!(store.update(updated).await.unwrap(), "{backend}: update");
        let after = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(after.notes, "reviewed", "{backend}: notes persisted");
        assert!(after.updated_at > created.updated_at, "{backend}: updated_at advanced");

        assert!(store.delete(&created.id).await.unwrap(), "{backend}: delete");
        assert!(!store.delete(&created.id).await.unwrap(), "{backend}: double delete");
        assert!(store.get(&created.id).await.unwrap().is_none(), "{backend}: gone");
    }
}

#[tokio::test]
async fn listing_and_counting_agree() {
    let (stores, _dir) = stores().await;
    for (backend, store) in stores {
        for (title, priority) in [
            ("low one", TicketPriority::Low),
            ("critical one", TicketPriority::Critical),
            ("medium one", TicketPriority::Medium),
        ] {
            store
                .create(Ticket::new(title, TicketType::Task, priority))
                .await
                .unwrap();
        }
        let claimed = store
            .create(Ticket::new("claimed one", TicketType::Task, TicketPriority::High))
            .await
            .unwrap();
        store.claim(&claimed.id, "agent-a").await.unwrap();

        let all = store.list(ListFilter::new()).await.unwrap();
        let titles: Vec<&str> = all.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(
            titles,
            ["critical one", "claimed one", "medium one", "low one"],
            "{backend}: priority order"
        );

        assert_eq!(store.count(None, None).await.unwrap(), 4, "{backend}");
        assert_eq!(
            store.count(Some(TicketStatus::Open), None).await.unwrap(),
            3,
            "{backend}"
        );
        assert_eq!(
            store
                .count(None, Some(TicketPriority::Critical))
                .await
                .unwrap(),
            1,
            "{backend}"
        );

        let found = store.search("medium", None).await.unwrap();
        assert_eq!(found.len(), 1, "{backend}: search");
    }
}

#[tokio::test]
async fn claim_and_state_machine_agree() {
    let (stores, _dir) = stores().await;
    for (backend, store) in stores {
        let ticket = store
            .create(Ticket::new("lifecycle", TicketType::Bug, TicketPriority::Medium))
            .await
            .unwrap();

        assert!(store.claim(&ticket.id, "agent-a").await.unwrap(), "{backend}");
        assert!(!store.claim(&ticket.id, "agent-b").await.unwrap(), "{backend}");

        // Block and unblock.
        let mut t = store.get(&ticket.id).await.unwrap().unwrap();
        t.status = TicketStatus::Blocked;
        assert!(store.update(t).await.unwrap(), "{backend}: block");
        let mut t = store.get(&ticket.id).await.unwrap().unwrap();
        t.status = TicketStatus::InProgress;
        assert!(store.update(t).await.unwrap(), "{backend}: unblock");

        // Resolve, reopen, resolve again, close.
        let mut t = store.get(&ticket.id).await.unwrap().unwrap();
        t.status = TicketStatus::Resolved;
        assert!(store.update(t).await.unwrap(), "{backend}: resolve");
        let mut t = store.get(&ticket.id).await.unwrap().unwrap();
        t.status = TicketStatus::InProgress;
        assert!(store.update(t).await.unwrap(), "{backend}: reopen");
        let mut t = store.get(&ticket.id).await.unwrap().unwrap();
        t.status = TicketStatus::Resolved;
        store.update(t).await.unwrap();
        let mut t = store.get(&ticket.id).await.unwrap().unwrap();
        t.status = TicketStatus::Closed;
        assert!(store.update(t).await.unwrap(), "{backend}: close");

        // Closed is terminal.
        let mut t = store.get(&ticket.id).await.unwrap().unwrap();
        t.status = TicketStatus::Open;
        assert!(store.update(t).await.is_err(), "{backend}: closed is terminal");
    }
}

#[tokio::test]
async fn agents_agree() {
    let (stores, _dir) = stores().await;
    for (backend, store) in stores {
        store.save_agent(AgentRecord::new("agent-a")).await.unwrap();
        let mut inactive = AgentRecord::new("agent-b");
        inactive.active = false;
        store.save_agent(inactive).await.unwrap();

        assert_eq!(store.list_agents(true).await.unwrap().len(), 1, "{backend}");
        assert_eq!(store.list_agents(false).await.unwrap().len(), 2, "{backend}");
        let a = store.get_agent("agent-a").await.unwrap().unwrap();
        assert_eq!(a.agent_type, "ai", "{backend}");
    }
}
