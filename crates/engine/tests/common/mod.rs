//! Shared fixture for the engine integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use rust_decimal::Decimal;
use timebank_engine::{
    AccountRecord, Actor, BroadcastSink, DomainEvent, Engine, InMemoryCatalog, Policy, Role,
    ServiceKind, ServiceListing,
};
use timebank_storage::MemoryStorage;
use tokio::sync::broadcast;

pub const OFFER: &str = "svc-offer";
pub const NEED: &str = "svc-need";

pub struct Harness {
    pub engine: Arc<Engine<MemoryStorage>>,
    pub alice: Actor,
    pub bob: Actor,
    pub carol: Actor,
    pub admin: Actor,
    pub events: broadcast::Receiver<DomainEvent>,
}

/// Alice has 3h, Bob and Carol none. Bob offers a 2h service; Alice needs
/// a 1h service.
pub async fn harness() -> Harness {
    harness_with(Policy::default()).await
}

pub async fn harness_with(policy: Policy) -> Harness {
    let catalog = InMemoryCatalog::new([
        ServiceListing {
            id: OFFER.into(),
            owner_id: "bob".into(),
            kind: ServiceKind::Offer,
            hours: Decimal::from(2),
            title: "Bike repair".into(),
        },
        ServiceListing {
            id: NEED.into(),
            owner_id: "alice".into(),
            kind: ServiceKind::Need,
            hours: Decimal::ONE,
            title: "Help moving boxes".into(),
        },
    ]);
    let sink = Arc::new(BroadcastSink::new(64));
    let events = sink.subscribe();
    let engine = Engine::new(Arc::new(MemoryStorage::new()), Arc::new(catalog), policy)
        .with_events(sink);

    for (user, role, balance) in [
        ("alice", Role::Member, 3),
        ("bob", Role::Member, 0),
        ("carol", Role::Member, 0),
        ("admin", Role::Admin, 0),
    ] {
        let seeded = engine
            .seed_account(AccountRecord::new(user, role, Decimal::from(balance)))
            .await
            .unwrap();
        assert!(seeded);
    }

    Harness {
        alice: engine.authenticate("alice").await.unwrap(),
        bob: engine.authenticate("bob").await.unwrap(),
        carol: engine.authenticate("carol").await.unwrap(),
        admin: engine.authenticate("admin").await.unwrap(),
        engine: Arc::new(engine),
        events,
    }
}

impl Harness {
    pub async fn account(&self, user_id: &str) -> AccountRecord {
        self.engine.ledger().get_account(user_id).await.unwrap()
    }

    /// Alice expresses interest in Bob's offer and Bob accepts.
    pub async fn accepted_offer(&self) -> String {
        let handshake = self
            .engine
            .express_interest(&self.alice, OFFER, None)
            .await
            .unwrap();
        self.engine
            .accept(&self.bob, &handshake.id, None)
            .await
            .unwrap();
        handshake.id
    }

    /// Names of the events published so far, in order.
    pub fn drain_events(&mut self) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            names.push(event.name());
        }
        names
    }
}

pub fn hours(n: i64) -> Decimal {
    Decimal::from(n)
}
