//! Read-only access to service listings owned by the marketplace.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// The owner provides the service; whoever expresses interest pays.
    Offer,
    /// The owner wants the service; whoever expresses interest provides it.
    Need,
}

/// A service listing as supplied by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceListing {
    pub id: String,
    pub owner_id: String,
    pub kind: ServiceKind,
    pub hours: Decimal,
    #[serde(default)]
    pub title: String,
}

impl ServiceListing {
    /// `(provider_id, receiver_id)` for a handshake opened by `requester_id`.
    pub fn parties(&self, requester_id: &str) -> (String, String) {
        match self.kind {
            ServiceKind::Offer => (self.owner_id.clone(), requester_id.to_string()),
            ServiceKind::Need => (requester_id.to_string(), self.owner_id.clone()),
        }
    }
}

/// Lookup port for service listings.
#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    async fn get_service(&self, service_id: &str) -> Option<ServiceListing>;
}

/// Catalog backed by a fixed set of listings, typically loaded from config.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    listings: BTreeMap<String, ServiceListing>,
}

impl InMemoryCatalog {
    pub fn new(listings: impl IntoIterator<Item = ServiceListing>) -> Self {
        Self {
            listings: listings
                .into_iter()
                .map(|l| (l.id.clone(), l))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }
}

#[async_trait]
impl ServiceCatalog for InMemoryCatalog {
    async fn get_service(&self, service_id: &str) -> Option<ServiceListing> {
        self.listings.get(service_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(kind: ServiceKind) -> ServiceListing {
        ServiceListing {
            id: "svc-1".into(),
            owner_id: "bob".into(),
            kind,
            hours: Decimal::from(2),
            title: "Guitar lesson".into(),
        }
    }

    #[test]
    fn offer_requester_is_receiver() {
        let (provider, receiver) = listing(ServiceKind::Offer).parties("alice");
        assert_eq!(provider, "bob");
        assert_eq!(receiver, "alice");
    }

    #[test]
    fn need_requester_is_provider() {
        let (provider, receiver) = listing(ServiceKind::Need).parties("alice");
        assert_eq!(provider, "alice");
        assert_eq!(receiver, "bob");
    }

    #[tokio::test]
    async fn unknown_service_is_none() {
        let catalog = InMemoryCatalog::new([listing(ServiceKind::Offer)]);
        assert!(catalog.get_service("svc-1").await.is_some());
        assert!(catalog.get_service("svc-2").await.is_none());
    }
}
