//! External interfaces (spec §6): capability sets the coordinator consumes
//! but never implements concretely for any specific chain.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::CoordinatorResult;
use crate::types::{ChainEvent, Order, OrderHash};

/// Per-chain escrow operations a resolver or the coordinator invokes.
/// Implementations live outside this crate, one per supported chain; this
/// crate only ever holds a `dyn ChainAdapter`.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn create_src_escrow(&self, order: &Order) -> CoordinatorResult<String>;

    async fn create_dst_escrow(&self, order: &Order) -> CoordinatorResult<String>;

    async fn withdraw(&self, order_hash: &OrderHash, secret: &str) -> CoordinatorResult<String>;

    async fn cancel(&self, order_hash: &OrderHash) -> CoordinatorResult<String>;

    /// Polls or subscribes for finalized events only; non-finalized events
    /// must never reach the coordinator (spec §6).
    async fn poll_events(&self) -> CoordinatorResult<Vec<ChainEvent>>;
}

/// Durable order storage, independent of the in-memory subsystem state
/// (spec §6 "Order Repository"). The coordinator's in-memory maps are the
/// source of truth for live orders; this trait is the persistence boundary
/// used for restart recovery and historical lookups.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn save(&self, order: &Order) -> CoordinatorResult<()>;

    async fn find(&self, order_hash: &OrderHash) -> CoordinatorResult<Option<Order>>;

    async fn list_active(&self) -> CoordinatorResult<Vec<Order>>;

    async fn delete(&self, order_hash: &OrderHash) -> CoordinatorResult<()>;
}

/// Chain-specific signature scheme, consumed to validate an `OrderRequest`
/// before it is admitted (spec §6 "Signature Verifier").
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify(&self, signer: &str, message: &[u8], signature: &[u8]) -> CoordinatorResult<bool>;
}

/// In-memory `OrderRepository`, sufficient for tests and single-process
/// deployments; a durable implementation backed by a real store is expected
/// to replace this at the deployment boundary.
#[derive(Default)]
pub struct InMemoryOrderRepository {
    orders: RwLock<HashMap<OrderHash, Order>>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn save(&self, order: &Order) -> CoordinatorResult<()> {
        self.orders.write().await.insert(order.order_hash.clone(), order.clone());
        Ok(())
    }

    async fn find(&self, order_hash: &OrderHash) -> CoordinatorResult<Option<Order>> {
        Ok(self.orders.read().await.get(order_hash).cloned())
    }

    async fn list_active(&self) -> CoordinatorResult<Vec<Order>> {
        Ok(self.orders.read().await.values().cloned().collect())
    }

    async fn delete(&self, order_hash: &OrderHash) -> CoordinatorResult<()> {
        self.orders.write().await.remove(order_hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuctionParams;
    use chrono::Utc;

    fn sample_order() -> Order {
        Order {
            order_hash: OrderHash("0xabc".into()),
            maker: "maker".into(),
            src_chain_id: 1,
            src_token: "0xsrc".into(),
            making_amount: 1000,
            dst_chain_id: 2,
            dst_token: "0xdst".into(),
            taking_amount: 900,
            receiver: "receiver".into(),
            secret_hash: [0u8; 32],
            auction: AuctionParams::linear(Utc::now(), Utc::now() + chrono::Duration::seconds(60), 1000, 900),
            partial_fill: None,
        }
    }

    #[tokio::test]
    async fn save_then_find_round_trips() {
        let repo = InMemoryOrderRepository::new();
        let order = sample_order();
        repo.save(&order).await.unwrap();
        let found = repo.find(&order.order_hash).await.unwrap().unwrap();
        assert_eq!(found.order_hash, order.order_hash);
    }

    #[tokio::test]
    async fn delete_removes_order() {
        let repo = InMemoryOrderRepository::new();
        let order = sample_order();
        repo.save(&order).await.unwrap();
        repo.delete(&order.order_hash).await.unwrap();
        assert!(repo.find(&order.order_hash).await.unwrap().is_none());
    }
}
