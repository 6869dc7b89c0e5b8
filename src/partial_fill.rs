//! C5: the partial-fill engine — cumulative multi-resolver fills against a
//! single order (spec §4.6).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::types::OrderHash;

#[derive(Debug, Clone)]
pub struct Fill {
    pub resolver_id: String,
    pub amount: u128,
    pub secret_index: usize,
    pub tx_hash: String,
    pub filled_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PartialFillState {
    pub order_hash: OrderHash,
    pub total_parts: u32,
    pub making_amount: u128,
    pub min_fill_amount: u128,
    pub cumulative_filled: u128,
    pub fills: Vec<Fill>,
    pub completed: bool,
}

impl PartialFillState {
    /// Cumulative fill expressed as basis points of `makingAmount`.
    pub fn fill_bps(&self) -> u64 {
        if self.making_amount == 0 {
            return 0;
        }
        (self.cumulative_filled * 10_000 / self.making_amount) as u64
    }
}

/// C5. One entry per order carrying `partialFill` config (spec §3); orders
/// without it are filled in a single `ExecuteFill` to completion elsewhere
/// and never touch this engine.
pub struct PartialFillEngine {
    states: RwLock<HashMap<OrderHash, PartialFillState>>,
    max_fill_percentage_bps: u64,
    min_fill_amount_floor: u128,
}

impl PartialFillEngine {
    pub fn new(max_fill_percentage_bps: u64, min_fill_amount_floor: u128) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            max_fill_percentage_bps,
            min_fill_amount_floor,
        }
    }

    /// `CreatePartialFillOrder(order, totalParts)` (spec §4.6): `totalParts`
    /// must be in `[2, maxParts]` per invariant; single-part orders skip
    /// this engine entirely.
    pub async fn create_partial_fill_order(
        &self,
        order_hash: OrderHash,
        total_parts: u32,
        making_amount: u128,
        min_fill_amount: u128,
        max_parts: u32,
    ) -> CoordinatorResult<()> {
        if total_parts < 2 || total_parts > max_parts {
            return Err(CoordinatorError::InvalidFillAmount {
                order_hash: order_hash.0,
                amount: u128::from(total_parts),
                reason: "total_parts out of range",
            });
        }
        let min_fill_amount = min_fill_amount.max(self.min_fill_amount_floor);
        self.states.write().await.insert(
            order_hash.clone(),
            PartialFillState {
                order_hash,
                total_parts,
                making_amount,
                min_fill_amount,
                cumulative_filled: 0,
                fills: Vec::new(),
                completed: false,
            },
        );
        Ok(())
    }

    /// `ExecuteFill(orderHash, resolverId, amount)` (spec §4.6): rejects an
    /// amount below `minFillAmount`, above the remaining balance, or that
    /// would exceed `maxFillPercentageBps` of `makingAmount` in one call.
    /// Marks `completed` once the cumulative fill reaches `makingAmount`
    /// (spec §8 invariant 7, "sum of fills == makingAmount on completion").
    pub async fn execute_fill(
        &self,
        order_hash: &OrderHash,
        resolver_id: &str,
        amount: u128,
        secret_index: usize,
        tx_hash: String,
    ) -> CoordinatorResult<bool> {
        let mut states = self.states.write().await;
        let state = states.get_mut(order_hash).ok_or_else(|| CoordinatorError::NotFound {
            order_hash: order_hash.0.clone(),
        })?;

        if state.completed {
            return Err(CoordinatorError::PartsExhausted {
                order_hash: order_hash.0.clone(),
            });
        }
        if amount < state.min_fill_amount {
            return Err(CoordinatorError::InvalidFillAmount {
                order_hash: order_hash.0.clone(),
                amount,
                reason: "below minimum fill amount",
            });
        }
        let remaining = state.making_amount - state.cumulative_filled;
        if amount > remaining {
            return Err(CoordinatorError::InvalidFillAmount {
                order_hash: order_hash.0.clone(),
                amount,
                reason: "exceeds remaining order balance",
            });
        }
        let bps_of_total = amount.saturating_mul(10_000) / state.making_amount.max(1);
        if u64::try_from(bps_of_total).unwrap_or(u64::MAX) > self.max_fill_percentage_bps {
            return Err(CoordinatorError::InvalidFillAmount {
                order_hash: order_hash.0.clone(),
                amount,
                reason: "exceeds max single-fill percentage",
            });
        }

        state.cumulative_filled += amount;
        state.fills.push(Fill {
            resolver_id: resolver_id.to_string(),
            amount,
            secret_index,
            tx_hash,
            filled_at: Utc::now(),
        });
        let completed = state.cumulative_filled == state.making_amount;
        state.completed = completed;
        if completed {
            info!(%order_hash, parts = state.fills.len(), "order fully filled across parts");
        }
        Ok(completed)
    }

    pub async fn get_state(&self, order_hash: &OrderHash) -> Option<PartialFillState> {
        self.states.read().await.get(order_hash).cloned()
    }

    /// Fill percentage to pass to `RevealPartialSecret` (spec §4.4, §4.6),
    /// expressed as whole percent per that operation's signature.
    pub async fn cumulative_fill_percentage(&self, order_hash: &OrderHash) -> Option<u64> {
        self.states
            .read()
            .await
            .get(order_hash)
            .map(|s| s.fill_bps() / 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_total_parts_out_of_range() {
        let engine = PartialFillEngine::new(10_000, 1);
        let hash = OrderHash("0xabc".into());
        let err = engine
            .create_partial_fill_order(hash, 1, 1000, 1, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidFillAmount { .. }));
    }

    #[tokio::test]
    async fn fills_accumulate_and_complete_exactly() {
        let engine = PartialFillEngine::new(10_000, 1);
        let hash = OrderHash("0xabc".into());
        engine
            .create_partial_fill_order(hash.clone(), 4, 1000, 1, 100)
            .await
            .unwrap();

        let done = engine
            .execute_fill(&hash, "r1", 250, 1, "0xtx1".into())
            .await
            .unwrap();
        assert!(!done);
        assert_eq!(engine.cumulative_fill_percentage(&hash).await.unwrap(), 25);

        let done = engine
            .execute_fill(&hash, "r2", 750, 4, "0xtx2".into())
            .await
            .unwrap();
        assert!(done);
        let state = engine.get_state(&hash).await.unwrap();
        assert_eq!(state.cumulative_filled, 1000);
        assert!(state.completed);
        assert_eq!(state.fills.len(), 2);
    }

    #[tokio::test]
    async fn overfill_rejected() {
        let engine = PartialFillEngine::new(10_000, 1);
        let hash = OrderHash("0xabc".into());
        engine
            .create_partial_fill_order(hash.clone(), 4, 1000, 1, 100)
            .await
            .unwrap();
        let err = engine
            .execute_fill(&hash, "r1", 1001, 4, "0xtx".into())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidFillAmount { .. }));
    }

    #[tokio::test]
    async fn fill_after_completion_rejected() {
        let engine = PartialFillEngine::new(10_000, 1);
        let hash = OrderHash("0xabc".into());
        engine
            .create_partial_fill_order(hash.clone(), 2, 1000, 1, 100)
            .await
            .unwrap();
        engine.execute_fill(&hash, "r1", 1000, 2, "0xtx".into()).await.unwrap();
        let err = engine
            .execute_fill(&hash, "r2", 1, 2, "0xtx2".into())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::PartsExhausted { .. }));
    }
}
