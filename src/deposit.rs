//! C2: the safety-deposit ledger — tracks resolver skin-in-the-game and its
//! redistribution (spec §4.5).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::types::OrderHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepositStatus {
    Active,
    Claimed,
    Expired,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimReason {
    WithdrawalExecuted,
    CancellationExecuted,
    Timeout,
    MaliciousBehavior,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyDeposit {
    pub order_hash: OrderHash,
    pub resolver_id: String,
    pub src_amount: u128,
    pub dst_amount: u128,
    pub token: String,
    pub deposited_at: DateTime<Utc>,
    pub status: DepositStatus,
    pub claimable_by: Vec<String>,
    pub claim_deadline: Option<DateTime<Utc>>,
    pub claim_reason: Option<ClaimReason>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claim_tx_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub enum DepositEvent {
    Claimable {
        order_hash: OrderHash,
        reason: ClaimReason,
    },
    Claimed {
        order_hash: OrderHash,
        claimer: String,
    },
    Refunded {
        order_hash: OrderHash,
    },
}

/// C2. One deposit per order (spec §3 invariant); `outstandingTotal` per
/// resolver is the sum of `(src + dst)` over deposits with `status=Active`
/// (spec §8 invariant 8), maintained incrementally rather than recomputed.
pub struct SafetyDepositLedger {
    config: CoordinatorConfig,
    deposits: RwLock<HashMap<OrderHash, SafetyDeposit>>,
    outstanding_by_resolver: RwLock<HashMap<String, u128>>,
    events: broadcast::Sender<DepositEvent>,
    refund_handles: RwLock<HashMap<OrderHash, JoinHandle<()>>>,
}

impl SafetyDepositLedger {
    pub fn new(config: CoordinatorConfig) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(100);
        Arc::new(Self {
            config,
            deposits: RwLock::new(HashMap::new()),
            outstanding_by_resolver: RwLock::new(HashMap::new()),
            events,
            refund_handles: RwLock::new(HashMap::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DepositEvent> {
        self.events.subscribe()
    }

    /// `RecordDeposit(...)` (spec §4.5): amounts must lie in
    /// `[min, max]`; at most one deposit per order.
    pub async fn record_deposit(
        &self,
        order_hash: OrderHash,
        resolver_id: String,
        src_amount: u128,
        dst_amount: u128,
        token: String,
    ) -> CoordinatorResult<()> {
        for amount in [src_amount, dst_amount] {
            if amount < self.config.minimum_deposit || amount > self.config.maximum_deposit {
                return Err(CoordinatorError::DepositOutOfRange {
                    amount,
                    min: self.config.minimum_deposit,
                    max: self.config.maximum_deposit,
                });
            }
        }

        let mut deposits = self.deposits.write().await;
        if deposits.contains_key(&order_hash) {
            return Err(CoordinatorError::DuplicateDeposit {
                order_hash: order_hash.0,
            });
        }
        deposits.insert(
            order_hash.clone(),
            SafetyDeposit {
                order_hash: order_hash.clone(),
                resolver_id: resolver_id.clone(),
                src_amount,
                dst_amount,
                token,
                deposited_at: Utc::now(),
                status: DepositStatus::Active,
                claimable_by: Vec::new(),
                claim_deadline: None,
                claim_reason: None,
                claimed_by: None,
                claimed_at: None,
                claim_tx_hash: None,
            },
        );
        *self.outstanding_by_resolver.write().await.entry(resolver_id).or_insert(0) +=
            src_amount + dst_amount;
        info!(%order_hash, "safety deposit recorded");
        Ok(())
    }

    /// `MakeClaimable(...)` (spec §4.5): legal only from `Active`; schedules
    /// an automatic refund at `claimDeadline + refundWindow` if unclaimed.
    pub async fn make_claimable(
        self: &Arc<Self>,
        order_hash: &OrderHash,
        claimable_by: Vec<String>,
        reason: ClaimReason,
    ) -> CoordinatorResult<()> {
        let deadline = {
            let mut deposits = self.deposits.write().await;
            let deposit = deposits
                .get_mut(order_hash)
                .ok_or_else(|| CoordinatorError::NotClaimable {
                    order_hash: order_hash.0.clone(),
                })?;
            if deposit.status != DepositStatus::Active {
                return Err(CoordinatorError::NotClaimable {
                    order_hash: order_hash.0.clone(),
                });
            }
            let deadline = Utc::now() + self.config.claim_window;
            deposit.claimable_by = claimable_by;
            deposit.claim_deadline = Some(deadline);
            deposit.claim_reason = Some(reason);
            deadline
        };

        let this = Arc::clone(self);
        let order_hash = order_hash.clone();
        let refund_delay = self.config.claim_window + self.config.refund_window;
        let handle = tokio::spawn(async move {
            let sleep_for = (deadline - Utc::now() + this.config.refund_window)
                .to_std()
                .unwrap_or(refund_delay);
            tokio::time::sleep(sleep_for).await;
            let _ = this.refund_deposit(&order_hash).await;
        });
        self.refund_handles.write().await.insert(order_hash.clone(), handle);
        let _ = self.events.send(DepositEvent::Claimable {
            order_hash: order_hash.clone(),
            reason,
        });
        info!(%order_hash, ?reason, "deposit made claimable");
        Ok(())
    }

    /// `ClaimDeposit(...)` (spec §4.5): legal iff `claimer` is in
    /// `claimableBy` and `now <= claimDeadline`.
    pub async fn claim_deposit(
        &self,
        order_hash: &OrderHash,
        claimer: &str,
        tx_hash: String,
    ) -> CoordinatorResult<()> {
        let mut deposits = self.deposits.write().await;
        let deposit = deposits.get_mut(order_hash).ok_or_else(|| CoordinatorError::NotClaimable {
            order_hash: order_hash.0.clone(),
        })?;

        if deposit.status != DepositStatus::Active || deposit.claim_deadline.is_none() {
            return Err(CoordinatorError::NotClaimable {
                order_hash: order_hash.0.clone(),
            });
        }
        if !deposit.claimable_by.iter().any(|c| c == claimer) {
            return Err(CoordinatorError::NotEligible {
                order_hash: order_hash.0.clone(),
            });
        }
        if Utc::now() > deposit.claim_deadline.unwrap() {
            return Err(CoordinatorError::DeadlinePassed {
                order_hash: order_hash.0.clone(),
            });
        }

        deposit.status = DepositStatus::Claimed;
        deposit.claimed_by = Some(claimer.to_string());
        deposit.claimed_at = Some(Utc::now());
        deposit.claim_tx_hash = Some(tx_hash);

        let total = deposit.src_amount + deposit.dst_amount;
        let resolver_id = deposit.resolver_id.clone();
        let order_hash_clone = order_hash.clone();
        drop(deposits);

        self.decrement_outstanding(&resolver_id, total).await;
        let _ = self.events.send(DepositEvent::Claimed {
            order_hash: order_hash_clone,
            claimer: claimer.to_string(),
        });
        Ok(())
    }

    /// `RefundDeposit(orderHash)` (spec §4.5): moves an active or
    /// unclaimed-expired deposit to `Refunded`.
    pub async fn refund_deposit(&self, order_hash: &OrderHash) -> CoordinatorResult<()> {
        let mut deposits = self.deposits.write().await;
        let deposit = match deposits.get_mut(order_hash) {
            Some(d) => d,
            None => return Ok(()),
        };
        if deposit.status != DepositStatus::Active {
            return Ok(());
        }
        deposit.status = DepositStatus::Refunded;
        let total = deposit.src_amount + deposit.dst_amount;
        let resolver_id = deposit.resolver_id.clone();
        drop(deposits);

        self.decrement_outstanding(&resolver_id, total).await;
        let _ = self.events.send(DepositEvent::Refunded {
            order_hash: order_hash.clone(),
        });
        info!(%order_hash, "deposit refunded");
        Ok(())
    }

    async fn decrement_outstanding(&self, resolver_id: &str, amount: u128) {
        if let Some(total) = self.outstanding_by_resolver.write().await.get_mut(resolver_id) {
            *total = total.saturating_sub(amount);
        }
    }

    pub async fn outstanding_total(&self, resolver_id: &str) -> u128 {
        self.outstanding_by_resolver
            .read()
            .await
            .get(resolver_id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn get_deposit(&self, order_hash: &OrderHash) -> Option<SafetyDeposit> {
        self.deposits.read().await.get(order_hash).cloned()
    }

    /// `CalculateIncentive(depositAmount, reason)` (spec §4.5):
    /// `depositAmount * multiplier(reason)`, expressed as `bps / 10_000`
    /// integer math to stay deterministic.
    pub fn calculate_incentive(&self, deposit_amount: u128, reason: ClaimReason) -> u128 {
        let bps = u128::from(self.config.incentive_multiplier_bps_for(reason));
        deposit_amount * bps / 10_000
    }

    pub async fn total_active(&self) -> usize {
        self.deposits
            .read()
            .await
            .values()
            .filter(|d| d.status == DepositStatus::Active)
            .count()
    }

    /// Sum of outstanding deposit obligations across every resolver, for
    /// `Stats()` (spec §6).
    pub async fn outstanding_total_all(&self) -> u128 {
        self.outstanding_by_resolver.read().await.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CoordinatorConfig {
        CoordinatorConfig {
            minimum_deposit: 1,
            maximum_deposit: 1_000_000,
            claim_window: std::time::Duration::from_millis(30),
            refund_window: std::time::Duration::from_millis(30),
            ..CoordinatorConfig::default()
        }
    }

    #[tokio::test]
    async fn deposit_out_of_range_rejected() {
        let ledger = SafetyDepositLedger::new(cfg());
        let err = ledger
            .record_deposit(OrderHash("0xabc".into()), "r1".into(), 0, 10, "tok".into())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::DepositOutOfRange { .. }));
    }

    #[tokio::test]
    async fn duplicate_deposit_rejected() {
        let ledger = SafetyDepositLedger::new(cfg());
        let hash = OrderHash("0xabc".into());
        ledger
            .record_deposit(hash.clone(), "r1".into(), 10, 10, "tok".into())
            .await
            .unwrap();
        let err = ledger
            .record_deposit(hash, "r1".into(), 10, 10, "tok".into())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::DuplicateDeposit { .. }));
    }

    #[tokio::test]
    async fn claim_by_eligible_party_before_deadline() {
        let ledger = SafetyDepositLedger::new(cfg());
        let hash = OrderHash("0xabc".into());
        ledger
            .record_deposit(hash.clone(), "r1".into(), 10, 10, "tok".into())
            .await
            .unwrap();
        ledger
            .make_claimable(&hash, vec!["r1".into()], ClaimReason::WithdrawalExecuted)
            .await
            .unwrap();
        ledger.claim_deposit(&hash, "r1", "0xtx".into()).await.unwrap();
        let deposit = ledger.get_deposit(&hash).await.unwrap();
        assert_eq!(deposit.status, DepositStatus::Claimed);
        assert_eq!(ledger.outstanding_total("r1").await, 0);
    }

    #[tokio::test]
    async fn claim_by_ineligible_party_rejected() {
        let ledger = SafetyDepositLedger::new(cfg());
        let hash = OrderHash("0xabc".into());
        ledger
            .record_deposit(hash.clone(), "r1".into(), 10, 10, "tok".into())
            .await
            .unwrap();
        ledger
            .make_claimable(&hash, vec!["r1".into()], ClaimReason::WithdrawalExecuted)
            .await
            .unwrap();
        let err = ledger.claim_deposit(&hash, "someone-else", "0xtx".into()).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NotEligible { .. }));
    }

    #[tokio::test]
    async fn unclaimed_deposit_auto_refunds() {
        let ledger = SafetyDepositLedger::new(cfg());
        let hash = OrderHash("0xabc".into());
        ledger
            .record_deposit(hash.clone(), "r1".into(), 10, 10, "tok".into())
            .await
            .unwrap();
        ledger
            .make_claimable(&hash, vec!["r1".into()], ClaimReason::Timeout)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        let deposit = ledger.get_deposit(&hash).await.unwrap();
        assert_eq!(deposit.status, DepositStatus::Refunded);
    }

    #[test]
    fn incentive_multipliers_match_spec() {
        let ledger_config = cfg();
        let ledger = SafetyDepositLedger {
            config: ledger_config,
            deposits: RwLock::new(HashMap::new()),
            outstanding_by_resolver: RwLock::new(HashMap::new()),
            events: broadcast::channel(1).0,
            refund_handles: RwLock::new(HashMap::new()),
        };
        let base = ledger.calculate_incentive(1000, ClaimReason::WithdrawalExecuted);
        let cancellation = ledger.calculate_incentive(1000, ClaimReason::CancellationExecuted);
        let timeout = ledger.calculate_incentive(1000, ClaimReason::Timeout);
        assert_eq!(cancellation, base * 3 / 2);
        assert_eq!(timeout, base * 2);
    }
}
