//! C7: the coordinator — wires C1-C6 together and exposes the operations
//! spec §4.7 describes as the system's public surface.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::auction::{AuctionEngine, AuctionEvent, Bid};
use crate::config::CoordinatorConfig;
use crate::deposit::{ClaimReason, SafetyDepositLedger};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::hashing::secret_hash;
use crate::interfaces::OrderRepository;
use crate::partial_fill::PartialFillEngine;
use crate::secret::{MerkleSecretTree, SecretManager};
use crate::state_machine::{FusionStateMachine, OrderLifecycleState, TransitionData};
use crate::timelock::TimelockScheduler;
use crate::types::{ChainEvent, ChainEventType, Order, OrderHash, OrderRequest};

/// Aggregate counts returned by `Stats()` (spec §4.7, §6).
#[derive(Debug, Clone, serde::Serialize)]
pub struct Stats {
    pub active_orders: usize,
    pub orders_by_state: std::collections::HashMap<String, usize>,
    pub active_auctions: usize,
    pub active_deposits: usize,
    pub deposits_outstanding_total: u128,
    pub secrets_stored: usize,
    pub secrets_shared: usize,
    pub scheduled_tasks: usize,
    pub fired_tasks: usize,
}

/// C7. Owns one instance of each subsystem and the cross-subsystem wiring
/// between them; every public method here is the coordinator-level
/// operation a transport layer (HTTP, gRPC, ...) would expose.
pub struct Coordinator {
    config: CoordinatorConfig,
    pub state_machine: Arc<FusionStateMachine>,
    pub timelock: Arc<TimelockScheduler>,
    pub secrets: Arc<SecretManager>,
    pub auctions: Arc<AuctionEngine>,
    pub deposits: Arc<SafetyDepositLedger>,
    pub partial_fills: Arc<PartialFillEngine>,
    pub repository: Arc<dyn OrderRepository>,
    shutdown_tx: watch::Sender<bool>,
    known_resolvers: RwLock<Vec<String>>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, repository: Arc<dyn OrderRepository>) -> Arc<Self> {
        let (shutdown_tx, _rx) = watch::channel(false);
        let coordinator = Arc::new(Self {
            state_machine: Arc::new(FusionStateMachine::new()),
            timelock: TimelockScheduler::new(config.clone()),
            secrets: SecretManager::new(config.clone()),
            auctions: Arc::new(AuctionEngine::new()),
            deposits: SafetyDepositLedger::new(config.clone()),
            partial_fills: Arc::new(PartialFillEngine::new(
                config.max_fill_percentage_bps,
                config.min_fill_amount,
            )),
            repository,
            shutdown_tx,
            known_resolvers: RwLock::new(Vec::new()),
            config,
        });
        coordinator
    }

    /// Connects the timelock's finality/cancellation hooks to the secret
    /// manager and state machine, mirroring spec §4.3 steps 3 and 5 without
    /// forcing those subsystems to know about each other directly. Must be
    /// awaited once before the coordinator starts taking traffic; the hook
    /// setters are async only because they take the hook lock, so this
    /// cannot run inside the otherwise-synchronous constructor.
    pub async fn wire_hooks(self: &Arc<Self>) {
        let finality_machine = Arc::clone(&self.state_machine);
        self.timelock
            .set_finality_hook(move |order_hash| {
                let machine = Arc::clone(&finality_machine);
                async move {
                    machine
                        .transition(&order_hash, OrderLifecycleState::ReadyForSecret, TransitionData::default())
                        .await
                }
            })
            .await;

        let cancellation_machine = Arc::clone(&self.state_machine);
        self.timelock
            .set_cancellation_hook(move |order_hash| {
                let machine = Arc::clone(&cancellation_machine);
                async move {
                    let current = machine
                        .get_state(&order_hash)
                        .await
                        .ok_or_else(|| CoordinatorError::NotFound {
                            order_hash: order_hash.0.clone(),
                        })?;
                    let target = match current.current_state {
                        OrderLifecycleState::SrcLocked | OrderLifecycleState::SecretReceived => {
                            OrderLifecycleState::CancelledSrc
                        }
                        _ => OrderLifecycleState::CancelledDst,
                    };
                    machine.transition(&order_hash, target, TransitionData::default()).await
                }
            })
            .await;

        self.spawn_auction_tick_loop();
    }

    /// Background `tick` loop driving auction expiry (spec §4.2, §8
    /// scenario S3): an order still in `AuctionStarted` when its auction's
    /// `endTime` passes with no winner is cancelled rather than left
    /// stuck. Exits on coordinator shutdown.
    fn spawn_auction_tick_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(self.config.auction_tick_interval);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for event in this.auctions.tick_all(Utc::now()).await {
                            let AuctionEvent::Expired { order_hash } = event else { continue };
                            if let Err(err) = this
                                .transition_idempotent(&order_hash, OrderLifecycleState::CancelledSrc, TransitionData::default())
                                .await
                            {
                                warn!(%order_hash, %err, "auction expiry transition failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
    }

    /// `ProcessOrder(request)` (spec §4.7): verifies the hash, admits the
    /// order into every subsystem, and starts its auction.
    pub async fn process_order(self: &Arc<Self>, request: OrderRequest) -> CoordinatorResult<OrderHash> {
        let order_hash = request.compute_hash();
        let order = request.into_order(order_hash.clone());

        self.state_machine.create(order_hash.clone(), order.clone()).await?;
        self.timelock.create_timelock(order_hash.clone()).await;
        self.repository.save(&order).await?;

        if let Some(partial) = &order.partial_fill {
            self.partial_fills
                .create_partial_fill_order(
                    order_hash.clone(),
                    partial.total_parts,
                    order.making_amount,
                    partial.min_fill_amount,
                    self.config.max_parts,
                )
                .await?;
            self.secrets
                .create_merkle_secret_tree(order_hash.clone(), partial.total_parts)
                .await;
        }

        self.auctions.start_auction(order_hash.clone(), order.auction.clone()).await?;
        self.state_machine
            .transition(
                &order_hash,
                OrderLifecycleState::AuctionStarted,
                TransitionData {
                    order: Some(order),
                    ..Default::default()
                },
            )
            .await?;
        info!(%order_hash, "order processed");
        Ok(order_hash)
    }

    /// `PlaceBid` wrapper: on a win, advances the order into
    /// `SrcLockPending` with the winning resolver and rate recorded (spec
    /// §4.1, §4.2).
    pub async fn place_bid(self: &Arc<Self>, bid: Bid) -> CoordinatorResult<bool> {
        let order_hash = bid.order_hash.clone();
        let resolver_id = bid.resolver_id.clone();
        let rate = bid.bid_rate;
        let won = self.auctions.place_bid(bid).await?;
        if won {
            self.state_machine
                .transition(
                    &order_hash,
                    OrderLifecycleState::SrcLockPending,
                    TransitionData {
                        resolver: Some(resolver_id),
                        rate: Some(rate),
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(won)
    }

    /// Chain-event ingress (spec §4.7 "ProcessChainEvent"): maps a
    /// finalized on-chain event to the corresponding subsystem updates and
    /// state transition.
    pub async fn process_chain_event(self: &Arc<Self>, event: ChainEvent) -> CoordinatorResult<()> {
        match event.event_type {
            ChainEventType::SrcEscrowCreated => {
                self.timelock.set_escrow_created(&event.order_hash, true).await?;
                self.secrets
                    .update_finality_status(&event.order_hash, true, false, self.known_resolvers.read().await.clone())
                    .await?;
                self.record_deposit_from_payload(&event).await;
                self.transition_idempotent(
                    &event.order_hash,
                    OrderLifecycleState::SrcLocked,
                    TransitionData {
                        src_tx_hash: Some(event.tx_hash.clone()),
                        ..Default::default()
                    },
                )
                .await?;
                self.transition_idempotent(&event.order_hash, OrderLifecycleState::DstLockPending, TransitionData::default())
                    .await?;
            }
            ChainEventType::DstEscrowCreated => {
                self.timelock.set_escrow_created(&event.order_hash, false).await?;
                self.secrets
                    .update_finality_status(&event.order_hash, false, true, self.known_resolvers.read().await.clone())
                    .await?;
                self.transition_idempotent(
                    &event.order_hash,
                    OrderLifecycleState::DstLocked,
                    TransitionData {
                        dst_tx_hash: Some(event.tx_hash.clone()),
                        ..Default::default()
                    },
                )
                .await?;
            }
            ChainEventType::Withdrawal => {
                self.timelock.notify_withdrawal_completed(&event.order_hash).await?;
                if let Some(resolver) = self
                    .state_machine
                    .get_state(&event.order_hash)
                    .await
                    .and_then(|state| state.selected_resolver)
                {
                    let _ = self
                        .deposits
                        .make_claimable(&event.order_hash, vec![resolver], ClaimReason::WithdrawalExecuted)
                        .await;
                }
                self.transition_idempotent(&event.order_hash, OrderLifecycleState::Executed, TransitionData::default())
                    .await?;
                self.repository.delete(&event.order_hash).await?;
            }
            ChainEventType::Cancelled => {
                let state = self
                    .state_machine
                    .get_state(&event.order_hash)
                    .await
                    .ok_or_else(|| CoordinatorError::NotFound {
                        order_hash: event.order_hash.0.clone(),
                    })?;
                let target = match state.current_state {
                    OrderLifecycleState::CancelledDst | OrderLifecycleState::Refunded => OrderLifecycleState::Refunded,
                    _ => OrderLifecycleState::CancelledDst,
                };
                self.transition_idempotent(&event.order_hash, target, TransitionData::default()).await?;
            }
        }
        Ok(())
    }

    /// Applies a state transition driven by a finalized chain event,
    /// treating a replayed event that no longer matches the expected
    /// source state as a no-op rather than a failure: `ProcessChainEvent`
    /// must be idempotent under redelivery (spec §8 "idempotent ingress").
    async fn transition_idempotent(
        &self,
        order_hash: &OrderHash,
        to: OrderLifecycleState,
        data: TransitionData,
    ) -> CoordinatorResult<()> {
        match self.state_machine.transition(order_hash, to, data).await {
            Ok(()) => Ok(()),
            Err(CoordinatorError::InvalidTransition { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// `ProcessSecretReveal(orderHash, secret, maker)` (spec §4.7): stores
    /// the secret, and if both chains are already finalized the release
    /// timer was scheduled back when finality was reached, so this just
    /// records provenance.
    pub async fn process_secret_reveal(
        self: &Arc<Self>,
        order_hash: &OrderHash,
        secret: String,
        maker_address: String,
    ) -> CoordinatorResult<()> {
        let order = self
            .repository
            .find(order_hash)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound {
                order_hash: order_hash.0.clone(),
            })?;
        self.secrets
            .store_secret(order_hash, secret.clone(), maker_address, order.secret_hash)
            .await?;
        self.state_machine
            .transition(
                order_hash,
                OrderLifecycleState::SecretReceived,
                TransitionData {
                    secret: Some(secret),
                    ..Default::default()
                },
            )
            .await
    }

    /// `ExecuteFill(orderHash, resolverId, amount)` (spec §4.6, §8 scenario
    /// S6): validates and records the fill against C5 first, using the
    /// secret index the resulting cumulative percentage maps to, then
    /// reveals that Merkle secret through C3 so a rejected fill never
    /// marks a secret used.
    pub async fn execute_fill(
        &self,
        order_hash: &OrderHash,
        resolver_id: &str,
        amount: u128,
        tx_hash: String,
    ) -> CoordinatorResult<bool> {
        let state = self
            .partial_fills
            .get_state(order_hash)
            .await
            .ok_or_else(|| CoordinatorError::NotFound {
                order_hash: order_hash.0.clone(),
            })?;

        let total = state.making_amount.max(1);
        let projected_bps =
            (state.cumulative_filled.saturating_add(amount).saturating_mul(10_000) / total) as u64;
        let secret_index = MerkleSecretTree::index_for_fill_bps(state.total_parts, projected_bps);

        let completed = self
            .partial_fills
            .execute_fill(order_hash, resolver_id, amount, secret_index, tx_hash)
            .await?;
        self.secrets
            .reveal_partial_secret(order_hash, resolver_id, state.total_parts, projected_bps / 100)
            .await?;
        Ok(completed)
    }

    /// `ClaimDeposit` wrapper applying the reason-specific incentive
    /// multiplier before delegating to the ledger (spec §4.5).
    pub async fn claim_deposit(
        &self,
        order_hash: &OrderHash,
        claimer: &str,
        tx_hash: String,
    ) -> CoordinatorResult<u128> {
        let deposit = self
            .deposits
            .get_deposit(order_hash)
            .await
            .ok_or_else(|| CoordinatorError::NotClaimable {
                order_hash: order_hash.0.clone(),
            })?;
        let reason = deposit.claim_reason.unwrap_or(ClaimReason::WithdrawalExecuted);
        self.deposits.claim_deposit(order_hash, claimer, tx_hash).await?;
        Ok(self
            .deposits
            .calculate_incentive(deposit.src_amount + deposit.dst_amount, reason))
    }

    /// Verifies a maker's order signature before admission; a no-op stub
    /// is never produced here, callers must supply a real
    /// `SignatureVerifier` for the chain in question.
    pub async fn verify_order_signature(
        &self,
        verifier: &dyn crate::interfaces::SignatureVerifier,
        signer: &str,
        message: &[u8],
        signature: &[u8],
    ) -> CoordinatorResult<()> {
        if verifier.verify(signer, message, signature).await? {
            Ok(())
        } else {
            Err(CoordinatorError::InvalidSignature)
        }
    }

    /// Opportunistic `RecordDeposit` from a `SrcEscrowCreated` event's
    /// payload (spec §4.7); the payload schema is the chain adapter's to
    /// define (spec §1 "out of scope"), so a payload missing these fields
    /// is logged and skipped rather than treated as an ingress failure.
    async fn record_deposit_from_payload(&self, event: &ChainEvent) {
        let resolver_id = event.payload.get("resolver_id").and_then(|v| v.as_str());
        let src_amount = event.payload.get("src_amount").and_then(|v| v.as_u64());
        let dst_amount = event.payload.get("dst_amount").and_then(|v| v.as_u64());
        let token = event.payload.get("token").and_then(|v| v.as_str());
        if let (Some(resolver_id), Some(src_amount), Some(dst_amount), Some(token)) =
            (resolver_id, src_amount, dst_amount, token)
        {
            if let Err(err) = self
                .deposits
                .record_deposit(
                    event.order_hash.clone(),
                    resolver_id.to_string(),
                    u128::from(src_amount),
                    u128::from(dst_amount),
                    token.to_string(),
                )
                .await
            {
                warn!(order_hash = %event.order_hash, %err, "deposit not recorded from chain event payload");
            }
        }
    }

    pub async fn register_resolver(&self, id: String, kyc_approved: bool) {
        self.known_resolvers.write().await.push(id.clone());
        self.auctions.register_resolver(id, kyc_approved).await;
    }

    pub async fn get_order(&self, order_hash: &OrderHash) -> Option<Order> {
        self.repository.find(order_hash).await.ok().flatten()
    }

    pub async fn stats(&self) -> Stats {
        let orders_by_state = self
            .state_machine
            .count_by_state()
            .await
            .into_iter()
            .map(|(state, count)| (format!("{:?}", state), count))
            .collect();
        let (secrets_stored, secrets_shared) = self.secrets.counts().await;
        let (scheduled_tasks, fired_tasks) = self.timelock.task_counts().await;
        Stats {
            active_orders: self.repository.list_active().await.map(|v| v.len()).unwrap_or(0),
            orders_by_state,
            active_auctions: self.auctions.active_count().await,
            active_deposits: self.deposits.total_active().await,
            deposits_outstanding_total: self.deposits.outstanding_total_all().await,
            secrets_stored,
            secrets_shared,
            scheduled_tasks,
            fired_tasks,
        }
    }

    /// Signals graceful shutdown to every long-running task watching this
    /// channel (routes, background pollers).
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        warn!("coordinator shutdown signaled");
    }

    pub fn now() -> chrono::DateTime<Utc> {
        Utc::now()
    }

    pub fn verify_secret_matches(expected: &[u8; 32], candidate: &str) -> bool {
        &secret_hash(candidate) == expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::InMemoryOrderRepository;
    use crate::types::{AuctionParams, PartialFillConfig};

    fn sample_request() -> OrderRequest {
        OrderRequest {
            salt: 1,
            maker: "maker".into(),
            receiver: "receiver".into(),
            allowed_sender: "0x0".into(),
            src_chain_id: 1,
            src_token: "0xsrc".into(),
            making_amount: 1000,
            dst_chain_id: 2,
            dst_token: "0xdst".into(),
            taking_amount: 900,
            secret_hash: secret_hash("shh"),
            auction: AuctionParams::linear(Utc::now(), Utc::now() + chrono::Duration::seconds(60), 1000, 900),
            partial_fill: None,
            verifying_contract: "0xcontract".into(),
            signature: vec![],
        }
    }

    #[tokio::test]
    async fn process_order_starts_auction_and_enters_phase_one() {
        let coordinator = Coordinator::new(CoordinatorConfig::default(), InMemoryOrderRepository::new());
        coordinator.wire_hooks().await;
        let order_hash = coordinator.process_order(sample_request()).await.unwrap();
        let state = coordinator.state_machine.get_state(&order_hash).await.unwrap();
        assert_eq!(state.current_state, OrderLifecycleState::AuctionStarted);
        assert_eq!(coordinator.stats().await.active_auctions, 1);
    }

    #[tokio::test]
    async fn bid_win_advances_state_to_src_lock_pending() {
        let coordinator = Coordinator::new(CoordinatorConfig::default(), InMemoryOrderRepository::new());
        coordinator.wire_hooks().await;
        let order_hash = coordinator.process_order(sample_request()).await.unwrap();
        coordinator.register_resolver("r1".into(), true).await;

        let won = coordinator
            .place_bid(Bid {
                order_hash: order_hash.clone(),
                resolver_id: "r1".into(),
                bid_rate: 1000,
                safety_deposit_amount: 10,
                submitted_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(won);
        let state = coordinator.state_machine.get_state(&order_hash).await.unwrap();
        assert_eq!(state.current_state, OrderLifecycleState::SrcLockPending);
    }

    #[tokio::test]
    async fn partial_fill_order_seeds_merkle_tree() {
        let mut request = sample_request();
        request.partial_fill = Some(PartialFillConfig {
            total_parts: 4,
            min_fill_amount: 1,
        });
        let coordinator = Coordinator::new(CoordinatorConfig::default(), InMemoryOrderRepository::new());
        coordinator.wire_hooks().await;
        let order_hash = coordinator.process_order(request).await.unwrap();
        let tree = coordinator.secrets.get_merkle_tree(&order_hash).await.unwrap();
        assert_eq!(tree.secrets.len(), 5);
    }

    #[tokio::test]
    async fn execute_fill_records_partial_fill_and_reveals_secret() {
        let mut request = sample_request();
        request.partial_fill = Some(PartialFillConfig {
            total_parts: 4,
            min_fill_amount: 1,
        });
        let coordinator = Coordinator::new(CoordinatorConfig::default(), InMemoryOrderRepository::new());
        coordinator.wire_hooks().await;
        let order_hash = coordinator.process_order(request).await.unwrap();

        let completed = coordinator
            .execute_fill(&order_hash, "r1", 250, "0xtx".into())
            .await
            .unwrap();
        assert!(!completed);

        let fill_state = coordinator.partial_fills.get_state(&order_hash).await.unwrap();
        assert_eq!(fill_state.cumulative_filled, 250);
        assert_eq!(fill_state.fills.len(), 1);

        let tree = coordinator.secrets.get_merkle_tree(&order_hash).await.unwrap();
        assert!(tree.used_secrets.contains(&1));
    }

    #[tokio::test]
    async fn replayed_src_escrow_created_is_a_no_op() {
        let coordinator = Coordinator::new(CoordinatorConfig::default(), InMemoryOrderRepository::new());
        coordinator.wire_hooks().await;
        let order_hash = coordinator.process_order(sample_request()).await.unwrap();
        coordinator.register_resolver("r1".into(), true).await;
        coordinator
            .place_bid(Bid {
                order_hash: order_hash.clone(),
                resolver_id: "r1".into(),
                bid_rate: 1000,
                safety_deposit_amount: 10,
                submitted_at: Utc::now(),
            })
            .await
            .unwrap();

        let event = ChainEvent {
            event_type: ChainEventType::SrcEscrowCreated,
            order_hash: order_hash.clone(),
            tx_hash: "0xsrc_tx".into(),
            payload: serde_json::Value::Null,
        };
        coordinator.process_chain_event(event.clone()).await.unwrap();
        let after_first = coordinator.state_machine.get_state(&order_hash).await.unwrap();
        assert_eq!(after_first.current_state, OrderLifecycleState::DstLockPending);

        coordinator.process_chain_event(event).await.unwrap();
        let after_replay = coordinator.state_machine.get_state(&order_hash).await.unwrap();
        assert_eq!(after_replay.current_state, OrderLifecycleState::DstLockPending);
    }
}
