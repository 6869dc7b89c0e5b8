//! C6: the Fusion state machine — the authoritative 4-phase order lifecycle
//! (spec §4.1).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::types::{Order, OrderHash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderLifecycleState {
    New,
    AuctionStarted,
    SrcLockPending,
    SrcLocked,
    DstLockPending,
    DstLocked,
    ReadyForSecret,
    SecretReceived,
    Executed,
    CancelledSrc,
    CancelledDst,
    Refunded,
    Error,
}

impl std::fmt::Display for OrderLifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl OrderLifecycleState {
    /// Phase the state belongs to, per spec §4.1. `Error` has no fixed
    /// phase of its own: it keeps whatever phase the order was in when it
    /// failed, tracked separately on `OrderState::phase`.
    fn nominal_phase(self) -> u8 {
        use OrderLifecycleState::*;
        match self {
            New | AuctionStarted => 1,
            SrcLockPending | SrcLocked | DstLockPending | DstLocked | ReadyForSecret => 2,
            SecretReceived | Executed => 3,
            CancelledSrc | CancelledDst | Refunded => 4,
            Error => 0, // resolved via OrderState.phase instead
        }
    }
}

/// Data a transition may require, per the table in spec §4.1.
#[derive(Debug, Clone, Default)]
pub struct TransitionData {
    pub order: Option<Order>,
    pub resolver: Option<String>,
    pub rate: Option<u128>,
    pub src_tx_hash: Option<String>,
    pub dst_tx_hash: Option<String>,
    pub secret: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Milestones {
    pub auction_started_at: Option<DateTime<Utc>>,
    pub src_deposit_confirmed_at: Option<DateTime<Utc>>,
    pub dst_deposit_confirmed_at: Option<DateTime<Utc>>,
    pub finality_reached_at: Option<DateTime<Utc>>,
    pub secret_shared_at: Option<DateTime<Utc>>,
    pub withdrawals_done_at: Option<DateTime<Utc>>,
    pub cancellation_started_at: Option<DateTime<Utc>>,
    pub recovery_completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct OrderState {
    pub order_hash: OrderHash,
    pub order: Option<Order>,
    pub current_state: OrderLifecycleState,
    pub previous_state: OrderLifecycleState,
    pub phase: u8,
    pub selected_resolver: Option<String>,
    pub winning_rate: Option<u128>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub milestones: Milestones,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum StateEvent {
    Transition {
        order_hash: OrderHash,
        from: OrderLifecycleState,
        to: OrderLifecycleState,
    },
    PhaseChange {
        order_hash: OrderHash,
        from_phase: u8,
        to_phase: u8,
    },
    Error {
        order_hash: OrderHash,
        message: String,
    },
}

type CallbackFuture = Pin<Box<dyn Future<Output = CoordinatorResult<()>> + Send>>;
type Callback = Arc<dyn Fn(OrderHash, TransitionData) -> CallbackFuture + Send + Sync>;

/// C6. Owns per-order lifecycle state behind a single-writer lock; cross-
/// subsystem effects are driven by registered callbacks run off-lock
/// (spec §5 "callback dispatch").
pub struct FusionStateMachine {
    states: RwLock<HashMap<OrderHash, OrderState>>,
    callbacks: RwLock<HashMap<OrderLifecycleState, Vec<Callback>>>,
    events: broadcast::Sender<StateEvent>,
}

impl FusionStateMachine {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(100);
        Self {
            states: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    pub async fn register_callback<F, Fut>(&self, state: OrderLifecycleState, callback: F)
    where
        F: Fn(OrderHash, TransitionData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoordinatorResult<()>> + Send + 'static,
    {
        let wrapped: Callback = Arc::new(move |hash, data| Box::pin(callback(hash, data)));
        self.callbacks.write().await.entry(state).or_default().push(wrapped);
    }

    pub async fn create(&self, order_hash: OrderHash, order: Order) -> CoordinatorResult<()> {
        let mut states = self.states.write().await;
        if states.contains_key(&order_hash) {
            return Err(CoordinatorError::DuplicateOrder {
                order_hash: order_hash.0,
            });
        }
        let now = Utc::now();
        states.insert(
            order_hash.clone(),
            OrderState {
                order_hash: order_hash.clone(),
                order: Some(order),
                current_state: OrderLifecycleState::New,
                previous_state: OrderLifecycleState::New,
                phase: 1,
                selected_resolver: None,
                winning_rate: None,
                retry_count: 0,
                error_message: None,
                milestones: Milestones::default(),
                updated_at: now,
            },
        );
        info!(%order_hash, "order created");
        Ok(())
    }

    pub async fn get_state(&self, order_hash: &OrderHash) -> Option<OrderState> {
        self.states.read().await.get(order_hash).cloned()
    }

    /// Order counts grouped by lifecycle state, for `Stats()` (spec §6).
    pub async fn count_by_state(&self) -> HashMap<OrderLifecycleState, usize> {
        let mut counts = HashMap::new();
        for state in self.states.read().await.values() {
            *counts.entry(state.current_state).or_insert(0) += 1;
        }
        counts
    }

    /// `Transition(orderHash, newState, data)` (spec §4.1).
    pub async fn transition(
        &self,
        order_hash: &OrderHash,
        to: OrderLifecycleState,
        data: TransitionData,
    ) -> CoordinatorResult<()> {
        let (from, new_phase, old_phase) = {
            let mut states = self.states.write().await;
            let state = states
                .get_mut(order_hash)
                .ok_or_else(|| CoordinatorError::NotFound {
                    order_hash: order_hash.0.clone(),
                })?;

            let from = state.current_state;
            validate_transition(from, to, &data)?;

            let old_phase = state.phase;
            let new_phase = if to == OrderLifecycleState::Error {
                old_phase
            } else {
                to.nominal_phase()
            };

            apply_milestone(state, to, Utc::now());
            if let Some(resolver) = &data.resolver {
                state.selected_resolver = Some(resolver.clone());
            }
            if let Some(rate) = data.rate {
                state.winning_rate = Some(rate);
            }
            if to == OrderLifecycleState::Error {
                state.error_message = data.error.clone();
            }
            state.previous_state = from;
            state.current_state = to;
            state.phase = new_phase;
            state.updated_at = Utc::now();
            (from, new_phase, old_phase)
        };

        let _ = self.events.send(StateEvent::Transition {
            order_hash: order_hash.clone(),
            from,
            to,
        });
        if new_phase != old_phase {
            let _ = self.events.send(StateEvent::PhaseChange {
                order_hash: order_hash.clone(),
                from_phase: old_phase,
                to_phase: new_phase,
            });
        }
        info!(%order_hash, %from, %to, "state transition");

        self.dispatch_callbacks(order_hash.clone(), to, data).await;
        Ok(())
    }

    async fn dispatch_callbacks(&self, order_hash: OrderHash, to: OrderLifecycleState, data: TransitionData) {
        let callbacks = {
            let guard = self.callbacks.read().await;
            guard.get(&to).cloned().unwrap_or_default()
        };
        for callback in callbacks {
            let order_hash = order_hash.clone();
            let data = data.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                if let Err(err) = callback(order_hash.clone(), data).await {
                    error!(%order_hash, %err, "state callback failed");
                    let _ = events.send(StateEvent::Error {
                        order_hash,
                        message: err.to_string(),
                    });
                }
            });
        }
    }

    /// `Retry(orderHash)`: only legal from `Error`, resets to the previous
    /// state and bumps `retryCount`. Spec does not bound retries (§4.1,
    /// §9 open question iv) — bounding is a caller policy.
    pub async fn retry(&self, order_hash: &OrderHash) -> CoordinatorResult<()> {
        let mut states = self.states.write().await;
        let state = states
            .get_mut(order_hash)
            .ok_or_else(|| CoordinatorError::NotFound {
                order_hash: order_hash.0.clone(),
            })?;
        if state.current_state != OrderLifecycleState::Error {
            return Err(CoordinatorError::InvalidTransition {
                from: state.current_state.to_string(),
                to: "Retry".to_string(),
            });
        }
        state.current_state = state.previous_state;
        state.phase = state.previous_state.nominal_phase();
        state.retry_count += 1;
        state.error_message = None;
        state.updated_at = Utc::now();
        warn!(%order_hash, retry_count = state.retry_count, "order retried");
        Ok(())
    }
}

impl Default for FusionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_milestone(state: &mut OrderState, to: OrderLifecycleState, now: DateTime<Utc>) {
    use OrderLifecycleState::*;
    match to {
        AuctionStarted => set_once(&mut state.milestones.auction_started_at, now),
        SrcLocked => set_once(&mut state.milestones.src_deposit_confirmed_at, now),
        DstLocked => set_once(&mut state.milestones.dst_deposit_confirmed_at, now),
        ReadyForSecret => set_once(&mut state.milestones.finality_reached_at, now),
        SecretReceived => set_once(&mut state.milestones.secret_shared_at, now),
        Executed => set_once(&mut state.milestones.withdrawals_done_at, now),
        CancelledSrc | CancelledDst => set_once(&mut state.milestones.cancellation_started_at, now),
        Refunded => set_once(&mut state.milestones.recovery_completed_at, now),
        _ => {}
    }
}

/// Each milestone timestamp, once set, is immutable (spec §3 invariant).
fn set_once(field: &mut Option<DateTime<Utc>>, now: DateTime<Utc>) {
    if field.is_none() {
        *field = Some(now);
    }
}

fn validate_transition(
    from: OrderLifecycleState,
    to: OrderLifecycleState,
    data: &TransitionData,
) -> CoordinatorResult<()> {
    use OrderLifecycleState::*;

    let required_ok = match (from, to) {
        (New, AuctionStarted) => data.order.is_some(),
        (AuctionStarted, SrcLockPending) => data.resolver.is_some() && data.rate.is_some(),
        (SrcLockPending, SrcLocked) => data.src_tx_hash.is_some(),
        (SrcLocked, DstLockPending) => true,
        (DstLockPending, DstLocked) => data.dst_tx_hash.is_some(),
        (DstLocked, ReadyForSecret) => true,
        (ReadyForSecret, SecretReceived) => data.secret.is_some(),
        (SecretReceived, Executed) => true,
        (AuctionStarted, CancelledSrc) => true,
        (SrcLocked, CancelledSrc) => true,
        (DstLocked, CancelledDst) => true,
        (ReadyForSecret, CancelledDst) => true,
        (SecretReceived, CancelledSrc) => true,
        (CancelledSrc, Refunded) => true,
        (CancelledDst, Refunded) => true,
        (from, Error)
            if matches!(
                from,
                New | AuctionStarted
                    | SrcLockPending
                    | SrcLocked
                    | DstLockPending
                    | DstLocked
                    | ReadyForSecret
                    | SecretReceived
            ) =>
        {
            data.error.is_some()
        }
        _ => return Err(CoordinatorError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }),
    };

    if !required_ok {
        let field = missing_field_name(from, to);
        return Err(CoordinatorError::MissingData {
            to: to.to_string(),
            field,
        });
    }
    Ok(())
}

fn missing_field_name(from: OrderLifecycleState, to: OrderLifecycleState) -> &'static str {
    use OrderLifecycleState::*;
    match (from, to) {
        (New, AuctionStarted) => "order",
        (AuctionStarted, SrcLockPending) => "resolver/rate",
        (SrcLockPending, SrcLocked) => "src_tx_hash",
        (DstLockPending, DstLocked) => "dst_tx_hash",
        (ReadyForSecret, SecretReceived) => "secret",
        (_, Error) => "error",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuctionParams, Order, OrderHash};

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
    async fn happy_path_phases_are_monotonic() {
        let machine = FusionStateMachine::new();
        let hash = OrderHash("0xabc".into());
        machine.create(hash.clone(), sample_order()).await.unwrap();

        machine
            .transition(&hash, OrderLifecycleState::AuctionStarted, TransitionData {
                order: Some(sample_order()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(machine.get_state(&hash).await.unwrap().phase, 1);

        machine
            .transition(&hash, OrderLifecycleState::SrcLockPending, TransitionData {
                resolver: Some("r1".into()),
                rate: Some(1000),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(machine.get_state(&hash).await.unwrap().phase, 2);

        let err = machine
            .transition(&hash, OrderLifecycleState::SrcLocked, TransitionData::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::MissingData { .. }));

        machine
            .transition(&hash, OrderLifecycleState::SrcLocked, TransitionData {
                src_tx_hash: Some("0xtx".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(machine.get_state(&hash).await.unwrap().phase, 2);
    }

    #[tokio::test]
    async fn invalid_transition_rejected() {
        let machine = FusionStateMachine::new();
        let hash = OrderHash("0xabc".into());
        machine.create(hash.clone(), sample_order()).await.unwrap();

        let err = machine
            .transition(&hash, OrderLifecycleState::Executed, TransitionData::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn retry_only_legal_from_error() {
        let machine = FusionStateMachine::new();
        let hash = OrderHash("0xabc".into());
        machine.create(hash.clone(), sample_order()).await.unwrap();

        let err = machine.retry(&hash).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidTransition { .. }));

        machine
            .transition(&hash, OrderLifecycleState::Error, TransitionData {
                error: Some("boom".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        machine.retry(&hash).await.unwrap();
        let state = machine.get_state(&hash).await.unwrap();
        assert_eq!(state.current_state, OrderLifecycleState::New);
        assert_eq!(state.retry_count, 1);
    }

    #[tokio::test]
    async fn milestones_are_immutable_once_set() {
        let machine = FusionStateMachine::new();
        let hash = OrderHash("0xabc".into());
        machine.create(hash.clone(), sample_order()).await.unwrap();
        machine
            .transition(&hash, OrderLifecycleState::AuctionStarted, TransitionData {
                order: Some(sample_order()),
                ..Default::default()
            })
            .await
            .unwrap();
        let first = machine
            .get_state(&hash)
            .await
            .unwrap()
            .milestones
            .auction_started_at
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        // AuctionStarted cannot be re-entered from itself under the table,
        // but the milestone setter itself must be idempotent regardless.
        let mut state = machine.states.write().await;
        let s = state.get_mut(&hash).unwrap();
        apply_milestone(s, OrderLifecycleState::AuctionStarted, Utc::now());
        assert_eq!(s.milestones.auction_started_at.unwrap(), first);
    }
}
