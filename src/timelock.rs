//! C1: the timelock scheduler — per-order multi-phase timers with
//! at-most-once firing and restart recovery (spec §4.3).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::types::OrderHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimelockState {
    Created,
    FinalityPending,
    FinalityLocked,
    ExclusiveWithdraw,
    PublicWithdraw,
    CancellationPending,
    Expired,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduledTaskType {
    FinalityExpiry,
    ExclusiveExpiry,
    CancellationTrigger,
    RecoveryTrigger,
}

impl std::fmt::Display for ScheduledTaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Per-order timer state (spec §3 "Timelock"). All `Option<DateTime>`
/// fields are set at most once and, once set, satisfy the total ordering
/// `finalityLockStart <= finalityLockExpiry <= exclusiveWithdrawEnd <=
/// publicWithdrawStart <= dstCancellationStart <= srcCancellationStart <=
/// cancellationExpiry`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timelock {
    pub order_hash: OrderHash,
    pub src_escrow_created_at: Option<DateTime<Utc>>,
    pub dst_escrow_created_at: Option<DateTime<Utc>>,
    pub finality_lock_start: Option<DateTime<Utc>>,
    pub finality_lock_expiry: Option<DateTime<Utc>>,
    pub exclusive_withdraw_start: Option<DateTime<Utc>>,
    pub exclusive_withdraw_end: Option<DateTime<Utc>>,
    pub public_withdraw_start: Option<DateTime<Utc>>,
    pub dst_cancellation_start: Option<DateTime<Utc>>,
    pub src_cancellation_start: Option<DateTime<Utc>>,
    pub cancellation_expiry: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub state: TimelockStateOpt,
}

// `TimelockState` has no meaningful zero value, so `Timelock::default()`
// (used only to seed a fresh entry before `Created` is assigned) needs a
// thin wrapper that does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelockStateOpt(pub TimelockState);
impl Default for TimelockStateOpt {
    fn default() -> Self {
        TimelockStateOpt(TimelockState::Created)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub order_hash: OrderHash,
    pub task_type: ScheduledTaskType,
    pub execute_at: DateTime<Utc>,
    pub executed: bool,
}

impl ScheduledTask {
    pub fn make_id(order_hash: &OrderHash, task_type: ScheduledTaskType, execute_at: DateTime<Utc>) -> String {
        format!("{}_{}_{}", order_hash.0, task_type, execute_at.timestamp())
    }
}

#[derive(Debug, Clone)]
pub enum TimelockEvent {
    FinalityExpired { order_hash: OrderHash },
    ExclusiveExpired { order_hash: OrderHash },
    CancellationTriggered { order_hash: OrderHash },
    RecoveryTriggered { order_hash: OrderHash },
}

type HookFuture = Pin<Box<dyn Future<Output = CoordinatorResult<()>> + Send>>;
type Hook = Arc<dyn Fn(OrderHash) -> HookFuture + Send + Sync>;

/// C1. One scheduler instance per coordinator; timers are both in-memory
/// and expected to be journaled by the caller via `snapshot_tasks` /
/// `load_tasks` so §8 invariant 5 (at-most-once across restarts) holds.
pub struct TimelockScheduler {
    config: CoordinatorConfig,
    timelocks: RwLock<HashMap<OrderHash, Timelock>>,
    tasks: RwLock<HashMap<String, ScheduledTask>>,
    handles: RwLock<HashMap<OrderHash, Vec<JoinHandle<()>>>>,
    events: broadcast::Sender<TimelockEvent>,
    finality_hook: RwLock<Option<Hook>>,
    cancellation_hook: RwLock<Option<Hook>>,
}

impl TimelockScheduler {
    pub fn new(config: CoordinatorConfig) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(100);
        Arc::new(Self {
            config,
            timelocks: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            events,
            finality_hook: RwLock::new(None),
            cancellation_hook: RwLock::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimelockEvent> {
        self.events.subscribe()
    }

    /// Invoked on `FinalityExpiry` fire, before `TriggerSecretSharing`
    /// (spec §4.3 step 3) — wired to C3's secret release in the
    /// coordinator.
    pub async fn set_finality_hook<F, Fut>(&self, hook: F)
    where
        F: Fn(OrderHash) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoordinatorResult<()>> + Send + 'static,
    {
        *self.finality_hook.write().await = Some(Arc::new(move |h| Box::pin(hook(h))));
    }

    /// Invoked on `CancellationTrigger` fire (spec §4.3 step 5).
    pub async fn set_cancellation_hook<F, Fut>(&self, hook: F)
    where
        F: Fn(OrderHash) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoordinatorResult<()>> + Send + 'static,
    {
        *self.cancellation_hook.write().await = Some(Arc::new(move |h| Box::pin(hook(h))));
    }

    pub async fn create_timelock(&self, order_hash: OrderHash) {
        self.timelocks.write().await.insert(
            order_hash.clone(),
            Timelock {
                order_hash,
                ..Default::default()
            },
        );
    }

    pub async fn get_timelock(&self, order_hash: &OrderHash) -> Option<Timelock> {
        self.timelocks.read().await.get(order_hash).cloned()
    }

    /// Step 1-2 of spec §4.3: records escrow creation; once both sides are
    /// recorded, starts the finality lock and schedules `FinalityExpiry`.
    pub async fn set_escrow_created(self: &Arc<Self>, order_hash: &OrderHash, src: bool) -> CoordinatorResult<()> {
        let both_ready = {
            let mut timelocks = self.timelocks.write().await;
            let tl = timelocks
                .get_mut(order_hash)
                .ok_or_else(|| CoordinatorError::NotFound {
                    order_hash: order_hash.0.clone(),
                })?;
            let now = Utc::now();
            if src {
                tl.src_escrow_created_at.get_or_insert(now);
            } else {
                tl.dst_escrow_created_at.get_or_insert(now);
            }
            if tl.src_escrow_created_at.is_some()
                && tl.dst_escrow_created_at.is_some()
                && tl.finality_lock_start.is_none()
            {
                tl.finality_lock_start = Some(now);
                tl.finality_lock_expiry = Some(now + self.config.finality_lock_duration);
                tl.state.0 = TimelockState::FinalityPending;
                true
            } else {
                false
            }
        };

        if both_ready {
            let expiry = self
                .timelocks
                .read()
                .await
                .get(order_hash)
                .and_then(|t| t.finality_lock_expiry)
                .expect("just set");
            self.schedule(order_hash.clone(), ScheduledTaskType::FinalityExpiry, expiry)
                .await;
            info!(%order_hash, "finality lock started");
        }
        Ok(())
    }

    async fn schedule(self: &Arc<Self>, order_hash: OrderHash, task_type: ScheduledTaskType, execute_at: DateTime<Utc>) {
        let id = ScheduledTask::make_id(&order_hash, task_type, execute_at);
        {
            let mut tasks = self.tasks.write().await;
            if tasks.contains_key(&id) {
                return;
            }
            tasks.insert(
                id.clone(),
                ScheduledTask {
                    id: id.clone(),
                    order_hash: order_hash.clone(),
                    task_type,
                    execute_at,
                    executed: false,
                },
            );
        }
        self.spawn_timer(id, order_hash, execute_at).await;
    }

    async fn spawn_timer(self: &Arc<Self>, task_id: String, order_hash: OrderHash, execute_at: DateTime<Utc>) {
        let this = Arc::clone(self);
        let delay = (execute_at - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = this.fire(&task_id).await {
                warn!(%task_id, %err, "scheduled task failed to fire");
            }
        });
        self.handles.write().await.entry(order_hash).or_default().push(handle);
    }

    /// At-most-once firing (spec §4.3, §8 invariant 5): checks `executed`
    /// and sets it true under lock before dispatching.
    async fn fire(self: &Arc<Self>, task_id: &str) -> CoordinatorResult<()> {
        let task = {
            let mut tasks = self.tasks.write().await;
            let task = match tasks.get_mut(task_id) {
                Some(t) => t,
                None => return Ok(()),
            };
            if task.executed {
                return Ok(());
            }
            task.executed = true;
            task.clone()
        };

        match task.task_type {
            ScheduledTaskType::FinalityExpiry => self.on_finality_expiry(&task.order_hash).await?,
            ScheduledTaskType::ExclusiveExpiry => self.on_exclusive_expiry(&task.order_hash).await?,
            ScheduledTaskType::CancellationTrigger => self.on_cancellation_trigger(&task.order_hash).await?,
            ScheduledTaskType::RecoveryTrigger => self.on_recovery_trigger(&task.order_hash).await?,
        }
        Ok(())
    }

    async fn on_finality_expiry(self: &Arc<Self>, order_hash: &OrderHash) -> CoordinatorResult<()> {
        if let Some(hook) = self.finality_hook.read().await.clone() {
            hook(order_hash.clone()).await?;
        }
        let _ = self.events.send(TimelockEvent::FinalityExpired {
            order_hash: order_hash.clone(),
        });
        self.trigger_secret_sharing(order_hash).await
    }

    /// `TriggerSecretSharing` (spec §4.3 step 3): opens the exclusive
    /// withdrawal window and schedules both its expiry and the
    /// cancellation trigger.
    async fn trigger_secret_sharing(self: &Arc<Self>, order_hash: &OrderHash) -> CoordinatorResult<()> {
        let (exclusive_end, cancellation_at) = {
            let mut timelocks = self.timelocks.write().await;
            let tl = timelocks
                .get_mut(order_hash)
                .ok_or_else(|| CoordinatorError::NotFound {
                    order_hash: order_hash.0.clone(),
                })?;
            let now = Utc::now();
            tl.exclusive_withdraw_start.get_or_insert(now);
            let end = *tl
                .exclusive_withdraw_end
                .get_or_insert(now + self.config.resolver_exclusive_duration);
            tl.state.0 = TimelockState::FinalityLocked;
            let cancellation_at = now + self.config.cancellation_duration;
            (end, cancellation_at)
        };
        self.schedule(order_hash.clone(), ScheduledTaskType::ExclusiveExpiry, exclusive_end)
            .await;
        self.schedule(order_hash.clone(), ScheduledTaskType::CancellationTrigger, cancellation_at)
            .await;
        Ok(())
    }

    async fn on_exclusive_expiry(self: &Arc<Self>, order_hash: &OrderHash) -> CoordinatorResult<()> {
        let mut timelocks = self.timelocks.write().await;
        if let Some(tl) = timelocks.get_mut(order_hash) {
            tl.public_withdraw_start.get_or_insert(Utc::now());
            tl.state.0 = TimelockState::PublicWithdraw;
        }
        drop(timelocks);
        let _ = self.events.send(TimelockEvent::ExclusiveExpired {
            order_hash: order_hash.clone(),
        });
        Ok(())
    }

    async fn on_cancellation_trigger(self: &Arc<Self>, order_hash: &OrderHash) -> CoordinatorResult<()> {
        let recovery_at = {
            let mut timelocks = self.timelocks.write().await;
            let tl = timelocks
                .get_mut(order_hash)
                .ok_or_else(|| CoordinatorError::NotFound {
                    order_hash: order_hash.0.clone(),
                })?;
            let now = Utc::now();
            tl.dst_cancellation_start.get_or_insert(now);
            tl.src_cancellation_start
                .get_or_insert(now + self.config.cancellation_duration);
            tl.state.0 = TimelockState::CancellationPending;
            now + self.config.cancellation_duration * 2
        };

        if let Some(hook) = self.cancellation_hook.read().await.clone() {
            hook(order_hash.clone()).await?;
        }
        let _ = self.events.send(TimelockEvent::CancellationTriggered {
            order_hash: order_hash.clone(),
        });
        self.schedule(order_hash.clone(), ScheduledTaskType::RecoveryTrigger, recovery_at)
            .await;
        Ok(())
    }

    async fn on_recovery_trigger(self: &Arc<Self>, order_hash: &OrderHash) -> CoordinatorResult<()> {
        let mut timelocks = self.timelocks.write().await;
        if let Some(tl) = timelocks.get_mut(order_hash) {
            tl.cancellation_expiry = Some(Utc::now());
            tl.state.0 = TimelockState::Expired;
        }
        drop(timelocks);
        let _ = self.events.send(TimelockEvent::RecoveryTriggered {
            order_hash: order_hash.clone(),
        });
        Ok(())
    }

    /// `NotifyWithdrawalCompleted` (spec §4.3 step 7): marks the timelock
    /// `Completed` and cancels every pending timer for the order.
    pub async fn notify_withdrawal_completed(self: &Arc<Self>, order_hash: &OrderHash) -> CoordinatorResult<()> {
        {
            let mut timelocks = self.timelocks.write().await;
            let tl = timelocks
                .get_mut(order_hash)
                .ok_or_else(|| CoordinatorError::NotFound {
                    order_hash: order_hash.0.clone(),
                })?;
            tl.state.0 = TimelockState::Completed;
        }
        self.cancel_order_tasks(order_hash).await;
        Ok(())
    }

    /// `cancelOrderTasks(orderHash)` (spec §4.3): stops all pending timers
    /// for the order; they are never revived.
    pub async fn cancel_order_tasks(&self, order_hash: &OrderHash) {
        if let Some(handles) = self.handles.write().await.remove(order_hash) {
            for handle in handles {
                handle.abort();
            }
        }
    }

    /// Journal snapshot for durable storage (spec §9 "Timer storage").
    pub async fn snapshot_tasks(&self) -> Vec<ScheduledTask> {
        self.tasks.read().await.values().cloned().collect()
    }

    /// `(scheduled, fired)` totals for `Stats()` (spec §6).
    pub async fn task_counts(&self) -> (usize, usize) {
        let tasks = self.tasks.read().await;
        let fired = tasks.values().filter(|t| t.executed).count();
        (tasks.len(), fired)
    }

    /// Restart recovery (spec §4.3 "On restart"): reloads durable tasks,
    /// skips already-`executed` ones, and fires any whose `executeAt` is
    /// in the past immediately.
    pub async fn load_tasks(self: &Arc<Self>, loaded: Vec<ScheduledTask>) {
        for task in loaded {
            if task.executed {
                continue;
            }
            {
                let mut tasks = self.tasks.write().await;
                tasks.insert(task.id.clone(), task.clone());
            }
            self.spawn_timer(task.id, task.order_hash, task.execute_at).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            finality_lock_duration: chrono::Duration::milliseconds(20).to_std().unwrap(),
            resolver_exclusive_duration: chrono::Duration::milliseconds(20).to_std().unwrap(),
            cancellation_duration: chrono::Duration::milliseconds(20).to_std().unwrap(),
            ..CoordinatorConfig::default()
        }
    }

    #[tokio::test]
    async fn full_happy_path_sequence_fires_in_order() {
        let scheduler = TimelockScheduler::new(fast_config());
        let hash = OrderHash("0xabc".into());
        scheduler.create_timelock(hash.clone()).await;

        let mut events = scheduler.subscribe();
        scheduler.set_escrow_created(&hash, true).await.unwrap();
        scheduler.set_escrow_created(&hash, false).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            if let Ok(event) = tokio::time::timeout(StdDuration::from_millis(200), events.recv()).await {
                seen.push(format!("{:?}", event.unwrap()));
            }
        }
        assert!(seen.iter().any(|e| e.contains("FinalityExpired")));
        assert!(seen.iter().any(|e| e.contains("ExclusiveExpired")));
    }

    #[tokio::test]
    async fn notify_withdrawal_completed_cancels_pending_timers() {
        let scheduler = TimelockScheduler::new(CoordinatorConfig {
            finality_lock_duration: StdDuration::from_secs(60),
            ..CoordinatorConfig::default()
        });
        let hash = OrderHash("0xabc".into());
        scheduler.create_timelock(hash.clone()).await;
        scheduler.set_escrow_created(&hash, true).await.unwrap();
        scheduler.set_escrow_created(&hash, false).await.unwrap();

        scheduler.notify_withdrawal_completed(&hash).await.unwrap();
        let tl = scheduler.get_timelock(&hash).await.unwrap();
        assert_eq!(tl.state.0, TimelockState::Completed);
        assert!(scheduler.handles.read().await.get(&hash).is_none());
    }

    #[tokio::test]
    async fn restart_replay_fires_past_due_tasks_exactly_once() {
        let scheduler = TimelockScheduler::new(fast_config());
        let hash = OrderHash("0xabc".into());
        let past_due = ScheduledTask {
            id: ScheduledTask::make_id(&hash, ScheduledTaskType::FinalityExpiry, Utc::now()),
            order_hash: hash.clone(),
            task_type: ScheduledTaskType::FinalityExpiry,
            execute_at: Utc::now() - chrono::Duration::seconds(5),
            executed: false,
        };
        scheduler.create_timelock(hash.clone()).await;
        let mut events = scheduler.subscribe();
        scheduler.load_tasks(vec![past_due]).await;

        let event = tokio::time::timeout(StdDuration::from_millis(200), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, TimelockEvent::FinalityExpired { .. }));

        let tasks = scheduler.snapshot_tasks().await;
        assert_eq!(tasks.iter().filter(|t| t.executed).count(), 1);
    }
}
