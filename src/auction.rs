//! C4: the Dutch-auction resolver-selection engine (spec §4.2).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::info;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::types::{AuctionParams, OrderHash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuctionStatus {
    Pending,
    Active,
    Won,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub order_hash: OrderHash,
    pub resolver_id: String,
    pub bid_rate: u128,
    pub safety_deposit_amount: u128,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Auction {
    pub order_hash: OrderHash,
    pub params: AuctionParams,
    pub status: AuctionStatus,
    pub current_rate: u128,
    pub winning_resolver_id: Option<String>,
    pub bids: Vec<Bid>,
}

#[derive(Debug, Clone)]
pub struct Resolver {
    pub id: String,
    pub kyc_approved: bool,
    pub total_deposits: u128,
    pub active_orders: u32,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum AuctionEvent {
    Started { order_hash: OrderHash },
    Won { order_hash: OrderHash, resolver_id: String, rate: u128 },
    Expired { order_hash: OrderHash },
}

/// Shared `tick`/`tick_all` body: activates a due `Pending` auction,
/// refreshes `currentRate` on an `Active` one, and expires it past
/// `endTime`.
fn apply_tick(auction: &mut Auction, now: DateTime<Utc>) -> Option<AuctionEvent> {
    if auction.status == AuctionStatus::Pending && now >= auction.params.start_time {
        auction.status = AuctionStatus::Active;
    }
    if auction.status == AuctionStatus::Active {
        auction.current_rate = current_rate(&auction.params, now);
        if now >= auction.params.end_time {
            auction.status = AuctionStatus::Expired;
            return Some(AuctionEvent::Expired {
                order_hash: auction.order_hash.clone(),
            });
        }
    }
    None
}

/// `currentRate(t)` per spec §4.2: before `startTime` returns `startRate`,
/// after the last point returns `endRate`, otherwise linear interpolation
/// on the active segment. Pure function, no randomness.
pub fn current_rate(params: &AuctionParams, now: DateTime<Utc>) -> u128 {
    if now <= params.start_time {
        return params.start_rate;
    }
    let elapsed = (now - params.start_time).num_seconds().max(0) as u64;
    let points = &params.points;
    if elapsed >= points.last().unwrap().offset_secs {
        return params.end_rate;
    }
    for window in points.windows(2) {
        let (a, b) = (window[0], window[1]);
        if elapsed >= a.offset_secs && elapsed <= b.offset_secs {
            let span = (b.offset_secs - a.offset_secs).max(1);
            let progressed = elapsed - a.offset_secs;
            let rate_drop = a.rate.saturating_sub(b.rate);
            let interpolated = rate_drop * u128::from(progressed) / u128::from(span);
            return a.rate.saturating_sub(interpolated);
        }
    }
    params.start_rate
}

/// C4. Owns auctions and the resolver registry behind single-writer locks,
/// mirroring the §5 "single-writer lock over in-memory maps" discipline.
pub struct AuctionEngine {
    auctions: RwLock<HashMap<OrderHash, Auction>>,
    resolvers: RwLock<HashMap<String, Resolver>>,
    events: broadcast::Sender<AuctionEvent>,
}

impl AuctionEngine {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(100);
        Self {
            auctions: RwLock::new(HashMap::new()),
            resolvers: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuctionEvent> {
        self.events.subscribe()
    }

    pub async fn register_resolver(&self, id: String, kyc_approved: bool) {
        self.resolvers.write().await.insert(
            id.clone(),
            Resolver {
                id,
                kyc_approved,
                total_deposits: 0,
                active_orders: 0,
                last_activity: Utc::now(),
            },
        );
    }

    pub async fn get_resolver(&self, id: &str) -> Option<Resolver> {
        self.resolvers.read().await.get(id).cloned()
    }

    /// `StartAuction(order)` (spec §4.2): seeds the auction in `Pending`
    /// and immediately activates it if `startTime` has already arrived,
    /// matching how the coordinator calls this synchronously right after
    /// order creation.
    pub async fn start_auction(&self, order_hash: OrderHash, params: AuctionParams) -> CoordinatorResult<()> {
        let now = Utc::now();
        let status = if now >= params.start_time {
            AuctionStatus::Active
        } else {
            AuctionStatus::Pending
        };
        let rate = current_rate(&params, now);
        self.auctions.write().await.insert(
            order_hash.clone(),
            Auction {
                order_hash: order_hash.clone(),
                params,
                status,
                current_rate: rate,
                winning_resolver_id: None,
                bids: Vec::new(),
            },
        );
        let _ = self.events.send(AuctionEvent::Started { order_hash: order_hash.clone() });
        info!(%order_hash, "auction started");
        Ok(())
    }

    /// Activate a still-`Pending` auction whose `startTime` has arrived;
    /// called from the tick loop (spec §4.2 "Updates to currentRate occur
    /// on each bid-submission or rate-tick").
    pub async fn tick(&self, order_hash: &OrderHash, now: DateTime<Utc>) -> CoordinatorResult<Option<AuctionEvent>> {
        let mut auctions = self.auctions.write().await;
        let auction = auctions.get_mut(order_hash).ok_or_else(|| CoordinatorError::NotFound {
            order_hash: order_hash.0.clone(),
        })?;
        Ok(apply_tick(auction, now))
    }

    /// Ticks every `Pending`/`Active` auction in one pass, for the
    /// coordinator's background tick loop (spec §4.2 "rate-tick",
    /// §8 scenario S3). Auctions already `Won`/`Expired`/`Cancelled` are
    /// untouched.
    pub async fn tick_all(&self, now: DateTime<Utc>) -> Vec<AuctionEvent> {
        let mut auctions = self.auctions.write().await;
        auctions.values_mut().filter_map(|auction| apply_tick(auction, now)).collect()
    }

    /// `PlaceBid(bid)` (spec §4.2). First bid meeting the current rate
    /// wins; ties are broken by submission order because admission is
    /// serialized under this single write lock (§8 invariant 3).
    pub async fn place_bid(&self, bid: Bid) -> CoordinatorResult<bool> {
        {
            let resolvers = self.resolvers.read().await;
            let resolver = resolvers
                .get(&bid.resolver_id)
                .ok_or_else(|| CoordinatorError::UnknownResolver {
                    resolver_id: bid.resolver_id.clone(),
                })?;
            if !resolver.kyc_approved {
                return Err(CoordinatorError::UnknownResolver {
                    resolver_id: bid.resolver_id.clone(),
                });
            }
        }

        let mut auctions = self.auctions.write().await;
        let auction = auctions
            .get_mut(&bid.order_hash)
            .ok_or_else(|| CoordinatorError::NotFound {
                order_hash: bid.order_hash.0.clone(),
            })?;

        if auction.status != AuctionStatus::Active {
            return Err(CoordinatorError::AuctionNotActive {
                order_hash: bid.order_hash.0.clone(),
            });
        }

        let rate_now = current_rate(&auction.params, bid.submitted_at);
        if bid.bid_rate < rate_now {
            return Err(CoordinatorError::BidBelowRate {
                bid_rate: bid.bid_rate,
                current_rate: rate_now,
            });
        }

        auction.bids.push(bid.clone());
        let won = auction.status == AuctionStatus::Active && auction.winning_resolver_id.is_none();
        if won {
            auction.status = AuctionStatus::Won;
            auction.winning_resolver_id = Some(bid.resolver_id.clone());
            auction.current_rate = bid.bid_rate;
            let _ = self.events.send(AuctionEvent::Won {
                order_hash: bid.order_hash.clone(),
                resolver_id: bid.resolver_id.clone(),
                rate: bid.bid_rate,
            });
            info!(order_hash = %bid.order_hash, resolver_id = %bid.resolver_id, rate = bid.bid_rate, "auction won");
        }
        Ok(won)
    }

    pub async fn get_auction(&self, order_hash: &OrderHash) -> Option<Auction> {
        self.auctions.read().await.get(order_hash).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.auctions
            .read()
            .await
            .values()
            .filter(|a| a.status == AuctionStatus::Active)
            .count()
    }
}

impl Default for AuctionEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AuctionParams {
        AuctionParams::linear(Utc::now(), Utc::now() + chrono::Duration::seconds(120), 1000, 900)
    }

    #[test]
    fn rate_is_monotonically_non_increasing() {
        let p = params();
        let t0 = current_rate(&p, p.start_time);
        let t1 = current_rate(&p, p.start_time + chrono::Duration::seconds(60));
        let t2 = current_rate(&p, p.start_time + chrono::Duration::seconds(120));
        assert!(t0 >= t1);
        assert!(t1 >= t2);
        assert_eq!(t0, 1000);
        assert_eq!(t2, 900);
    }

    #[test]
    fn rate_clamps_before_start_and_after_end() {
        let p = params();
        assert_eq!(current_rate(&p, p.start_time - chrono::Duration::seconds(10)), 1000);
        assert_eq!(current_rate(&p, p.end_time + chrono::Duration::seconds(10)), 900);
    }

    #[tokio::test]
    async fn first_bid_meeting_rate_wins() {
        let engine = AuctionEngine::new();
        engine.register_resolver("r1".into(), true).await;
        engine.register_resolver("r2".into(), true).await;
        let hash = OrderHash("0xabc".into());
        engine.start_auction(hash.clone(), params()).await.unwrap();

        let won = engine
            .place_bid(Bid {
                order_hash: hash.clone(),
                resolver_id: "r1".into(),
                bid_rate: 1000,
                safety_deposit_amount: 10,
                submitted_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(won);

        let err = engine
            .place_bid(Bid {
                order_hash: hash.clone(),
                resolver_id: "r2".into(),
                bid_rate: 1000,
                safety_deposit_amount: 10,
                submitted_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::AuctionNotActive { .. }));
    }

    #[tokio::test]
    async fn bid_below_rate_is_rejected() {
        let engine = AuctionEngine::new();
        engine.register_resolver("r1".into(), true).await;
        let hash = OrderHash("0xabc".into());
        engine.start_auction(hash.clone(), params()).await.unwrap();

        let err = engine
            .place_bid(Bid {
                order_hash: hash.clone(),
                resolver_id: "r1".into(),
                bid_rate: 1,
                safety_deposit_amount: 10,
                submitted_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::BidBelowRate { .. }));
    }

    #[tokio::test]
    async fn unregistered_resolver_rejected() {
        let engine = AuctionEngine::new();
        let hash = OrderHash("0xabc".into());
        engine.start_auction(hash.clone(), params()).await.unwrap();
        let err = engine
            .place_bid(Bid {
                order_hash: hash,
                resolver_id: "ghost".into(),
                bid_rate: 1000,
                safety_deposit_amount: 10,
                submitted_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownResolver { .. }));
    }

    #[tokio::test]
    async fn expiry_with_no_bids() {
        let engine = AuctionEngine::new();
        let hash = OrderHash("0xabc".into());
        let mut p = params();
        p.end_time = Utc::now() - chrono::Duration::seconds(1);
        engine.start_auction(hash.clone(), p).await.unwrap();
        let event = engine.tick(&hash, Utc::now()).await.unwrap();
        assert!(matches!(event, Some(AuctionEvent::Expired { .. })));
        assert_eq!(engine.get_auction(&hash).await.unwrap().status, AuctionStatus::Expired);
    }

    #[tokio::test]
    async fn tick_all_expires_only_due_auctions() {
        let engine = AuctionEngine::new();
        let expiring = OrderHash("0xexpiring".into());
        let mut due = params();
        due.end_time = Utc::now() - chrono::Duration::seconds(1);
        engine.start_auction(expiring.clone(), due).await.unwrap();

        let still_running = OrderHash("0xrunning".into());
        engine.start_auction(still_running.clone(), params()).await.unwrap();

        let events = engine.tick_all(Utc::now()).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], AuctionEvent::Expired { order_hash } if *order_hash == expiring));
        assert_eq!(engine.get_auction(&expiring).await.unwrap().status, AuctionStatus::Expired);
        assert_eq!(engine.get_auction(&still_running).await.unwrap().status, AuctionStatus::Active);
    }
}
