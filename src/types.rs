//! Shared order data model (spec §3 "Order").

use serde::{Deserialize, Serialize};

use crate::hashing::{hex_hash, order_hash, OrderHashFields};

/// Hex-encoded 32-byte order hash, used as the key into every subsystem map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderHash(pub String);

impl OrderHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(hex_hash(&bytes))
    }
}

impl std::fmt::Display for OrderHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One point on the piecewise-linear Dutch-auction decay curve (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurvePoint {
    /// Seconds since auction start.
    pub offset_secs: u64,
    pub rate: u128,
}

/// Auction parameters carried on the order (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionParams {
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub end_time: chrono::DateTime<chrono::Utc>,
    pub start_rate: u128,
    pub end_rate: u128,
    /// Monotonically increasing offsets, monotonically non-increasing
    /// rates; `points[0]` must be `(0, start_rate)`.
    pub points: Vec<CurvePoint>,
}

impl AuctionParams {
    pub fn linear(
        start_time: chrono::DateTime<chrono::Utc>,
        end_time: chrono::DateTime<chrono::Utc>,
        start_rate: u128,
        end_rate: u128,
    ) -> Self {
        let duration = (end_time - start_time).num_seconds().max(1) as u64;
        Self {
            start_time,
            end_time,
            start_rate,
            end_rate,
            points: vec![
                CurvePoint { offset_secs: 0, rate: start_rate },
                CurvePoint { offset_secs: duration, rate: end_rate },
            ],
        }
    }
}

/// Optional partial-fill configuration carried on the order (spec §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PartialFillConfig {
    pub total_parts: u32,
    pub min_fill_amount: u128,
}

/// An order as accepted into the system. Created once; mutated only via the
/// state machine (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_hash: OrderHash,
    pub maker: String,
    pub src_chain_id: u64,
    pub src_token: String,
    pub making_amount: u128,
    pub dst_chain_id: u64,
    pub dst_token: String,
    pub taking_amount: u128,
    pub receiver: String,
    pub secret_hash: [u8; 32],
    pub auction: AuctionParams,
    pub partial_fill: Option<PartialFillConfig>,
}

/// Inbound request to create an order; the coordinator recomputes the hash
/// from these fields rather than trusting a caller-supplied one (spec
/// §4.7 "ProcessOrder").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub salt: u128,
    pub maker: String,
    pub receiver: String,
    pub allowed_sender: String,
    pub src_chain_id: u64,
    pub src_token: String,
    pub making_amount: u128,
    pub dst_chain_id: u64,
    pub dst_token: String,
    pub taking_amount: u128,
    pub secret_hash: [u8; 32],
    pub auction: AuctionParams,
    pub partial_fill: Option<PartialFillConfig>,
    pub verifying_contract: String,
    pub signature: Vec<u8>,
}

impl OrderRequest {
    pub fn compute_hash(&self) -> OrderHash {
        let fields = OrderHashFields {
            salt: self.salt,
            maker_asset: &self.src_token,
            taker_asset: &self.dst_token,
            maker: &self.maker,
            receiver: &self.receiver,
            allowed_sender: &self.allowed_sender,
            making_amount: self.making_amount,
            taking_amount: self.taking_amount,
            offsets: 0,
            interactions: &[],
            chain_id: self.src_chain_id,
            verifying_contract: &self.verifying_contract,
        };
        OrderHash::from_bytes(order_hash(&fields))
    }

    pub fn into_order(self, order_hash: OrderHash) -> Order {
        Order {
            order_hash,
            maker: self.maker,
            src_chain_id: self.src_chain_id,
            src_token: self.src_token,
            making_amount: self.making_amount,
            dst_chain_id: self.dst_chain_id,
            dst_token: self.dst_token,
            taking_amount: self.taking_amount,
            receiver: self.receiver,
            secret_hash: self.secret_hash,
            auction: self.auction,
            partial_fill: self.partial_fill,
        }
    }
}

/// A finalized chain event as delivered by a `ChainAdapter` (spec §6).
/// Non-finalized events never reach this type; the adapter filters them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEvent {
    pub event_type: ChainEventType,
    pub order_hash: OrderHash,
    pub tx_hash: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainEventType {
    SrcEscrowCreated,
    DstEscrowCreated,
    Withdrawal,
    Cancelled,
}
