//! Error taxonomy shared by every subsystem (spec §7).
//!
//! Each variant maps 1:1 onto a named error kind from the spec so the
//! transport layer can assign a stable error code without re-deriving the
//! mapping from a message string.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("no transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("transition to {to} is missing required field: {field}")]
    MissingData { to: String, field: &'static str },

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("secret already stored for order {order_hash} with a different value")]
    SecretConflict { order_hash: String },

    #[error("finality lock has not elapsed for order {order_hash}")]
    FinalityNotReached { order_hash: String },

    #[error("auction for order {order_hash} is not active")]
    AuctionNotActive { order_hash: String },

    #[error("bid rate {bid_rate} is below the current auction rate {current_rate}")]
    BidBelowRate { bid_rate: u128, current_rate: u128 },

    #[error("resolver {resolver_id} is not registered or not KYC-approved")]
    UnknownResolver { resolver_id: String },

    #[error("deposit for order {order_hash} is not claimable")]
    NotClaimable { order_hash: String },

    #[error("claim deadline has passed for order {order_hash}")]
    DeadlinePassed { order_hash: String },

    #[error("deposit amount {amount} is out of range [{min}, {max}]")]
    DepositOutOfRange { amount: u128, min: u128, max: u128 },

    #[error("a safety deposit already exists for order {order_hash}")]
    DuplicateDeposit { order_hash: String },

    #[error("invalid fill amount {amount} for order {order_hash}: {reason}")]
    InvalidFillAmount {
        order_hash: String,
        amount: u128,
        reason: &'static str,
    },

    #[error("order {order_hash} has no remaining parts to fill")]
    PartsExhausted { order_hash: String },

    #[error("dropped unfinalized chain event for order {order_hash}")]
    ChainEventDropped { order_hash: String },

    #[error("transient error, retryable: {reason}")]
    Transient { reason: String },

    #[error("order {order_hash} not found")]
    NotFound { order_hash: String },

    #[error("duplicate order {order_hash}")]
    DuplicateOrder { order_hash: String },

    #[error("unsupported chain id {chain_id}")]
    UnsupportedChain { chain_id: u64 },

    #[error("not eligible to claim order {order_hash}")]
    NotEligible { order_hash: String },
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl CoordinatorError {
    fn status_code(&self) -> StatusCode {
        use CoordinatorError::*;
        match self {
            NotFound { .. } => StatusCode::NOT_FOUND,
            DuplicateOrder { .. } | DuplicateDeposit { .. } | SecretConflict { .. } => StatusCode::CONFLICT,
            InvalidSignature | UnknownResolver { .. } | NotEligible { .. } => StatusCode::FORBIDDEN,
            InvalidTransition { .. }
            | MissingData { .. }
            | BidBelowRate { .. }
            | DepositOutOfRange { .. }
            | InvalidFillAmount { .. }
            | PartsExhausted { .. }
            | AuctionNotActive { .. }
            | FinalityNotReached { .. }
            | NotClaimable { .. }
            | DeadlinePassed { .. }
            | UnsupportedChain { .. } => StatusCode::BAD_REQUEST,
            ChainEventDropped { .. } | Transient { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody { error: self.to_string() };
        (status, Json(body)).into_response()
    }
}
