//! Thin Axum transport shell over the coordinator API (spec §6).

mod bids;
mod deposits;
mod fills;
mod orders;
mod secrets;
mod stats;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::coordinator::Coordinator;

pub fn build_router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/api/orders", post(orders::create_order))
        .route("/api/orders/{order_hash}", get(orders::get_order))
        .route("/api/orders/{order_hash}/bids", post(bids::place_bid))
        .route("/api/orders/{order_hash}/fills", post(fills::execute_fill))
        .route("/api/orders/{order_hash}/secret", post(secrets::reveal_secret))
        .route("/api/orders/{order_hash}/deposit/claim", post(deposits::claim_deposit))
        .route("/api/stats", get(stats::get_stats))
        .with_state(coordinator)
}
