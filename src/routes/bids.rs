use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use crate::auction::Bid;
use crate::coordinator::Coordinator;
use crate::error::CoordinatorError;
use crate::types::OrderHash;

#[derive(Deserialize)]
pub struct PlaceBidRequest {
    pub resolver_id: String,
    pub bid_rate: u128,
    pub safety_deposit_amount: u128,
}

pub async fn place_bid(
    State(coordinator): State<Arc<Coordinator>>,
    Path(order_hash): Path<String>,
    Json(request): Json<PlaceBidRequest>,
) -> Result<Json<bool>, CoordinatorError> {
    let won = coordinator
        .place_bid(Bid {
            order_hash: OrderHash(order_hash),
            resolver_id: request.resolver_id,
            bid_rate: request.bid_rate,
            safety_deposit_amount: request.safety_deposit_amount,
            submitted_at: Utc::now(),
        })
        .await?;
    Ok(Json(won))
}
