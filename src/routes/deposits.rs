use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::coordinator::Coordinator;
use crate::error::CoordinatorError;
use crate::types::OrderHash;

#[derive(Deserialize)]
pub struct ClaimDepositRequest {
    pub claimer: String,
    pub tx_hash: String,
}

pub async fn claim_deposit(
    State(coordinator): State<Arc<Coordinator>>,
    Path(order_hash): Path<String>,
    Json(request): Json<ClaimDepositRequest>,
) -> Result<Json<u128>, CoordinatorError> {
    let incentive = coordinator
        .claim_deposit(&OrderHash(order_hash), &request.claimer, request.tx_hash)
        .await?;
    Ok(Json(incentive))
}
