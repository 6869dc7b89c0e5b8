use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::coordinator::Coordinator;
use crate::error::CoordinatorError;
use crate::types::OrderHash;

#[derive(Deserialize)]
pub struct ExecuteFillRequest {
    pub resolver_id: String,
    pub amount: u128,
    pub tx_hash: String,
}

pub async fn execute_fill(
    State(coordinator): State<Arc<Coordinator>>,
    Path(order_hash): Path<String>,
    Json(request): Json<ExecuteFillRequest>,
) -> Result<Json<bool>, CoordinatorError> {
    let completed = coordinator
        .execute_fill(
            &OrderHash(order_hash),
            &request.resolver_id,
            request.amount,
            request.tx_hash,
        )
        .await?;
    Ok(Json(completed))
}
