use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::coordinator::Coordinator;
use crate::error::CoordinatorError;
use crate::types::OrderHash;

#[derive(Deserialize)]
pub struct RevealSecretRequest {
    pub secret: String,
    pub maker_address: String,
}

pub async fn reveal_secret(
    State(coordinator): State<Arc<Coordinator>>,
    Path(order_hash): Path<String>,
    Json(request): Json<RevealSecretRequest>,
) -> Result<(), CoordinatorError> {
    coordinator
        .process_secret_reveal(&OrderHash(order_hash), request.secret, request.maker_address)
        .await
}
