use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;

use crate::coordinator::Coordinator;
use crate::error::CoordinatorError;
use crate::types::{OrderHash, OrderRequest};

pub async fn create_order(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<OrderRequest>,
) -> Result<Json<OrderHash>, CoordinatorError> {
    let order_hash = coordinator.process_order(request).await?;
    Ok(Json(order_hash))
}

pub async fn get_order(
    State(coordinator): State<Arc<Coordinator>>,
    Path(order_hash): Path<String>,
) -> Result<impl IntoResponse, CoordinatorError> {
    let order_hash = OrderHash(order_hash);
    match coordinator.get_order(&order_hash).await {
        Some(order) => Ok(Json(order)),
        None => Err(CoordinatorError::NotFound { order_hash: order_hash.0 }),
    }
}
