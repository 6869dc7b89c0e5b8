use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use crate::coordinator::{Coordinator, Stats};

pub async fn get_stats(State(coordinator): State<Arc<Coordinator>>) -> Json<Stats> {
    Json(coordinator.stats().await)
}
