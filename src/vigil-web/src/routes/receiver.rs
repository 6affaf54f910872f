//! Inbound JSON receiver

use axum::Json;
use serde_json::{json, Value};
use tracing::info;

/// POST /receive_data
pub async fn receive_data(Json(data): Json<Value>) -> Json<Value> {
    info!("received json data: {}", data);
    Json(json!({
        "status": "success",
        "message": "Data received and logged",
    }))
}
