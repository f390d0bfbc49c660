// ABOUTME: Liveness probe for deployment orchestration
// ABOUTME: Reports service identity, version, and delivery-provider health
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use crate::context::ServerResources;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

/// Handle GET /health
pub async fn handle_health(State(resources): State<Arc<ServerResources>>) -> Json<Value> {
    let delivery_healthy = resources.otp.delivery_healthy().await;

    Json(json!({
        "service": "aegis-idp",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "ok",
        "delivery_provider": if delivery_healthy { "ok" } else { "degraded" },
    }))
}
