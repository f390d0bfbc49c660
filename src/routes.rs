// ABOUTME: Top-level router assembly with tracing, request-id, and timeout middleware
// ABOUTME: Merges the OAuth2 and OIDC surfaces with the health probe
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use crate::context::ServerResources;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Per-request deadline; repository and provider calls inherit it through
/// the dropped-future cancellation path
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Assemble the application router
pub fn build_router(resources: Arc<ServerResources>) -> Router {
    Router::new()
        .merge(crate::oauth2::oauth2_router())
        .merge(crate::oidc::oidc_router())
        .route("/health", get(crate::health::handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(resources)
}
