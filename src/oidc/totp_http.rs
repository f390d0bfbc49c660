// ABOUTME: Session-guarded TOTP enrollment endpoint
// ABOUTME: Generates the shared secret, stores it encrypted at rest, and returns the provisioning URI once
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use super::login::session_from_cookie;
use crate::context::ServerResources;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::Arc;

/// Handle POST /oidc/v1/totp/enroll
///
/// The provisioning URI (and with it the plaintext secret) appears only in
/// this response; storage holds the AES-GCM ciphertext.
pub async fn handle_totp_enroll(
    State(resources): State<Arc<ServerResources>>,
    headers: HeaderMap,
) -> Response {
    let Some(session) = session_from_cookie(&resources, &headers).await else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "session required"})),
        )
            .into_response();
    };
    let user = match resources.database.get_user(session.user_id).await {
        Ok(Some(user)) => user,
        _ => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "session required"})),
            )
                .into_response()
        }
    };

    let issuer_host = resources
        .config
        .issuer_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .to_owned();

    let (ciphertext, uri) = match resources.totp_secrets.enroll(&issuer_host, &user.username) {
        Ok(pair) => pair,
        Err(error) => return error.into_response(),
    };

    if let Err(e) = resources
        .database
        .set_user_totp_secret(user.id, &ciphertext)
        .await
    {
        tracing::error!("TOTP enrollment storage failed: {e:#}");
        return crate::errors::AppError::database("TOTP enrollment failed").into_response();
    }

    tracing::info!(user_id = %user.id, "TOTP enrolled");

    Json(json!({ "otpauth_uri": uri })).into_response()
}
