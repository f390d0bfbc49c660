// ABOUTME: Authorization endpoint (OAuth 2.1) - validates the request and redirects to login
// ABOUTME: Client/redirect-URI failures return direct HTTP errors; everything later redirects with error and state
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

//! GET /oauth2/v1/authorize
//!
//! Validation order is load-bearing (OAuth 2.1 §4.1.2.1): the (client,
//! redirect URI) pair is resolved first, and any failure there is a direct
//! HTTP error because redirecting to an unverified URI is an open
//! redirector. Every later failure redirects back to the verified
//! `redirect_uri` carrying `error` and the caller's `state`.

use crate::context::ServerResources;
use crate::crypto;
use crate::models::AuthorizationRequest;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Redirect, Response};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Build the error redirect back to a verified redirect URI
fn error_redirect(redirect_uri: &str, error: &str, state: Option<&str>) -> Response {
    let mut target = format!(
        "{redirect_uri}{}error={error}",
        if redirect_uri.contains('?') { '&' } else { '?' }
    );
    if let Some(state) = state {
        target.push_str("&state=");
        target.push_str(&urlencoding::encode(state));
    }
    Redirect::to(&target).into_response()
}

/// Handle GET /oauth2/v1/authorize
pub async fn handle_authorize(
    State(resources): State<Arc<ServerResources>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    // Step 1: resolve (client, redirect_uri). Failures here never redirect.
    let Some(client_id) = params.get("client_id") else {
        return crate::errors::AppError::invalid_request("client_id is required").into_response();
    };
    let Some(redirect_uri) = params.get("redirect_uri") else {
        return crate::errors::AppError::invalid_request("redirect_uri is required")
            .into_response();
    };

    let client = match resources.database.get_client_by_client_id(client_id).await {
        Ok(Some(client)) => client,
        Ok(None) => {
            return crate::errors::AppError::invalid_request("unknown client").into_response();
        }
        Err(e) => {
            tracing::error!("client lookup failed for client_id={client_id}: {e:#}");
            return crate::errors::AppError::internal("client lookup failed").into_response();
        }
    };

    if !client.redirect_uri_matches(redirect_uri) {
        tracing::warn!(client_id = %client_id, "redirect_uri not registered for client");
        return crate::errors::AppError::invalid_request("redirect_uri is not registered")
            .into_response();
    }

    // Step 2 onward: the redirect URI is verified; failures redirect with
    // `error` and `state`
    let state = params.get("state").map(String::as_str);

    if params.get("response_type").map(String::as_str) != Some("code") {
        return error_redirect(redirect_uri, "unsupported_response_type", state);
    }

    let scope = params.get("scope").cloned().unwrap_or_default();
    let requested_scopes: Vec<&str> = scope.split_whitespace().collect();
    if requested_scopes.is_empty() {
        return error_redirect(redirect_uri, "invalid_scope", state);
    }
    if !client.scopes_allowed(&requested_scopes) {
        return error_redirect(redirect_uri, "invalid_scope", state);
    }

    // PKCE is mandatory for every client, public or confidential
    let Some(code_challenge) = params.get("code_challenge") else {
        return error_redirect(redirect_uri, "invalid_request", state);
    };
    if params.get("code_challenge_method").map(String::as_str) != Some("S256") {
        // `plain` and absent both land here
        return error_redirect(redirect_uri, "invalid_request", state);
    }
    if crypto::validate_challenge(code_challenge).is_err() {
        return error_redirect(redirect_uri, "invalid_request", state);
    }

    let now = Utc::now();
    let request = AuthorizationRequest {
        id: Uuid::now_v7(),
        client_id: client.id,
        redirect_uri: redirect_uri.clone(),
        scope: requested_scopes.join(" "),
        state: params.get("state").cloned(),
        code_challenge: code_challenge.clone(),
        code_challenge_method: "S256".to_owned(),
        created_at: now,
        expires_at: now + Duration::seconds(resources.config.tokens.auth_code_secs),
        consumed: false,
        consumed_at: None,
        user_id: None,
        code: None,
        code_expires_at: None,
        row_version: 0,
    };

    if let Err(e) = resources.database.create_authorization_request(&request).await {
        tracing::error!("failed to persist authorization request: {e:#}");
        return error_redirect(redirect_uri, "server_error", state);
    }

    tracing::debug!(
        request_id = %request.id,
        client_id = %client.client_id,
        "authorization request accepted, redirecting to login"
    );

    Redirect::to(&resources.config.login_url(request.id)).into_response()
}
