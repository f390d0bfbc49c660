// ABOUTME: Router for the /oauth2/v1 surface
// ABOUTME: Authorize, token, introspect, revoke, and client secret rotation
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use crate::client_auth::PresentedCredentials;
use crate::context::ServerResources;
use crate::oauth2::models::OAuth2Error;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// Build the OAuth2 router
pub fn oauth2_router() -> Router<Arc<ServerResources>> {
    Router::new()
        .route("/oauth2/v1/authorize", get(super::authorize::handle_authorize))
        .route("/oauth2/v1/token", post(super::token::handle_token))
        .route("/oauth2/v1/introspect", post(super::token::handle_introspect))
        .route("/oauth2/v1/revoke", post(super::token::handle_revoke))
        .route(
            "/oauth2/v1/clients/:client_id/rotate-secret",
            post(handle_rotate_secret),
        )
}

/// Handle POST /oauth2/v1/clients/{id}/rotate-secret
///
/// The caller authenticates as the client being rotated with its current
/// (or in-grace) credentials; the plaintext replacement is returned exactly
/// once in this response.
async fn handle_rotate_secret(
    State(resources): State<Arc<ServerResources>>,
    Path(client_id): Path<String>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let presented = PresentedCredentials::from_request(&headers, &form);
    let authenticated = match resources.client_auth.authenticate(&presented).await {
        Ok(client) => client,
        Err(error) => return OAuth2Error::from(&error).into_response(),
    };

    if authenticated.client_id != client_id {
        return OAuth2Error::invalid_client().into_response();
    }

    let actor = form
        .get("actor")
        .cloned()
        .unwrap_or_else(|| authenticated.client_id.clone());
    let reason = form
        .get("reason")
        .cloned()
        .unwrap_or_else(|| "operator rotation".to_owned());

    match resources.rotation.rotate(&client_id, &actor, &reason).await {
        Ok(rotated) => Json(json!({
            "client_id": client_id,
            "client_secret": rotated.plaintext,
            "secret_version": rotated.new_version,
            "previous_version": rotated.old_version,
        }))
        .into_response(),
        Err(error) => OAuth2Error::from(&error).into_response(),
    }
}
