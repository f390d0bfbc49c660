// ABOUTME: Session termination endpoint - deletes the session and revokes its user's tokens
// ABOUTME: CSRF-guarded like every form submission; the session cookie is expired in the response
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use super::cookies::{expire_cookie, SESSION_COOKIE};
use super::login::{csrf_matches, session_from_cookie};
use crate::context::ServerResources;
use axum::extract::State;
use axum::http::{header::SET_COOKIE, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Form;
use std::collections::HashMap;
use std::sync::Arc;

/// Handle POST /oidc/v1/logout
pub async fn handle_logout(
    State(resources): State<Arc<ServerResources>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let Some(session) = session_from_cookie(&resources, &headers).await else {
        // Nothing to terminate; still clear the cookie
        let mut response = StatusCode::NO_CONTENT.into_response();
        if let Ok(cookie) = expire_cookie(SESSION_COOKIE).parse() {
            response.headers_mut().append(SET_COOKIE, cookie);
        }
        return response;
    };

    let csrf_ok = form
        .get("csrf_token")
        .is_some_and(|token| csrf_matches(token, &session.csrf_token));
    if !csrf_ok {
        return StatusCode::FORBIDDEN.into_response();
    }

    if let Err(e) = resources.database.delete_session(session.id).await {
        tracing::error!("session deletion failed: {e:#}");
        return crate::errors::AppError::database("session deletion failed").into_response();
    }
    if let Err(e) = resources
        .database
        .revoke_tokens_for_user(session.user_id)
        .await
    {
        tracing::error!("token revocation at logout failed: {e:#}");
        return crate::errors::AppError::database("token revocation failed").into_response();
    }

    tracing::info!(user_id = %session.user_id, "session terminated");

    let mut response = StatusCode::NO_CONTENT.into_response();
    if let Ok(cookie) = expire_cookie(SESSION_COOKIE).parse() {
        response.headers_mut().append(SET_COOKIE, cookie);
    }
    response
}
