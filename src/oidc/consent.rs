// ABOUTME: Consent flow - scope approval, consent reuse, code minting, and the final client redirect
// ABOUTME: A code is minted only onto a request with a bound user; reuse of a covering consent skips the prompt
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use super::login::{csrf_matches, load_live_request, session_from_cookie};
use super::pages::{self, ErrorCategory};
use crate::context::ServerResources;
use crate::crypto;
use crate::database::CAS_MAX_RETRIES;
use crate::models::{AuthorizationRequest, ConsentDecision, Session};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Form;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Redirect back to the client with `error` and `state`
fn error_redirect(request: &AuthorizationRequest, error: &str) -> Response {
    let mut target = format!(
        "{}{}error={error}",
        request.redirect_uri,
        if request.redirect_uri.contains('?') {
            '&'
        } else {
            '?'
        }
    );
    if let Some(state) = &request.state {
        target.push_str("&state=");
        target.push_str(&urlencoding::encode(state));
    }
    Redirect::to(&target).into_response()
}

/// Mint the authorization code onto the request and redirect to the client
///
/// The code-set is a conditional update guarded by the request's row
/// version and `user_id IS NOT NULL`; a code can never exist without a
/// resolved user.
async fn issue_code_and_redirect(
    resources: &ServerResources,
    request: &AuthorizationRequest,
) -> Response {
    let Ok(code) = crypto::generate_token() else {
        return crate::errors::AppError::crypto("code generation failed").into_response();
    };

    let now = Utc::now();
    let code_expires_at = now + Duration::seconds(resources.config.tokens.auth_code_secs);

    let mut observed = request.clone();
    for attempt in 0..CAS_MAX_RETRIES {
        match resources
            .database
            .set_code_on_request(observed.id, &code, code_expires_at, observed.row_version, now)
            .await
        {
            Ok(true) => {
                let mut target = format!(
                    "{}{}code={}",
                    observed.redirect_uri,
                    if observed.redirect_uri.contains('?') {
                        '&'
                    } else {
                        '?'
                    },
                    urlencoding::encode(&code)
                );
                if let Some(state) = &observed.state {
                    target.push_str("&state=");
                    target.push_str(&urlencoding::encode(state));
                }
                return Redirect::to(&target).into_response();
            }
            Ok(false) => {
                // Re-read; a parallel submission may have minted already
                match resources
                    .database
                    .get_authorization_request(observed.id)
                    .await
                {
                    Ok(Some(fresh)) => {
                        if fresh.code.is_some() || fresh.consumed {
                            return error_redirect(&fresh, "access_denied");
                        }
                        observed = fresh;
                    }
                    _ => break,
                }
                if attempt + 1 < CAS_MAX_RETRIES {
                    // Jittered backoff before the retry
                    let jitter = u64::from(rand::random::<u8>() % 50);
                    tokio::time::sleep(std::time::Duration::from_millis(10 + jitter)).await;
                }
            }
            Err(e) => {
                tracing::error!("code minting failed: {e:#}");
                break;
            }
        }
    }

    error_redirect(request, "server_error")
}

/// After authentication: reuse a covering consent or show the prompt
pub(super) async fn proceed_after_authentication(
    resources: &ServerResources,
    session: &Session,
    request: &AuthorizationRequest,
) -> Response {
    let requested: Vec<&str> = request.scope.split_whitespace().collect();
    let now = Utc::now();

    match resources
        .database
        .get_consent(session.user_id, request.client_id, now)
        .await
    {
        Ok(Some(consent)) if consent.covers(&requested, now) => {
            issue_code_and_redirect(resources, request).await
        }
        Ok(_) => Redirect::to(&format!("/oidc/v1/consent?request_id={}", request.id))
            .into_response(),
        Err(e) => {
            tracing::error!("consent lookup failed: {e:#}");
            error_redirect(request, "server_error")
        }
    }
}

/// Handle GET /oidc/v1/consent
pub async fn handle_consent_page(
    State(resources): State<Arc<ServerResources>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(session) = session_from_cookie(&resources, &headers).await else {
        return (
            StatusCode::UNAUTHORIZED,
            Html(pages::error_page(ErrorCategory::SessionExpired)),
        )
            .into_response();
    };
    let Some(request_id) = params.get("request_id") else {
        return (
            StatusCode::BAD_REQUEST,
            Html(pages::error_page(ErrorCategory::CodeExpired)),
        )
            .into_response();
    };
    let request = match load_live_request(&resources, request_id).await {
        Ok(request) => request,
        Err(response) => return response,
    };
    if request.user_id != Some(session.user_id) {
        return (
            StatusCode::FORBIDDEN,
            Html(pages::error_page(ErrorCategory::SessionExpired)),
        )
            .into_response();
    }

    // A covering consent recorded since login skips the prompt
    let requested: Vec<&str> = request.scope.split_whitespace().collect();
    let now = Utc::now();
    if let Ok(Some(consent)) = resources
        .database
        .get_consent(session.user_id, request.client_id, now)
        .await
    {
        if consent.covers(&requested, now) {
            return issue_code_and_redirect(&resources, &request).await;
        }
    }

    let client_name = resources
        .database
        .get_client(request.client_id)
        .await
        .ok()
        .flatten()
        .map_or_else(|| "the application".to_owned(), |c| c.name);

    Html(pages::consent_page(
        request_id,
        &session.csrf_token,
        &client_name,
        &requested,
    ))
    .into_response()
}

/// Handle POST /oidc/v1/consent
pub async fn handle_consent_submit(
    State(resources): State<Arc<ServerResources>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let Some(session) = session_from_cookie(&resources, &headers).await else {
        return (
            StatusCode::UNAUTHORIZED,
            Html(pages::error_page(ErrorCategory::SessionExpired)),
        )
            .into_response();
    };

    let (Some(request_id), Some(csrf_token)) = (form.get("request_id"), form.get("csrf_token"))
    else {
        return (
            StatusCode::BAD_REQUEST,
            Html(pages::error_page(ErrorCategory::SessionExpired)),
        )
            .into_response();
    };
    if !csrf_matches(csrf_token, &session.csrf_token) {
        return (
            StatusCode::FORBIDDEN,
            Html(pages::error_page(ErrorCategory::SessionExpired)),
        )
            .into_response();
    }

    let request = match load_live_request(&resources, request_id).await {
        Ok(request) => request,
        Err(response) => return response,
    };
    if request.user_id != Some(session.user_id) {
        return (
            StatusCode::FORBIDDEN,
            Html(pages::error_page(ErrorCategory::SessionExpired)),
        )
            .into_response();
    }

    if form.get("action").map(String::as_str) != Some("approve") {
        return error_redirect(&request, "access_denied");
    }

    let now = Utc::now();
    let consent = ConsentDecision {
        id: Uuid::now_v7(),
        user_id: session.user_id,
        client_id: request.client_id,
        scopes: request
            .scope
            .split_whitespace()
            .map(str::to_owned)
            .collect(),
        created_at: now,
        expires_at: now + ConsentDecision::ttl(),
    };
    if let Err(e) = resources.database.upsert_consent(&consent).await {
        tracing::error!("consent upsert failed: {e:#}");
        return error_redirect(&request, "server_error");
    }

    issue_code_and_redirect(&resources, &request).await
}
