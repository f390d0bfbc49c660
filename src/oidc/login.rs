// ABOUTME: Login flow - credential prompt, adaptive step-up, session establishment
// ABOUTME: Failures render category-only pages and never disclose whether a username exists
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

//! Login handlers
//!
//! GET renders the credential prompt with a double-submit CSRF cookie.
//! POST verifies the password, establishes a session at the `password`
//! assurance level, binds the user to the authorization request, and asks
//! the orchestrator whether step-up is required before consent.

use super::consent::proceed_after_authentication;
use super::cookies::{build_cookie, get_cookie, CSRF_COOKIE, SESSION_COOKIE};
use super::pages::{self, ErrorCategory};
use crate::context::ServerResources;
use crate::crypto;
use crate::database::CAS_MAX_RETRIES;
use crate::mfa::orchestrator::RiskContext;
use crate::models::{
    AssuranceLevel, AuthorizationRequest, ChallengeKind, Session, User, UserStatus,
};
use axum::extract::{Query, State};
use axum::http::{header::SET_COOKIE, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Form;
use chrono::{Duration, Timelike, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Best-effort client IP: first X-Forwarded-For hop, else unknown
pub(super) fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map_or_else(|| "unknown".to_owned(), |ip| ip.trim().to_owned())
}

/// Short digest of the user agent string, for risk context and session records
pub(super) fn user_agent_digest(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|ua| hex::encode(&Sha256::digest(ua.as_bytes())[..8]))
}

/// Constant-time comparison of CSRF tokens
pub(super) fn csrf_matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Load a live authorization request or render the expiry page
pub(super) async fn load_live_request(
    resources: &ServerResources,
    request_id: &str,
) -> Result<AuthorizationRequest, Response> {
    let error = || {
        (
            StatusCode::BAD_REQUEST,
            Html(pages::error_page(ErrorCategory::CodeExpired)),
        )
            .into_response()
    };

    let id = Uuid::parse_str(request_id).map_err(|_| error())?;
    let request = resources
        .database
        .get_authorization_request(id)
        .await
        .map_err(|e| {
            tracing::error!("authorization request lookup failed: {e:#}");
            error()
        })?
        .ok_or_else(error)?;

    if request.consumed || request.is_expired(Utc::now()) {
        return Err(error());
    }
    Ok(request)
}

/// Resolve the live session behind the request's cookie
pub(super) async fn session_from_cookie(
    resources: &ServerResources,
    headers: &HeaderMap,
) -> Option<Session> {
    let token = get_cookie(headers, SESSION_COOKIE)?;
    resources
        .database
        .get_live_session(&token, Utc::now())
        .await
        .ok()
        .flatten()
}

/// Build the risk context for a login attempt
pub(super) async fn build_risk_context(
    resources: &ServerResources,
    user: &User,
    client_public_id: &str,
    headers: &HeaderMap,
) -> RiskContext {
    let ip = client_ip(headers);
    let known_device = resources
        .database
        .user_has_session_from_ip(user.id, &ip)
        .await
        .unwrap_or(false);

    RiskContext {
        user_id: Some(user.id),
        client_id: client_public_id.to_owned(),
        ip: Some(ip),
        user_agent_digest: user_agent_digest(headers),
        hour_of_day: Utc::now().hour(),
        known_device,
        recent_failures: 0,
    }
}

/// Handle GET /oidc/v1/login
pub async fn handle_login_page(
    State(resources): State<Arc<ServerResources>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(request_id) = params.get("request_id") else {
        return (
            StatusCode::BAD_REQUEST,
            Html(pages::error_page(ErrorCategory::CodeExpired)),
        )
            .into_response();
    };
    if let Err(response) = load_live_request(&resources, request_id).await {
        return response;
    }

    let Ok(csrf_token) = crypto::generate_token() else {
        return crate::errors::AppError::crypto("CSRF token generation failed").into_response();
    };

    let mut response =
        Html(pages::login_page(request_id, &csrf_token, None)).into_response();
    if let Ok(cookie) = build_cookie(CSRF_COOKIE, &csrf_token, 600).parse() {
        response.headers_mut().append(SET_COOKIE, cookie);
    }
    response
}

/// Render the login form again with the generic credential error
fn credential_rejected(request_id: &str, csrf_token: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Html(pages::login_page(
            request_id,
            csrf_token,
            Some(ErrorCategory::CredentialInvalid),
        )),
    )
        .into_response()
}

/// Handle POST /oidc/v1/login
pub async fn handle_login_submit(
    State(resources): State<Arc<ServerResources>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let (Some(request_id), Some(csrf_token), Some(username), Some(password)) = (
        form.get("request_id"),
        form.get("csrf_token"),
        form.get("username"),
        form.get("password"),
    ) else {
        return (
            StatusCode::BAD_REQUEST,
            Html(pages::error_page(ErrorCategory::SessionExpired)),
        )
            .into_response();
    };

    // Double-submit CSRF: the form token must match the pre-auth cookie
    let cookie_token = get_cookie(&headers, CSRF_COOKIE).unwrap_or_default();
    if cookie_token.is_empty() || !csrf_matches(csrf_token, &cookie_token) {
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

    // Resolve the user; every failure from here to the password check is
    // the same generic rejection
    let user = match resources.database.get_user_by_username(username).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            // Burn a verification anyway so missing and wrong-password
            // usernames cost the same
            let _ = crypto::verify_secret(password, "pbkdf2$210000$AAAAAAAAAAAAAAAAAAAAAA==$AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=");
            return credential_rejected(request_id, csrf_token);
        }
        Err(e) => {
            tracing::error!("user lookup failed: {e:#}");
            return credential_rejected(request_id, csrf_token);
        }
    };

    if user.status == UserStatus::Locked {
        tracing::warn!(user_id = %user.id, "locked account attempted login");
        return credential_rejected(request_id, csrf_token);
    }

    let password_ok = crypto::verify_secret(password, &user.password_hash).unwrap_or(false);
    if !password_ok {
        return credential_rejected(request_id, csrf_token);
    }

    // One-way migration: a legacy hash that just verified is re-hashed
    // under the approved scheme
    if user.password_hash.starts_with("$2") {
        match crypto::hash_secret(password, resources.config.pbkdf2_iterations) {
            Ok(new_hash) => {
                if let Err(e) = resources
                    .database
                    .update_user_password(user.id, &new_hash)
                    .await
                {
                    tracing::warn!("legacy hash migration failed for {}: {e:#}", user.id);
                }
            }
            Err(e) => tracing::warn!("legacy hash migration failed for {}: {e}", user.id),
        }
    }

    // Establish the session at password assurance
    let now = Utc::now();
    let (Ok(session_token), Ok(session_csrf)) = (crypto::generate_token(), crypto::generate_token())
    else {
        return crate::errors::AppError::crypto("session token generation failed").into_response();
    };
    let session = Session {
        id: Uuid::now_v7(),
        user_id: user.id,
        token: session_token,
        csrf_token: session_csrf,
        created_at: now,
        idle_expires_at: now + Duration::seconds(resources.config.session.idle_secs),
        absolute_expires_at: now + Duration::seconds(resources.config.session.absolute_secs),
        assurance: AssuranceLevel::Password,
        last_ip: Some(client_ip(&headers)),
        last_user_agent: user_agent_digest(&headers),
        row_version: 0,
    };
    if let Err(e) = resources.database.create_session(&session).await {
        tracing::error!("session creation failed: {e:#}");
        return crate::errors::AppError::database("session creation failed").into_response();
    }

    // Bind the authenticated user to the authorization request
    let mut attached = false;
    let mut observed = request.clone();
    for _ in 0..CAS_MAX_RETRIES {
        match resources
            .database
            .attach_user_to_request(observed.id, user.id, observed.row_version, now)
            .await
        {
            Ok(true) => {
                attached = true;
                break;
            }
            Ok(false) => match resources.database.get_authorization_request(observed.id).await {
                Ok(Some(fresh)) if !fresh.consumed => observed = fresh,
                _ => break,
            },
            Err(e) => {
                tracing::error!("user attach failed: {e:#}");
                break;
            }
        }
    }
    if !attached {
        return (
            StatusCode::CONFLICT,
            Html(pages::error_page(ErrorCategory::CodeExpired)),
        )
            .into_response();
    }

    // Adaptive step-up decision
    let client_public_id = resources
        .database
        .get_client(request.client_id)
        .await
        .ok()
        .flatten()
        .map_or_else(String::new, |c| c.client_id);
    let ctx = build_risk_context(&resources, &user, &client_public_id, &headers).await;
    let assessment = resources.orchestrator.evaluate(&ctx);

    tracing::debug!(
        user_id = %user.id,
        score = assessment.score,
        required = ?assessment.required,
        "risk evaluated at login"
    );

    let mut response = if assessment.required > AssuranceLevel::Password {
        step_up_prompt(&resources, &user, request_id, &session).await
    } else {
        proceed_after_authentication(&resources, &session, &request).await
    };

    if let Ok(cookie) = build_cookie(
        SESSION_COOKIE,
        &session.token,
        resources.config.session.absolute_secs,
    )
    .parse()
    {
        response.headers_mut().append(SET_COOKIE, cookie);
    }
    response
}

/// Render the second-factor prompt appropriate for the user's enrollment
async fn step_up_prompt(
    resources: &ServerResources,
    user: &User,
    request_id: &str,
    session: &Session,
) -> Response {
    if user.totp_secret_enc.is_some() {
        return Html(pages::totp_page(request_id, &session.csrf_token, None)).into_response();
    }

    if let Some(email) = &user.email {
        match resources
            .otp
            .generate(user.id, ChallengeKind::EmailOtp, email)
            .await
        {
            Ok(challenge_id) => {
                return Html(pages::otp_page(
                    request_id,
                    &session.csrf_token,
                    &challenge_id.to_string(),
                    None,
                ))
                .into_response();
            }
            Err(e) => {
                tracing::error!("step-up OTP issuance failed: {e}");
                return crate::errors::AppError::new(
                    crate::errors::ErrorCode::DeliveryFailure,
                    "verification code delivery failed",
                )
                .into_response();
            }
        }
    }

    // Step-up required but nothing to step up with
    tracing::warn!(user_id = %user.id, "step-up required but user has no second factor enrolled");
    (
        StatusCode::FORBIDDEN,
        Html(pages::error_page(ErrorCategory::CredentialInvalid)),
    )
        .into_response()
}

/// Handle POST /oidc/v1/login/mfa
pub async fn handle_login_mfa(
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

    let now = Utc::now();
    let verified = if let Some(totp_code) = form.get("totp_code") {
        resources
            .totp
            .verify_for_user(
                resources.totp_secrets.as_ref(),
                session.user_id,
                totp_code,
                now,
            )
            .await
            .unwrap_or(false)
    } else if let (Some(challenge_id), Some(otp_code)) =
        (form.get("challenge_id"), form.get("otp_code"))
    {
        match Uuid::parse_str(challenge_id) {
            Ok(challenge_id) => resources
                .otp
                .verify(
                    challenge_id,
                    otp_code,
                    &client_ip(&headers),
                    Some(session.user_id),
                )
                .await
                .is_ok(),
            Err(_) => false,
        }
    } else {
        false
    };

    if !verified {
        let page = form.get("challenge_id").map_or_else(
            || pages::totp_page(request_id, &session.csrf_token, Some(ErrorCategory::CredentialInvalid)),
            |challenge_id| {
                pages::otp_page(
                    request_id,
                    &session.csrf_token,
                    challenge_id,
                    Some(ErrorCategory::CredentialInvalid),
                )
            },
        );
        return (StatusCode::UNAUTHORIZED, Html(page)).into_response();
    }

    if let Err(e) = raise_assurance(&resources, &session, AssuranceLevel::BasicMfa).await {
        tracing::error!("assurance raise failed: {e}");
        return crate::errors::AppError::database("assurance update failed").into_response();
    }

    // Re-evaluate now that the session is partially bound; the requirement
    // may have grown mid-chain (it never shrinks). Strong MFA rides the
    // WebAuthn endpoints, so a still-unmet requirement ends the HTML chain.
    if let (Ok(Some(user)), Ok(Some(client))) = (
        resources.database.get_user(session.user_id).await,
        resources.database.get_client(request.client_id).await,
    ) {
        let ctx = build_risk_context(&resources, &user, &client.client_id, &headers).await;
        if resources.orchestrator.evaluate(&ctx).required > AssuranceLevel::BasicMfa {
            tracing::warn!(
                user_id = %session.user_id,
                "strong MFA required but the HTML chain can only reach basic_mfa"
            );
            return (
                StatusCode::FORBIDDEN,
                Html(pages::error_page(ErrorCategory::CredentialInvalid)),
            )
                .into_response();
        }
    }

    proceed_after_authentication(&resources, &session, &request).await
}

/// Raise a session's assurance with bounded compare-and-set retries
pub(super) async fn raise_assurance(
    resources: &ServerResources,
    session: &Session,
    target: AssuranceLevel,
) -> crate::errors::AppResult<()> {
    let mut observed = session.clone();
    for _ in 0..CAS_MAX_RETRIES {
        if observed.assurance >= target {
            return Ok(());
        }
        let raised = resources
            .database
            .raise_session_assurance(observed.id, target, observed.row_version)
            .await
            .map_err(crate::errors::AppError::from)?;
        if raised {
            return Ok(());
        }
        // Lost the race; re-read and retry (the concurrent writer may have
        // already raised past the target)
        match resources
            .database
            .get_live_session(&observed.token, Utc::now())
            .await
            .map_err(crate::errors::AppError::from)?
        {
            Some(fresh) => observed = fresh,
            None => {
                return Err(crate::errors::AppError::new(
                    crate::errors::ErrorCode::NotFound,
                    "session disappeared during assurance update",
                ))
            }
        }
    }
    Err(crate::errors::AppError::conflict(
        "assurance update retries exhausted",
    ))
}

/// Handle GET /oidc/v1/magic (magic-link landing)
pub async fn handle_magic_link(
    State(resources): State<Arc<ServerResources>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let (Some(challenge_id), Some(token)) = (params.get("challenge_id"), params.get("token"))
    else {
        return (
            StatusCode::BAD_REQUEST,
            Html(pages::error_page(ErrorCategory::CodeExpired)),
        )
            .into_response();
    };

    let Ok(challenge_id) = Uuid::parse_str(challenge_id) else {
        return (
            StatusCode::BAD_REQUEST,
            Html(pages::error_page(ErrorCategory::CodeExpired)),
        )
            .into_response();
    };

    let session = session_from_cookie(&resources, &headers).await;
    let subject_hint = session.as_ref().map(|s| s.user_id);

    match resources
        .otp
        .verify(challenge_id, token, &client_ip(&headers), subject_hint)
        .await
    {
        Ok(user_id) => {
            if let Some(session) = session {
                if session.user_id == user_id {
                    if let Err(e) =
                        raise_assurance(&resources, &session, AssuranceLevel::BasicMfa).await
                    {
                        tracing::error!("assurance raise after magic link failed: {e}");
                    }
                }
            }
            Html(
                "<!DOCTYPE html>\n<html lang=\"en\"><head><meta charset=\"utf-8\">\
                 <title>Verified</title></head>\
                 <body><h1>Verified</h1><p>You can return to your sign-in window.</p></body></html>"
                    .to_owned(),
            )
            .into_response()
        }
        Err(_) => (
            StatusCode::UNAUTHORIZED,
            Html(pages::error_page(ErrorCategory::CodeExpired)),
        )
            .into_response(),
    }
}
