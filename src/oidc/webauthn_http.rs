// ABOUTME: Session-guarded JSON endpoints driving the WebAuthn ceremonies from the browser
// ABOUTME: A verified assertion raises the session to strong_mfa
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use super::login::{raise_assurance, session_from_cookie};
use crate::context::ServerResources;
use crate::errors::AppError;
use crate::mfa::webauthn::{AssertionResponse, RegistrationResponse};
use crate::models::AssuranceLevel;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "session required"}))).into_response()
}

/// Handle POST /oidc/v1/webauthn/register/begin
pub async fn handle_register_begin(
    State(resources): State<Arc<ServerResources>>,
    headers: HeaderMap,
) -> Response {
    let Some(session) = session_from_cookie(&resources, &headers).await else {
        return unauthorized();
    };
    let user = match resources.database.get_user(session.user_id).await {
        Ok(Some(user)) => user,
        _ => return unauthorized(),
    };

    match resources.webauthn.begin_registration(&user).await {
        Ok(options) => Json(options).into_response(),
        Err(error) => error.into_response(),
    }
}

/// Registration finish body: the browser response plus an optional label
#[derive(Debug, Deserialize)]
pub struct RegisterFinishBody {
    /// The `PublicKeyCredential` from `navigator.credentials.create`
    #[serde(flatten)]
    pub credential: RegistrationResponse,
    /// User-facing device label
    pub label: Option<String>,
}

/// Handle POST /oidc/v1/webauthn/register/finish
pub async fn handle_register_finish(
    State(resources): State<Arc<ServerResources>>,
    headers: HeaderMap,
    Json(body): Json<RegisterFinishBody>,
) -> Response {
    let Some(session) = session_from_cookie(&resources, &headers).await else {
        return unauthorized();
    };

    match resources
        .webauthn
        .finish_registration(&body.credential, body.label)
        .await
    {
        Ok(credential) => {
            if credential.user_id != session.user_id {
                return AppError::invalid_grant("credential does not belong to this session")
                    .into_response();
            }
            Json(json!({
                "credential_id": credential.credential_id,
                "created_at": credential.created_at,
            }))
            .into_response()
        }
        Err(error) => error.into_response(),
    }
}

/// Handle POST /oidc/v1/webauthn/authenticate/begin
pub async fn handle_authenticate_begin(
    State(resources): State<Arc<ServerResources>>,
    headers: HeaderMap,
) -> Response {
    let Some(session) = session_from_cookie(&resources, &headers).await else {
        return unauthorized();
    };

    match resources.webauthn.begin_authentication(session.user_id).await {
        Ok(options) => Json(options).into_response(),
        Err(error) => error.into_response(),
    }
}

/// Handle POST /oidc/v1/webauthn/authenticate/finish
pub async fn handle_authenticate_finish(
    State(resources): State<Arc<ServerResources>>,
    headers: HeaderMap,
    Json(body): Json<AssertionResponse>,
) -> Response {
    let Some(session) = session_from_cookie(&resources, &headers).await else {
        return unauthorized();
    };

    match resources.webauthn.finish_authentication(&body).await {
        Ok(user_id) => {
            if user_id != session.user_id {
                return AppError::invalid_grant("credential does not belong to this session")
                    .into_response();
            }
            if let Err(error) =
                raise_assurance(&resources, &session, AssuranceLevel::StrongMfa).await
            {
                tracing::error!("assurance raise after assertion failed: {error}");
                return error.into_response();
            }
            Json(json!({ "verified": true, "assurance": "strong_mfa" })).into_response()
        }
        Err(error) => error.into_response(),
    }
}
