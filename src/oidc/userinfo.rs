// ABOUTME: Bearer-protected userinfo endpoint returning claims scoped by the access token
// ABOUTME: Every token failure is a 401 with WWW-Authenticate: Bearer error="invalid_token"
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use crate::context::ServerResources;
use crate::oauth2::AccessTokenClaims;
use axum::extract::State;
use axum::http::{header::WWW_AUTHENTICATE, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use uuid::Uuid;

/// The uniform 401 for any token failure
fn invalid_token() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(WWW_AUTHENTICATE, "Bearer error=\"invalid_token\"")],
        "",
    )
        .into_response()
}

/// Handle GET /oidc/v1/userinfo
pub async fn handle_userinfo(
    State(resources): State<Arc<ServerResources>>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return invalid_token();
    };

    let Ok(claims) = resources.keys.verify::<AccessTokenClaims>(token, true) else {
        return invalid_token();
    };

    // The JWS verified; the stored record must also still be live
    let Ok(jti) = Uuid::parse_str(&claims.jti) else {
        return invalid_token();
    };
    match resources.database.get_access_token(jti).await {
        Ok(Some(record)) if !record.revoked && Utc::now() < record.expires_at => {}
        _ => return invalid_token(),
    }

    let Ok(user_id) = Uuid::parse_str(&claims.sub) else {
        // client_credentials tokens carry no user to describe
        return invalid_token();
    };
    let Ok(Some(user)) = resources.database.get_user(user_id).await else {
        return invalid_token();
    };

    let scopes: Vec<&str> = claims.scope.split(' ').collect();
    let mut body = Map::new();
    body.insert("sub".to_owned(), json!(user.id.to_string()));
    if scopes.contains(&"profile") {
        body.insert("preferred_username".to_owned(), json!(user.username));
        if let Some(name) = &user.display_name {
            body.insert("name".to_owned(), json!(name));
        }
    }
    if scopes.contains(&"email") {
        if let Some(email) = &user.email {
            body.insert("email".to_owned(), json!(email));
        }
    }

    Json(Value::Object(body)).into_response()
}
