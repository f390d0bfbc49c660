// ABOUTME: Token endpoint - authorization_code, refresh_token, client_credentials grants
// ABOUTME: Also RFC 7662 introspection and RFC 7009 revocation, all client-authenticated
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

//! POST /oauth2/v1/token, /oauth2/v1/introspect, /oauth2/v1/revoke

use super::models::{
    AccessTokenClaims, IdTokenClaims, IntrospectionResponse, OAuth2Error, TokenResponse,
};
use crate::audit;
use crate::client_auth::PresentedCredentials;
use crate::context::ServerResources;
use crate::crypto;
use crate::database::{CodeRedemption, RefreshRotation, TokenSpec};
use crate::models::{AccessTokenRecord, Client};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Build the pre-generated randomness a grant needs before its transaction
fn token_spec(client: &Client) -> Result<TokenSpec, OAuth2Error> {
    let refresh_token = crypto::generate_token().map_err(|e| {
        tracing::error!("refresh token generation failed: {e}");
        OAuth2Error::server_error()
    })?;

    Ok(TokenSpec {
        access_jti: Uuid::now_v7(),
        access_lifetime: Duration::seconds(client.token_lifetimes.access_secs),
        refresh_id: Uuid::now_v7(),
        refresh_token,
        refresh_lifetime: Duration::seconds(client.token_lifetimes.refresh_secs),
    })
}

/// Sign the access token JWS for a stored record
fn sign_access_token(
    resources: &ServerResources,
    record: &AccessTokenRecord,
    client: &Client,
) -> Result<String, OAuth2Error> {
    let sub = record
        .user_id
        .map_or_else(|| client.client_id.clone(), |user_id| user_id.to_string());

    let claims = AccessTokenClaims {
        iss: resources.config.issuer_url.clone(),
        sub,
        aud: resources.config.issuer_url.clone(),
        client_id: client.client_id.clone(),
        scope: record.scope.clone(),
        exp: record.expires_at.timestamp(),
        iat: record.issued_at.timestamp(),
        jti: record.jti.to_string(),
    };

    resources.keys.sign(&claims, "at+jwt").map_err(|e| {
        tracing::error!("access token signing failed: {e}");
        OAuth2Error::server_error()
    })
}

/// Sign the OIDC ID token when `openid` was granted
async fn maybe_sign_id_token(
    resources: &ServerResources,
    record: &AccessTokenRecord,
    client: &Client,
    auth_time: DateTime<Utc>,
) -> Result<Option<String>, OAuth2Error> {
    if !record.scope.split(' ').any(|s| s == "openid") {
        return Ok(None);
    }
    let Some(user_id) = record.user_id else {
        return Ok(None);
    };

    let user = resources
        .database
        .get_user(user_id)
        .await
        .map_err(|e| {
            tracing::error!("user lookup for id token failed: {e:#}");
            OAuth2Error::server_error()
        })?
        .ok_or_else(|| OAuth2Error::invalid_grant("subject no longer exists"))?;

    let now = Utc::now();
    let claims = IdTokenClaims {
        iss: resources.config.issuer_url.clone(),
        sub: user.id.to_string(),
        aud: client.client_id.clone(),
        exp: (now + Duration::seconds(client.token_lifetimes.id_secs)).timestamp(),
        iat: now.timestamp(),
        auth_time: auth_time.timestamp(),
        preferred_username: Some(user.username.clone()),
        email: if record.scope.split(' ').any(|s| s == "email") {
            user.email.clone()
        } else {
            None
        },
    };

    resources
        .keys
        .sign(&claims, "JWT")
        .map(Some)
        .map_err(|e| {
            tracing::error!("id token signing failed: {e}");
            OAuth2Error::server_error()
        })
}

/// Handle POST /oauth2/v1/token
pub async fn handle_token(
    State(resources): State<Arc<ServerResources>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let presented = PresentedCredentials::from_request(&headers, &form);
    let client = match resources.client_auth.authenticate(&presented).await {
        Ok(client) => client,
        Err(error) => return OAuth2Error::from(&error).into_response(),
    };

    let result = match form.get("grant_type").map(String::as_str) {
        Some("authorization_code") => {
            handle_authorization_code_grant(&resources, &client, &form).await
        }
        Some("refresh_token") => handle_refresh_token_grant(&resources, &client, &form).await,
        Some("client_credentials") => {
            handle_client_credentials_grant(&resources, &client, &form).await
        }
        _ => Err(OAuth2Error::unsupported_grant_type()),
    };

    match result {
        Ok(response) => Json(response).into_response(),
        Err(error) => error.into_response(),
    }
}

async fn handle_authorization_code_grant(
    resources: &ServerResources,
    client: &Client,
    form: &HashMap<String, String>,
) -> Result<TokenResponse, OAuth2Error> {
    if !client.grant_types.iter().any(|g| g == "authorization_code") {
        return Err(OAuth2Error::unauthorized_client(
            "client is not registered for the authorization_code grant",
        ));
    }

    let code = form
        .get("code")
        .ok_or_else(|| OAuth2Error::invalid_request("code is required"))?;
    let redirect_uri = form
        .get("redirect_uri")
        .ok_or_else(|| OAuth2Error::invalid_request("redirect_uri is required"))?;
    let code_verifier = form
        .get("code_verifier")
        .ok_or_else(|| OAuth2Error::invalid_grant("code_verifier is required"))?;

    let spec = token_spec(client)?;
    let now = Utc::now();

    let redemption = resources
        .database
        .redeem_authorization_code(code, client.id, redirect_uri, code_verifier, now, spec)
        .await
        .map_err(|e| {
            tracing::error!("code redemption failed for client {}: {e:#}", client.client_id);
            OAuth2Error::server_error()
        })?;

    let (request, access, refresh) = match redemption {
        CodeRedemption::Success {
            request,
            access,
            refresh,
        } => (request, access, refresh),
        CodeRedemption::Replayed { family_id } => {
            if let Some(family_id) = family_id {
                audit::family_revoked(&family_id.to_string(), "code_replay");
            }
            tracing::warn!(
                client_id = %client.client_id,
                "authorization code replay detected; token family revoked"
            );
            return Err(OAuth2Error::invalid_grant(
                "Invalid or expired authorization code",
            ));
        }
        CodeRedemption::Rejected => {
            return Err(OAuth2Error::invalid_grant(
                "Invalid or expired authorization code",
            ));
        }
        CodeRedemption::PkceMismatch => {
            tracing::warn!(
                client_id = %client.client_id,
                "PKCE verification failed; code consumed without issuance"
            );
            return Err(OAuth2Error::invalid_grant("Invalid code_verifier"));
        }
    };

    let access_token = sign_access_token(resources, &access, client)?;
    let id_token =
        maybe_sign_id_token(resources, &access, client, request.consumed_at.unwrap_or(now))
            .await?;

    Ok(TokenResponse {
        access_token,
        token_type: "Bearer".to_owned(),
        expires_in: client.token_lifetimes.access_secs,
        refresh_token: refresh.map(|r| r.token),
        id_token,
        scope: access.scope,
    })
}

async fn handle_refresh_token_grant(
    resources: &ServerResources,
    client: &Client,
    form: &HashMap<String, String>,
) -> Result<TokenResponse, OAuth2Error> {
    if !client.grant_types.iter().any(|g| g == "refresh_token") {
        return Err(OAuth2Error::unauthorized_client(
            "client is not registered for the refresh_token grant",
        ));
    }

    let presented = form
        .get("refresh_token")
        .ok_or_else(|| OAuth2Error::invalid_request("refresh_token is required"))?;

    let spec = token_spec(client)?;
    let now = Utc::now();

    let rotation = resources
        .database
        .rotate_refresh_token(presented, client.id, now, spec)
        .await
        .map_err(|e| {
            tracing::error!(
                "refresh rotation failed for client {}: {e:#}",
                client.client_id
            );
            OAuth2Error::server_error()
        })?;

    let (old, access, refresh) = match rotation {
        RefreshRotation::Rotated {
            old,
            access,
            refresh,
        } => (old, access, refresh),
        RefreshRotation::ReuseDetected { family_id } => {
            audit::family_revoked(&family_id.to_string(), "refresh_reuse");
            tracing::warn!(
                client_id = %client.client_id,
                "revoked refresh token presented; family revoked"
            );
            return Err(OAuth2Error::invalid_grant("Invalid or expired refresh token"));
        }
        RefreshRotation::Rejected => {
            return Err(OAuth2Error::invalid_grant("Invalid or expired refresh token"));
        }
    };

    tracing::info!(
        client_id = %client.client_id,
        user_id = %old.user_id,
        "refresh token rotated"
    );

    let access_token = sign_access_token(resources, &access, client)?;

    Ok(TokenResponse {
        access_token,
        token_type: "Bearer".to_owned(),
        expires_in: client.token_lifetimes.access_secs,
        refresh_token: Some(refresh.token),
        id_token: None,
        scope: access.scope,
    })
}

async fn handle_client_credentials_grant(
    resources: &ServerResources,
    client: &Client,
    form: &HashMap<String, String>,
) -> Result<TokenResponse, OAuth2Error> {
    if !client.grant_types.iter().any(|g| g == "client_credentials") {
        return Err(OAuth2Error::unauthorized_client(
            "client is not registered for the client_credentials grant",
        ));
    }

    let scope = form.get("scope").cloned().unwrap_or_default();
    let requested: Vec<&str> = scope.split_whitespace().collect();
    if !client.scopes_allowed(&requested) {
        return Err(OAuth2Error::invalid_scope(
            "requested scope exceeds the client allow-list",
        ));
    }
    let scope = requested.join(" ");

    let now = Utc::now();
    let access = AccessTokenRecord {
        jti: Uuid::now_v7(),
        user_id: None,
        client_id: client.id,
        scope: scope.clone(),
        family_id: Uuid::now_v7(),
        issued_at: now,
        expires_at: now + Duration::seconds(client.token_lifetimes.access_secs),
        revoked: false,
    };

    resources
        .database
        .issue_client_credentials_token(access.clone())
        .await
        .map_err(|e| {
            tracing::error!(
                "client credentials issuance failed for {}: {e:#}",
                client.client_id
            );
            OAuth2Error::server_error()
        })?;

    let access_token = sign_access_token(resources, &access, client)?;

    Ok(TokenResponse {
        access_token,
        token_type: "Bearer".to_owned(),
        expires_in: client.token_lifetimes.access_secs,
        refresh_token: None,
        id_token: None,
        scope,
    })
}

/// Resolve a presented token string to its stored access token record
///
/// Access tokens are JWS (resolved by `jti`); refresh tokens are opaque.
async fn resolve_access_record(
    resources: &ServerResources,
    token: &str,
) -> Option<AccessTokenRecord> {
    let claims: AccessTokenClaims = resources.keys.verify(token, false).ok()?;
    let jti = Uuid::parse_str(&claims.jti).ok()?;
    resources.database.get_access_token(jti).await.ok().flatten()
}

/// Handle POST /oauth2/v1/introspect (RFC 7662)
pub async fn handle_introspect(
    State(resources): State<Arc<ServerResources>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let presented = PresentedCredentials::from_request(&headers, &form);
    if let Err(error) = resources.client_auth.authenticate(&presented).await {
        return OAuth2Error::from(&error).into_response();
    }

    let Some(token) = form.get("token") else {
        return OAuth2Error::invalid_request("token is required").into_response();
    };

    let now = Utc::now();

    // Access token (JWS) first, opaque refresh token second; anything that
    // fails either path is uniformly inactive
    if let Some(record) = resolve_access_record(&resources, token).await {
        if !record.revoked && now < record.expires_at {
            let client_id = resources
                .database
                .get_client(record.client_id)
                .await
                .ok()
                .flatten()
                .map(|c| c.client_id);
            return Json(IntrospectionResponse {
                active: true,
                sub: Some(
                    record
                        .user_id
                        .map_or_else(|| client_id.clone().unwrap_or_default(), |u| u.to_string()),
                ),
                client_id,
                scope: Some(record.scope),
                exp: Some(record.expires_at.timestamp()),
                iat: Some(record.issued_at.timestamp()),
            })
            .into_response();
        }
        return Json(IntrospectionResponse::inactive()).into_response();
    }

    if let Ok(Some(record)) = resources.database.get_refresh_token(token).await {
        if !record.revoked && now < record.expires_at {
            let client_id = resources
                .database
                .get_client(record.client_id)
                .await
                .ok()
                .flatten()
                .map(|c| c.client_id);
            return Json(IntrospectionResponse {
                active: true,
                sub: Some(record.user_id.to_string()),
                client_id,
                scope: Some(record.scope),
                exp: Some(record.expires_at.timestamp()),
                iat: Some(record.issued_at.timestamp()),
            })
            .into_response();
        }
    }

    Json(IntrospectionResponse::inactive()).into_response()
}

/// Handle POST /oauth2/v1/revoke (RFC 7009)
///
/// Always 200 on well-formed requests, whether or not the token existed.
/// Revoking a refresh token revokes its entire descendant family.
pub async fn handle_revoke(
    State(resources): State<Arc<ServerResources>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let presented = PresentedCredentials::from_request(&headers, &form);
    if let Err(error) = resources.client_auth.authenticate(&presented).await {
        return OAuth2Error::from(&error).into_response();
    }

    let Some(token) = form.get("token") else {
        return OAuth2Error::invalid_request("token is required").into_response();
    };

    if let Some(record) = resolve_access_record(&resources, token).await {
        if let Err(e) = resources.database.revoke_access_token(record.jti).await {
            tracing::error!("access token revocation failed: {e:#}");
            return OAuth2Error::server_error().into_response();
        }
        return axum::http::StatusCode::OK.into_response();
    }

    if let Ok(Some(record)) = resources.database.get_refresh_token(token).await {
        if let Err(e) = resources.database.revoke_token_family(record.family_id).await {
            tracing::error!("refresh family revocation failed: {e:#}");
            return OAuth2Error::server_error().into_response();
        }
        audit::family_revoked(&record.family_id.to_string(), "rfc7009_revocation");
    }

    // Unknown tokens are already as revoked as they can get
    axum::http::StatusCode::OK.into_response()
}
