// ABOUTME: OAuth 2.1 wire models - token responses, JWS claims, introspection, and error bodies
// ABOUTME: Error constructors carry the RFC 6749 code set with pointers into the RFC text
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// OAuth 2.0 token endpoint success response
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Access token (JWS compact serialization)
    pub access_token: String,
    /// Always "Bearer"
    pub token_type: String,
    /// Seconds until the access token expires
    pub expires_in: i64,
    /// Refresh token, when `offline_access` was granted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// ID token, when `openid` was granted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Granted scope, space-separated
    pub scope: String,
}

/// Access token claims (`typ: at+jwt`)
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Issuer URL
    pub iss: String,
    /// Subject: the real user identifier, or the client identifier for
    /// `client_credentials`
    pub sub: String,
    /// Audience
    pub aud: String,
    /// Public client id
    pub client_id: String,
    /// Granted scope, space-separated
    pub scope: String,
    /// Expiry (unix seconds)
    pub exp: i64,
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Token identifier, referencing the stored record
    pub jti: String,
}

/// ID token claims (OIDC core)
#[derive(Debug, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer URL
    pub iss: String,
    /// Subject user identifier
    pub sub: String,
    /// Audience: the client id
    pub aud: String,
    /// Expiry (unix seconds)
    pub exp: i64,
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Time of the authentication event (unix seconds)
    pub auth_time: i64,
    /// Preferred username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    /// Email, when the `email` scope was granted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// RFC 7662 introspection response
#[derive(Debug, Serialize, Deserialize)]
pub struct IntrospectionResponse {
    /// Whether the token is currently active
    pub active: bool,
    /// Subject identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Public client id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Granted scope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Expiry (unix seconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Issued at (unix seconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

impl IntrospectionResponse {
    /// The uniform inactive response; valid-but-revoked and never-existed
    /// are indistinguishable
    #[must_use]
    pub const fn inactive() -> Self {
        Self {
            active: false,
            sub: None,
            client_id: None,
            scope: None,
            exp: None,
            iat: None,
        }
    }
}

/// OAuth 2.0 error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth2Error {
    /// Error code from the RFC 6749 set
    pub error: String,
    /// Human-readable error description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
    /// URI for error information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_uri: Option<String>,
}

impl OAuth2Error {
    /// Create an `invalid_request` error
    #[must_use]
    pub fn invalid_request(description: &str) -> Self {
        Self {
            error: "invalid_request".to_owned(),
            error_description: Some(description.to_owned()),
            error_uri: Some(
                "https://datatracker.ietf.org/doc/html/rfc6749#section-4.1.2.1".to_owned(),
            ),
        }
    }

    /// Create an `invalid_client` error
    #[must_use]
    pub fn invalid_client() -> Self {
        Self {
            error: "invalid_client".to_owned(),
            error_description: Some("Client authentication failed".to_owned()),
            error_uri: Some("https://datatracker.ietf.org/doc/html/rfc6749#section-5.2".to_owned()),
        }
    }

    /// Create an `invalid_grant` error
    #[must_use]
    pub fn invalid_grant(description: &str) -> Self {
        Self {
            error: "invalid_grant".to_owned(),
            error_description: Some(description.to_owned()),
            error_uri: Some("https://datatracker.ietf.org/doc/html/rfc6749#section-5.2".to_owned()),
        }
    }

    /// Create an `unsupported_grant_type` error
    #[must_use]
    pub fn unsupported_grant_type() -> Self {
        Self {
            error: "unsupported_grant_type".to_owned(),
            error_description: Some("Grant type not supported".to_owned()),
            error_uri: Some("https://datatracker.ietf.org/doc/html/rfc6749#section-5.2".to_owned()),
        }
    }

    /// Create an `unsupported_response_type` error
    #[must_use]
    pub fn unsupported_response_type() -> Self {
        Self {
            error: "unsupported_response_type".to_owned(),
            error_description: Some("Only the 'code' response type is supported".to_owned()),
            error_uri: Some(
                "https://datatracker.ietf.org/doc/html/rfc6749#section-4.1.2.1".to_owned(),
            ),
        }
    }

    /// Create an `unauthorized_client` error
    #[must_use]
    pub fn unauthorized_client(description: &str) -> Self {
        Self {
            error: "unauthorized_client".to_owned(),
            error_description: Some(description.to_owned()),
            error_uri: Some(
                "https://datatracker.ietf.org/doc/html/rfc6749#section-4.1.2.1".to_owned(),
            ),
        }
    }

    /// Create an `invalid_scope` error
    #[must_use]
    pub fn invalid_scope(description: &str) -> Self {
        Self {
            error: "invalid_scope".to_owned(),
            error_description: Some(description.to_owned()),
            error_uri: Some(
                "https://datatracker.ietf.org/doc/html/rfc6749#section-4.1.2.1".to_owned(),
            ),
        }
    }

    /// Create an `access_denied` error
    #[must_use]
    pub fn access_denied() -> Self {
        Self {
            error: "access_denied".to_owned(),
            error_description: Some("The request was denied".to_owned()),
            error_uri: None,
        }
    }

    /// Create a `server_error` error
    #[must_use]
    pub fn server_error() -> Self {
        Self {
            error: "server_error".to_owned(),
            error_description: Some("An internal server error occurred".to_owned()),
            error_uri: None,
        }
    }

    /// HTTP status for this error at the token endpoint
    #[must_use]
    pub fn http_status(&self) -> StatusCode {
        match self.error.as_str() {
            "invalid_client" => StatusCode::UNAUTHORIZED,
            "server_error" => StatusCode::INTERNAL_SERVER_ERROR,
            "temporarily_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            "slow_down" => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<&crate::errors::AppError> for OAuth2Error {
    fn from(error: &crate::errors::AppError) -> Self {
        Self {
            error: error.code.wire_code().to_owned(),
            error_description: Some(error.sanitized_message()),
            error_uri: None,
        }
    }
}

impl IntoResponse for OAuth2Error {
    fn into_response(self) -> Response {
        let status = self.http_status();
        (status, Json(self)).into_response()
    }
}
