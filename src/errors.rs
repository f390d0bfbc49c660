// ABOUTME: Centralized error handling and error codes for the Aegis identity platform
// ABOUTME: Maps internal error kinds to the OAuth/OIDC wire vocabulary at the endpoint boundary
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

//! # Unified Error Handling System
//!
//! Internal code paths carry an [`AppError`] with a precise [`ErrorCode`].
//! The conversion to the RFC 6749 error vocabulary happens exactly once, at
//! the HTTP boundary: internal kinds (`ReplayDetected`, `RateLimited`,
//! `DeliveryFailure`, `Conflict`, `Cancelled`) never serialize to the wire.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Standard error codes used throughout the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // OAuth / OIDC wire vocabulary (RFC 6749 §5.2 and friends)
    /// Request is missing a parameter or is otherwise malformed
    InvalidRequest,
    /// Client authentication failed
    InvalidClient,
    /// Authorization code, refresh token, or PKCE verifier is invalid
    InvalidGrant,
    /// Client is not authorized for this grant or response type
    UnauthorizedClient,
    /// Grant type is not supported by this server
    UnsupportedGrantType,
    /// Response type is not supported by this server
    UnsupportedResponseType,
    /// Requested scope exceeds what the client may request
    InvalidScope,
    /// Resource owner or server denied the request
    AccessDenied,
    /// Internal failure; details stay server-side
    ServerError,
    /// Server is temporarily unable to handle the request
    TemporarilyUnavailable,

    // Internal kinds - never serialized to the wire as-is
    /// A replayed credential was detected (auth code reuse, sign counter regression)
    ReplayDetected,
    /// A sliding-window rate limit was exceeded
    RateLimited,
    /// An outbound delivery provider failed
    DeliveryFailure,
    /// Optimistic-concurrency retries were exhausted
    Conflict,
    /// The request deadline elapsed mid-operation
    Cancelled,
    /// Requested entity does not exist (or must appear not to)
    NotFound,
    /// Account is administratively locked
    AccountLocked,
    /// Configuration is missing or invalid
    ConfigError,
    /// Storage operation failed
    DatabaseError,
    /// Cryptographic operation failed
    CryptoError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    #[must_use]
    pub const fn http_status(self) -> StatusCode {
        match self {
            Self::InvalidRequest
            | Self::UnsupportedGrantType
            | Self::UnsupportedResponseType
            | Self::InvalidScope
            | Self::InvalidGrant
            | Self::ReplayDetected
            | Self::NotFound => StatusCode::BAD_REQUEST,

            Self::InvalidClient => StatusCode::UNAUTHORIZED,

            Self::UnauthorizedClient | Self::AccessDenied | Self::AccountLocked => {
                StatusCode::FORBIDDEN
            }

            Self::Conflict => StatusCode::CONFLICT,

            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,

            Self::TemporarilyUnavailable | Self::DeliveryFailure => StatusCode::SERVICE_UNAVAILABLE,

            Self::Cancelled => StatusCode::REQUEST_TIMEOUT,

            Self::ServerError | Self::ConfigError | Self::DatabaseError | Self::CryptoError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// RFC 6749 error string this code collapses to at the wire boundary
    ///
    /// Internal kinds map deterministically and never leak their real name:
    /// replay detection and not-found both read as `invalid_grant`, rate
    /// limits read as the `slow_down` extension, everything operational
    /// reads as `server_error` or `temporarily_unavailable`.
    #[must_use]
    pub const fn wire_code(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant | Self::ReplayDetected | Self::NotFound => "invalid_grant",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::InvalidScope => "invalid_scope",
            Self::AccessDenied | Self::AccountLocked => "access_denied",
            Self::RateLimited => "slow_down",
            Self::TemporarilyUnavailable | Self::DeliveryFailure => "temporarily_unavailable",
            Self::ServerError
            | Self::Conflict
            | Self::Cancelled
            | Self::ConfigError
            | Self::DatabaseError
            | Self::CryptoError => "server_error",
        }
    }

    /// Get a user-safe description of this error
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::InvalidRequest => "The request is missing a parameter or is malformed",
            Self::InvalidClient => "Client authentication failed",
            Self::InvalidGrant => "The provided grant is invalid, expired, or revoked",
            Self::UnauthorizedClient => "The client is not authorized for this operation",
            Self::UnsupportedGrantType => "Grant type not supported",
            Self::UnsupportedResponseType => "Response type not supported",
            Self::InvalidScope => "The requested scope is invalid or exceeds the allowed set",
            Self::AccessDenied => "The request was denied",
            Self::ServerError => "An internal server error occurred",
            Self::TemporarilyUnavailable => "The service is temporarily unavailable",
            Self::ReplayDetected => "A replayed credential was detected",
            Self::RateLimited => "Too many attempts, slow down",
            Self::DeliveryFailure => "Message delivery failed",
            Self::Conflict => "The operation conflicted with a concurrent update",
            Self::Cancelled => "The request was cancelled",
            Self::NotFound => "The requested resource was not found",
            Self::AccountLocked => "The account is locked",
            Self::ConfigError => "Configuration error encountered",
            Self::DatabaseError => "Storage operation failed",
            Self::CryptoError => "Cryptographic operation failed",
        }
    }

    /// Whether the real kind may appear in a client-visible message
    #[must_use]
    pub const fn is_wire_kind(self) -> bool {
        matches!(
            self,
            Self::InvalidRequest
                | Self::InvalidClient
                | Self::InvalidGrant
                | Self::UnauthorizedClient
                | Self::UnsupportedGrantType
                | Self::UnsupportedResponseType
                | Self::InvalidScope
                | Self::AccessDenied
                | Self::TemporarilyUnavailable
        )
    }
}

/// Application error carrying an [`ErrorCode`] plus context
#[derive(Debug, Clone, Error)]
pub struct AppError {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable error message (internal; sanitized before exposure)
    pub message: String,
    /// Optional correlation id for tracing
    pub request_id: Option<String>,
}

impl AppError {
    /// Create a new `AppError` with the given code and message
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: None,
        }
    }

    /// Attach a correlation id to the error
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Get the HTTP status code for this error
    #[must_use]
    pub const fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    /// Get sanitized message safe for client exposure
    ///
    /// Wire-vocabulary validation errors keep their message; everything else
    /// collapses to the generic code description so storage and crypto
    /// details never leave the server.
    #[must_use]
    pub fn sanitized_message(&self) -> String {
        if self.code.is_wire_kind() {
            self.message.clone()
        } else {
            self.code.description().to_owned()
        }
    }

    /// Full error details for internal logging; never sent to clients
    #[must_use]
    pub fn internal_details(&self) -> String {
        format!("{:?}: {}", self.code, self.message)
    }

    /// Invalid request parameter
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// Client authentication failure (reason stays server-side)
    #[must_use]
    pub fn invalid_client() -> Self {
        Self::new(ErrorCode::InvalidClient, "Client authentication failed")
    }

    /// Invalid or expired grant
    #[must_use]
    pub fn invalid_grant(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidGrant, message)
    }

    /// Entity not found (surfaces as `invalid_grant` on the wire)
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        let resource_str = resource.into();
        Self::new(ErrorCode::NotFound, format!("{resource_str} not found"))
    }

    /// Sliding-window rate limit hit
    #[must_use]
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::new(
            ErrorCode::RateLimited,
            format!("rate limit exceeded, retry after {retry_after_secs}s"),
        )
    }

    /// Internal server error
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServerError, message)
    }

    /// Storage failure
    #[must_use]
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    /// Configuration failure
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigError, message)
    }

    /// Cryptographic failure
    #[must_use]
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CryptoError, message)
    }

    /// Optimistic-concurrency retry exhaustion
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.description(), self.message)
    }
}

/// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;

/// RFC 6749 wire error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// OAuth error code
    pub error: String,
    /// Human-readable error description (sanitized)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
    /// URI with further error information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_uri: Option<String>,
}

impl From<&AppError> for ErrorResponse {
    fn from(error: &AppError) -> Self {
        Self {
            error: error.code.wire_code().to_owned(),
            error_description: Some(error.sanitized_message()),
            error_uri: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Log full details internally before sanitizing
        tracing::warn!(
            request_id = ?self.request_id,
            "API error: {}",
            self.internal_details()
        );

        let status = self.http_status();
        let body = ErrorResponse::from(&self);
        let mut response = (status, Json(body)).into_response();

        if self.code == ErrorCode::RateLimited {
            response
                .headers_mut()
                .insert("retry-after", HeaderValue::from_static("900"));
        }
        if let Some(request_id) = self
            .request_id
            .as_deref()
            .and_then(|id| HeaderValue::from_str(id).ok())
        {
            // Correlation id rides a header, never the JSON body
            response.headers_mut().insert("x-request-id", request_id);
        }

        response
    }
}

/// Conversion from `anyhow::Error`, preserving an embedded `AppError` kind
impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<Self>() {
            Ok(app_error) => app_error,
            Err(error) => Self::new(ErrorCode::ServerError, error.to_string()),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        Self::new(ErrorCode::DatabaseError, error.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        Self::new(ErrorCode::ServerError, format!("IO error: {error}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(ErrorCode::InvalidRequest, format!("JSON error: {error}"))
    }
}

impl From<uuid::Error> for AppError {
    fn from(error: uuid::Error) -> Self {
        Self::new(ErrorCode::InvalidRequest, format!("UUID error: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_kinds_collapse_on_the_wire() {
        assert_eq!(ErrorCode::ReplayDetected.wire_code(), "invalid_grant");
        assert_eq!(ErrorCode::NotFound.wire_code(), "invalid_grant");
        assert_eq!(ErrorCode::RateLimited.wire_code(), "slow_down");
        assert_eq!(ErrorCode::Conflict.wire_code(), "server_error");
        assert_eq!(
            ErrorCode::DeliveryFailure.wire_code(),
            "temporarily_unavailable"
        );
    }

    #[test]
    fn sanitized_message_hides_internal_detail() {
        let err = AppError::database("UNIQUE constraint failed: users.username");
        assert_eq!(err.sanitized_message(), "Storage operation failed");

        let err = AppError::invalid_request("missing code_challenge");
        assert_eq!(err.sanitized_message(), "missing code_challenge");
    }
}
