// ABOUTME: Environment configuration management for deployment-specific settings
// ABOUTME: Parses environment variables into typed configuration with safe fallbacks
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

//! Environment-based configuration management

use crate::crypto::SigningAlgorithm;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use tracing::warn;

/// Read an environment variable with a default fallback
fn env_var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

/// Parse a numeric environment variable, falling back with a warning
fn env_parse_or<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("invalid value for {key}, using default");
            default
        }),
        Err(_) => default,
    }
}

/// Token lifetime configuration in seconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Access token lifetime
    pub access_token_secs: i64,
    /// Refresh token lifetime
    pub refresh_token_secs: i64,
    /// ID token lifetime
    pub id_token_secs: i64,
    /// Authorization code lifetime
    pub auth_code_secs: i64,
}

/// Session timeout configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle timeout in seconds; refreshed on each authenticated touch
    pub idle_secs: i64,
    /// Absolute timeout in seconds; never extended
    pub absolute_secs: i64,
}

/// Sliding-window rate limit parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum attempts inside one window
    pub max_attempts: u32,
    /// Window length in seconds
    pub window_secs: u64,
}

/// WebAuthn relying party configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebAuthnConfig {
    /// Relying party identifier (effective domain)
    pub rp_id: String,
    /// Relying party display name
    pub rp_name: String,
    /// Allowed client-data origins
    pub origins: Vec<String>,
}

/// Adaptive authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaConfig {
    /// Path to the hot-reloadable orchestrator policy file
    pub policy_file: Option<PathBuf>,
    /// Interactive factor timeout in seconds
    pub interactive_timeout_secs: u64,
    /// Non-interactive factor timeout in seconds
    pub non_interactive_timeout_secs: u64,
}

/// Secret rotation configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Grace window for retired client secret versions, in seconds
    pub grace_secs: i64,
}

/// Cleanup scheduler configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Interval between sweeps in seconds
    pub sweep_interval_secs: u64,
    /// Per-target grace subtracted from `now` before bulk deletion, seconds
    pub grace_secs: i64,
}

/// Top-level server configuration loaded from the environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Issuer URL, also the base for endpoint metadata
    pub issuer_url: String,
    /// HTTP listen port
    pub http_port: u16,
    /// Database URL (SQLite)
    pub database_url: String,
    /// JWS signing algorithm
    pub signing_algorithm: SigningAlgorithm,
    /// RSA key size when the algorithm is RS256
    pub rsa_key_size_bits: usize,
    /// PBKDF2 iteration count; clamped upward to the approved floor
    pub pbkdf2_iterations: u32,
    /// Token lifetimes
    pub tokens: TokenConfig,
    /// Session timeouts
    pub session: SessionConfig,
    /// OTP / magic-link rate limiting
    pub rate_limit: RateLimitConfig,
    /// WebAuthn relying party settings
    pub webauthn: WebAuthnConfig,
    /// Adaptive authentication settings
    pub mfa: MfaConfig,
    /// Client secret rotation settings
    pub rotation: RotationConfig,
    /// Cleanup scheduler settings
    pub cleanup: CleanupConfig,
    /// OCSP/CRL revocation-result cache TTL in seconds
    pub revocation_cache_secs: u64,
    /// Discovery and JWKS response cache TTL in seconds
    pub discovery_cache_secs: u64,
    /// Redirect URIs are always strict byte-for-byte matches
    pub redirect_uri_strict_match: bool,
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// Unset variables fall back to development defaults; malformed values
    /// fall back with a warning. The redirect strict-match flag cannot be
    /// disabled.
    ///
    /// # Errors
    /// Returns an error if a mandatory variable is present but unusable.
    pub fn from_env() -> Result<Self> {
        let issuer_url = env_var_or("ISSUER_URL", "http://localhost:8080");
        url::Url::parse(&issuer_url).context("ISSUER_URL is not a valid URL")?;

        if env::var("REDIRECT_URI_STRICT_MATCH").is_ok_and(|v| v == "false") {
            warn!("REDIRECT_URI_STRICT_MATCH=false is not supported; strict matching stays on");
        }

        let pbkdf2_iterations = env_parse_or("PBKDF2_ITERATIONS", 210_000u32);
        let pbkdf2_iterations = if pbkdf2_iterations < 210_000 {
            warn!("PBKDF2_ITERATIONS below the approved floor; clamping to 210000");
            210_000
        } else {
            pbkdf2_iterations
        };

        Ok(Self {
            issuer_url: issuer_url.trim_end_matches('/').to_owned(),
            http_port: env_parse_or("HTTP_PORT", 8080u16),
            database_url: env_var_or("DATABASE_URL", "sqlite::memory:"),
            signing_algorithm: SigningAlgorithm::parse(&env_var_or("JWT_ALGORITHM", "RS256")),
            rsa_key_size_bits: env_parse_or("RSA_KEY_SIZE_BITS", 4096usize),
            pbkdf2_iterations,
            tokens: TokenConfig {
                access_token_secs: env_parse_or("ACCESS_TOKEN_LIFETIME_SECS", 3600i64),
                refresh_token_secs: env_parse_or("REFRESH_TOKEN_LIFETIME_SECS", 2_592_000i64),
                id_token_secs: env_parse_or("ID_TOKEN_LIFETIME_SECS", 3600i64),
                auth_code_secs: env_parse_or("AUTH_CODE_LIFETIME_SECS", 300i64),
            },
            session: SessionConfig {
                idle_secs: env_parse_or("SESSION_IDLE_TIMEOUT_SECS", 1800i64),
                absolute_secs: env_parse_or("SESSION_ABSOLUTE_TIMEOUT_SECS", 28_800i64),
            },
            rate_limit: RateLimitConfig {
                max_attempts: env_parse_or("RATE_LIMIT_MAX_ATTEMPTS", 3u32),
                window_secs: env_parse_or("RATE_LIMIT_WINDOW_SECS", 900u64),
            },
            webauthn: WebAuthnConfig {
                rp_id: env_var_or("WEBAUTHN_RP_ID", "localhost"),
                rp_name: env_var_or("WEBAUTHN_RP_NAME", "Aegis Identity Platform"),
                origins: env_var_or("WEBAUTHN_ORIGINS", "http://localhost:8080")
                    .split(',')
                    .map(|s| s.trim().trim_end_matches('/').to_owned())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            mfa: MfaConfig {
                policy_file: env::var("MFA_POLICY_FILE").ok().map(PathBuf::from),
                interactive_timeout_secs: env_parse_or("MFA_INTERACTIVE_TIMEOUT_SECS", 120u64),
                non_interactive_timeout_secs: env_parse_or(
                    "MFA_NON_INTERACTIVE_TIMEOUT_SECS",
                    10u64,
                ),
            },
            rotation: RotationConfig {
                grace_secs: env_parse_or("SECRET_ROTATION_GRACE_SECS", 604_800i64),
            },
            cleanup: CleanupConfig {
                sweep_interval_secs: env_parse_or("CLEANUP_SWEEP_INTERVAL_SECS", 3600u64),
                grace_secs: env_parse_or("CLEANUP_GRACE_SECS", 600i64),
            },
            revocation_cache_secs: env_parse_or("REVOCATION_CACHE_TTL_SECS", 300u64),
            discovery_cache_secs: env_parse_or("DISCOVERY_CACHE_TTL_SECS", 300u64),
            redirect_uri_strict_match: true,
        })
    }

    /// URL of the hosted login page, carrying the authorization request id
    #[must_use]
    pub fn login_url(&self, request_id: uuid::Uuid) -> String {
        format!("{}/oidc/v1/login?request_id={request_id}", self.issuer_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.tokens.auth_code_secs, 300);
        assert_eq!(config.rate_limit.max_attempts, 3);
        assert_eq!(config.rate_limit.window_secs, 900);
        assert!(config.redirect_uri_strict_match);
        assert!(config.pbkdf2_iterations >= 210_000);
    }
}
