// ABOUTME: PKCE (RFC 7636) S256 challenge computation and verifier validation
// ABOUTME: Only the S256 method exists here; plain is rejected at the endpoint layer
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use crate::errors::{AppError, AppResult};
use base64::{engine::general_purpose, Engine as _};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Minimum verifier/challenge length per RFC 7636 §4.1
const MIN_LEN: usize = 43;

/// Maximum verifier/challenge length per RFC 7636 §4.1
const MAX_LEN: usize = 128;

/// Validate a PKCE code verifier's format
///
/// Length must be in [43, 128] and every character must be unreserved:
/// `[A-Z] / [a-z] / [0-9] / "-" / "." / "_" / "~"`.
///
/// # Errors
/// Returns `InvalidGrant` on any format violation.
pub fn validate_verifier(verifier: &str) -> AppResult<()> {
    if verifier.len() < MIN_LEN || verifier.len() > MAX_LEN {
        return Err(AppError::invalid_grant(
            "code_verifier must be between 43 and 128 characters",
        ));
    }
    if !verifier
        .chars()
        .all(|c| matches!(c, 'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '.' | '_' | '~'))
    {
        return Err(AppError::invalid_grant(
            "code_verifier contains invalid characters",
        ));
    }
    Ok(())
}

/// Validate a PKCE code challenge's format as received at `/authorize`
///
/// # Errors
/// Returns `InvalidRequest` if the challenge is not base64url-shaped or the
/// wrong length.
pub fn validate_challenge(challenge: &str) -> AppResult<()> {
    if challenge.len() < MIN_LEN || challenge.len() > MAX_LEN {
        return Err(AppError::invalid_request(
            "code_challenge must be between 43 and 128 characters",
        ));
    }
    if !challenge
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(AppError::invalid_request(
            "code_challenge must be base64url encoded",
        ));
    }
    Ok(())
}

/// Compute the S256 challenge for a verifier: `base64url-nopad(SHA-256(verifier))`
#[must_use]
pub fn compute_challenge_s256(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    general_purpose::URL_SAFE_NO_PAD.encode(hash)
}

/// Verify a presented verifier against a stored S256 challenge in constant time
#[must_use]
pub fn verify_s256(verifier: &str, stored_challenge: &str) -> bool {
    let computed = compute_challenge_s256(verifier);
    computed
        .as_bytes()
        .ct_eq(stored_challenge.as_bytes())
        .into()
}
