// ABOUTME: CSPRNG generation of codes, tokens, OTPs, and WebAuthn challenges
// ABOUTME: All randomness flows through ring's SystemRandom; OTPs use rejection sampling
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use crate::errors::{AppError, AppResult};
use base64::{engine::general_purpose, Engine as _};
use ring::rand::{SecureRandom, SystemRandom};

/// Byte length of authorization codes, refresh tokens, session identifiers,
/// and magic-link tokens
const TOKEN_BYTES: usize = 32;

/// Byte length of a WebAuthn ceremony challenge
const WEBAUTHN_CHALLENGE_BYTES: usize = 32;

/// Number of distinct numeric OTP values
const OTP_SPACE: u32 = 1_000_000;

/// Generate a 32-byte URL-safe base64 token
///
/// # Errors
/// Returns an error if the system RNG fails; the server cannot operate
/// securely without working RNG.
pub fn generate_token() -> AppResult<String> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; TOKEN_BYTES];
    rng.fill(&mut bytes).map_err(|_| {
        tracing::error!("CRITICAL: SystemRandom failed - cannot generate secure random bytes");
        AppError::crypto("system RNG failure")
    })?;
    Ok(general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Generate raw challenge bytes for a WebAuthn ceremony
///
/// # Errors
/// Returns an error if the system RNG fails.
pub fn generate_webauthn_challenge() -> AppResult<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; WEBAUTHN_CHALLENGE_BYTES];
    rng.fill(&mut bytes)
        .map_err(|_| AppError::crypto("system RNG failure"))?;
    Ok(bytes)
}

/// Generate a 6-digit numeric OTP, uniform over [000000, 999999]
///
/// Uses rejection sampling rather than a bare modulo so no code is more
/// likely than any other.
///
/// # Errors
/// Returns an error if the system RNG fails.
pub fn generate_numeric_otp() -> AppResult<String> {
    let rng = SystemRandom::new();
    // Largest multiple of OTP_SPACE representable in u32; values at or above
    // it would bias the low codes and are redrawn
    let zone = u32::MAX - (u32::MAX % OTP_SPACE);

    loop {
        let mut bytes = [0u8; 4];
        rng.fill(&mut bytes)
            .map_err(|_| AppError::crypto("system RNG failure"))?;
        let value = u32::from_be_bytes(bytes);
        if value < zone {
            return Ok(format!("{:06}", value % OTP_SPACE));
        }
    }
}
