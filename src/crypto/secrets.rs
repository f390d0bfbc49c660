// ABOUTME: PBKDF2-HMAC-SHA256 secret hashing with a self-describing tagged format
// ABOUTME: Legacy bcrypt hashes verify read-only during migration; new hashes are always PBKDF2
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

//! Secret hashing
//!
//! Stored format: `pbkdf2$<iterations>$<base64(salt)>$<base64(key)>`.
//! Inputs longer than 72 octets are pre-composed through SHA-256 before
//! derivation so that hash-function length limits never leak into protocol
//! design; the composition is identical on the generate and verify paths.

use crate::errors::{AppError, AppResult};
use base64::{engine::general_purpose, Engine as _};
use pbkdf2::pbkdf2_hmac;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// FIPS floor for PBKDF2-HMAC-SHA256; configurable upward, never downward
pub const MIN_PBKDF2_ITERATIONS: u32 = 210_000;

/// Salt length in bytes
const SALT_LEN: usize = 16;

/// Derived key length in bytes
const KEY_LEN: usize = 32;

/// Inputs longer than this are pre-composed through SHA-256
const PRECOMPOSE_THRESHOLD: usize = 72;

/// Tag identifying the approved scheme
const PBKDF2_TAG: &str = "pbkdf2";

/// Reduce an input to the bytes fed into the KDF
///
/// The same reduction runs in both `hash_secret` and `verify_secret`;
/// diverging here would silently break every stored magic-link hash.
fn precompose(secret: &str) -> Vec<u8> {
    if secret.len() > PRECOMPOSE_THRESHOLD {
        Sha256::digest(secret.as_bytes()).to_vec()
    } else {
        secret.as_bytes().to_vec()
    }
}

/// Hash a secret with PBKDF2-HMAC-SHA256 into the tagged storage format
///
/// # Errors
/// Returns an error if the iteration count is below the approved floor or
/// the system RNG fails.
pub fn hash_secret(secret: &str, iterations: u32) -> AppResult<String> {
    if iterations < MIN_PBKDF2_ITERATIONS {
        return Err(AppError::config(format!(
            "PBKDF2 iteration count {iterations} is below the approved floor {MIN_PBKDF2_ITERATIONS}"
        )));
    }

    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt)
        .map_err(|_| AppError::crypto("system RNG failure while generating salt"))?;

    let mut input = precompose(secret);
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(&input, &salt, iterations, &mut key);
    input.zeroize();

    let encoded = format!(
        "{PBKDF2_TAG}${iterations}${}${}",
        general_purpose::STANDARD.encode(salt),
        general_purpose::STANDARD.encode(key)
    );
    key.zeroize();

    Ok(encoded)
}

/// Verify a presented secret against a stored tagged hash
///
/// Accepts the approved `pbkdf2` tag and, read-only for migration, legacy
/// bcrypt hashes (`$2a$` / `$2b$` / `$2y$`). Legacy verification never
/// produces new legacy hashes; callers re-hash on successful login.
///
/// # Errors
/// Returns an error if the stored hash is malformed or carries an
/// unsupported tag.
pub fn verify_secret(secret: &str, stored: &str) -> AppResult<bool> {
    if stored.starts_with("$2a$") || stored.starts_with("$2b$") || stored.starts_with("$2y$") {
        return bcrypt::verify(secret, stored)
            .map_err(|e| AppError::crypto(format!("legacy hash verification failed: {e}")));
    }

    let mut parts = stored.split('$');
    let tag = parts.next().unwrap_or_default();
    if tag != PBKDF2_TAG {
        return Err(AppError::crypto(format!("unsupported hash tag '{tag}'")));
    }

    let iterations: u32 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| AppError::crypto("malformed pbkdf2 hash: iteration field"))?;
    let salt = parts
        .next()
        .and_then(|s| general_purpose::STANDARD.decode(s).ok())
        .ok_or_else(|| AppError::crypto("malformed pbkdf2 hash: salt field"))?;
    let expected = parts
        .next()
        .and_then(|s| general_purpose::STANDARD.decode(s).ok())
        .ok_or_else(|| AppError::crypto("malformed pbkdf2 hash: key field"))?;
    if parts.next().is_some() || expected.len() != KEY_LEN {
        return Err(AppError::crypto("malformed pbkdf2 hash: layout"));
    }

    let mut input = precompose(secret);
    let mut derived = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(&input, &salt, iterations, &mut derived);
    input.zeroize();

    let matches: bool = derived.ct_eq(expected.as_slice()).into();
    derived.zeroize();

    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests run the KDF at the floor; production configs only go up from here.
    const ITER: u32 = MIN_PBKDF2_ITERATIONS;

    #[test]
    fn round_trip() {
        let hash = hash_secret("correct horse battery staple", ITER).unwrap();
        assert!(hash.starts_with("pbkdf2$210000$"));
        assert!(verify_secret("correct horse battery staple", &hash).unwrap());
        assert!(!verify_secret("correct horse battery staples", &hash).unwrap());
    }

    #[test]
    fn salt_entropy_means_no_repeated_output() {
        let a = hash_secret("same-secret", ITER).unwrap();
        let b = hash_secret("same-secret", ITER).unwrap();
        assert_ne!(a, b);
        assert!(verify_secret("same-secret", &a).unwrap());
        assert!(verify_secret("same-secret", &b).unwrap());
    }

    #[test]
    fn long_inputs_precompose_identically() {
        // 43 bytes of base64url is fine; a magic-link token at 86 chars
        // crosses the 72-octet threshold
        let long = "A".repeat(86);
        let hash = hash_secret(&long, ITER).unwrap();
        assert!(verify_secret(&long, &hash).unwrap());
        assert!(!verify_secret(&"A".repeat(85), &hash).unwrap());
    }

    #[test]
    fn iteration_floor_is_enforced() {
        assert!(hash_secret("s", MIN_PBKDF2_ITERATIONS - 1).is_err());
    }

    #[test]
    fn legacy_bcrypt_verifies_read_only() {
        let legacy = bcrypt::hash("old-password", 4).unwrap();
        assert!(verify_secret("old-password", &legacy).unwrap());
        assert!(!verify_secret("new-password", &legacy).unwrap());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(verify_secret("s", "argon2$x$y$z").is_err());
    }
}
