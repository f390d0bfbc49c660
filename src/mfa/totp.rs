// ABOUTME: RFC 6238 TOTP validation with a configurable step window, plus enrollment
// ABOUTME: Shared secrets live AES-GCM-encrypted at rest; the validator sees plaintext only via a resolver
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

//! TOTP (RFC 6238)
//!
//! HMAC-SHA1, 30-second step, 6-digit codes, ±1 step window by default.
//! The shared secret is stored encrypted under an externally-managed key;
//! [`TotpValidator`] receives plaintext only through the
//! [`TotpSecretResolver`] callback.

use crate::errors::{AppError, AppResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use ring::rand::{SecureRandom, SystemRandom};
use sha1::Sha1;
use subtle::ConstantTimeEq;
use uuid::Uuid;
use zeroize::Zeroizing;

/// RFC 6238 time step in seconds
const STEP_SECS: i64 = 30;

/// Code length in digits
const DIGITS: u32 = 6;

/// Shared secret length in bytes (160 bits, the SHA-1 block-friendly size)
const SECRET_LEN: usize = 20;

/// AES-GCM nonce length
const NONCE_LEN: usize = 12;

/// Resolver callback handing the validator a plaintext secret for a user
///
/// Implementations own decryption and key management; the validator never
/// touches ciphertext.
#[async_trait::async_trait]
pub trait TotpSecretResolver: Send + Sync {
    /// Resolve the plaintext TOTP secret for `user_id`, or `None` when the
    /// user is not enrolled
    ///
    /// # Errors
    /// Returns an error when decryption fails.
    async fn resolve(&self, user_id: Uuid) -> AppResult<Option<Zeroizing<Vec<u8>>>>;
}

/// RFC 6238 validator
pub struct TotpValidator {
    /// Accepted steps on either side of now
    window: u32,
}

impl Default for TotpValidator {
    fn default() -> Self {
        Self { window: 1 }
    }
}

impl TotpValidator {
    /// Create a validator with a custom step window
    #[must_use]
    pub const fn new(window: u32) -> Self {
        Self { window }
    }

    /// Compute the code for one counter value (RFC 4226 dynamic truncation)
    fn hotp(secret: &[u8], counter: u64) -> AppResult<String> {
        let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(secret)
            .map_err(|_| AppError::crypto("TOTP secret rejected by HMAC"))?;
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        let offset = (digest[19] & 0x0f) as usize;
        let binary = (u32::from(digest[offset]) & 0x7f) << 24
            | u32::from(digest[offset + 1]) << 16
            | u32::from(digest[offset + 2]) << 8
            | u32::from(digest[offset + 3]);

        Ok(format!("{:06}", binary % 10u32.pow(DIGITS)))
    }

    /// Compute the code for a moment in time
    ///
    /// # Errors
    /// Returns an error if the secret is unusable.
    pub fn code_at(secret: &[u8], at: DateTime<Utc>) -> AppResult<String> {
        let counter = (at.timestamp() / STEP_SECS).max(0) as u64;
        Self::hotp(secret, counter)
    }

    /// Verify a presented code against the secret within the window
    ///
    /// # Errors
    /// Returns an error if the secret is unusable; a wrong code is `Ok(false)`.
    pub fn verify(&self, secret: &[u8], presented: &str, now: DateTime<Utc>) -> AppResult<bool> {
        if presented.len() != DIGITS as usize || !presented.chars().all(|c| c.is_ascii_digit()) {
            return Ok(false);
        }

        let current = (now.timestamp() / STEP_SECS).max(0) as u64;
        let window = i64::from(self.window);

        for offset in -window..=window {
            let counter = current.wrapping_add_signed(offset);
            let expected = Self::hotp(secret, counter)?;
            if bool::from(expected.as_bytes().ct_eq(presented.as_bytes())) {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Verify a code for a user through the secret resolver
    ///
    /// # Errors
    /// Returns an error when the user is not enrolled or the secret is
    /// unusable; a wrong code is `Ok(false)`.
    pub async fn verify_for_user(
        &self,
        resolver: &dyn TotpSecretResolver,
        user_id: Uuid,
        presented: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let Some(secret) = resolver.resolve(user_id).await? else {
            return Err(AppError::invalid_request("user has no enrolled TOTP secret"));
        };
        self.verify(&secret, presented, now)
    }
}

/// AES-256-GCM at-rest store for TOTP secrets; also the default resolver
///
/// The data key comes from outside (environment, KMS); this store never
/// persists it.
pub struct TotpSecretStore {
    cipher: Aes256Gcm,
    database: crate::database::Database,
}

impl TotpSecretStore {
    /// Create a store over a 32-byte master key
    ///
    /// # Errors
    /// Returns an error if the key length is wrong.
    pub fn new(master_key: &[u8], database: crate::database::Database) -> AppResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(master_key)
            .map_err(|_| AppError::config("TOTP master key must be 32 bytes"))?;
        Ok(Self { cipher, database })
    }

    /// Generate and encrypt a fresh secret, returning (ciphertext for
    /// storage, provisioning URI for the authenticator app)
    ///
    /// # Errors
    /// Returns an error if the RNG or cipher fails.
    pub fn enroll(&self, issuer: &str, username: &str) -> AppResult<(String, String)> {
        let rng = SystemRandom::new();
        let mut secret = Zeroizing::new(vec![0u8; SECRET_LEN]);
        rng.fill(&mut secret)
            .map_err(|_| AppError::crypto("system RNG failure"))?;

        let ciphertext = self.encrypt(&secret)?;
        let uri = format!(
            "otpauth://totp/{issuer}:{username}?secret={}&issuer={issuer}&algorithm=SHA1&digits=6&period=30",
            base32_encode(&secret)
        );

        Ok((ciphertext, uri))
    }

    /// Encrypt a plaintext secret: base64(nonce || ciphertext)
    ///
    /// # Errors
    /// Returns an error if the RNG or cipher fails.
    pub fn encrypt(&self, secret: &[u8]) -> AppResult<String> {
        let rng = SystemRandom::new();
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rng.fill(&mut nonce_bytes)
            .map_err(|_| AppError::crypto("system RNG failure"))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, secret)
            .map_err(|_| AppError::crypto("TOTP secret encryption failed"))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(combined))
    }

    /// Decrypt a stored secret
    ///
    /// # Errors
    /// Returns an error on malformed or tampered ciphertext.
    pub fn decrypt(&self, stored: &str) -> AppResult<Zeroizing<Vec<u8>>> {
        let combined = general_purpose::STANDARD
            .decode(stored)
            .map_err(|_| AppError::crypto("malformed TOTP ciphertext"))?;
        if combined.len() <= NONCE_LEN {
            return Err(AppError::crypto("malformed TOTP ciphertext"));
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| AppError::crypto("TOTP secret decryption failed"))?;

        Ok(Zeroizing::new(plaintext))
    }
}

#[async_trait::async_trait]
impl TotpSecretResolver for TotpSecretStore {
    async fn resolve(&self, user_id: Uuid) -> AppResult<Option<Zeroizing<Vec<u8>>>> {
        let stored = self.database.get_user(user_id).await.map_err(AppError::from)?;

        stored
            .and_then(|user| user.totp_secret_enc)
            .map(|enc| self.decrypt(&enc))
            .transpose()
    }
}

/// RFC 4648 base32 (no padding), as authenticator apps expect
fn base32_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut buffer: u64 = 0;
    let mut bits = 0u32;

    for &byte in data {
        buffer = (buffer << 8) | u64::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // RFC 6238 Appendix B test secret (SHA-1 rows)
    const RFC_SECRET: &[u8] = b"12345678901234567890";

    #[test]
    fn rfc_6238_vectors() {
        let cases = [
            (59i64, "287082"),
            (1_111_111_109, "081804"),
            (1_111_111_111, "050471"),
            (1_234_567_890, "005924"),
            (2_000_000_000, "279037"),
        ];
        for (timestamp, expected) in cases {
            let at = Utc.timestamp_opt(timestamp, 0).unwrap();
            assert_eq!(TotpValidator::code_at(RFC_SECRET, at).unwrap(), expected);
        }
    }

    #[test]
    fn window_accepts_adjacent_steps() {
        let validator = TotpValidator::default();
        let now = Utc.timestamp_opt(1_111_111_111, 0).unwrap();

        let previous_step = TotpValidator::code_at(RFC_SECRET, now - chrono::Duration::seconds(30))
            .unwrap();
        let next_step =
            TotpValidator::code_at(RFC_SECRET, now + chrono::Duration::seconds(30)).unwrap();
        let two_steps_back =
            TotpValidator::code_at(RFC_SECRET, now - chrono::Duration::seconds(60)).unwrap();

        assert!(validator.verify(RFC_SECRET, &previous_step, now).unwrap());
        assert!(validator.verify(RFC_SECRET, &next_step, now).unwrap());
        assert!(!validator.verify(RFC_SECRET, &two_steps_back, now).unwrap());
    }

    #[test]
    fn malformed_codes_fail_fast() {
        let validator = TotpValidator::default();
        let now = Utc::now();
        assert!(!validator.verify(RFC_SECRET, "12345", now).unwrap());
        assert!(!validator.verify(RFC_SECRET, "abcdef", now).unwrap());
    }

    #[test]
    fn base32_matches_rfc_4648() {
        assert_eq!(base32_encode(b"foobar"), "MZXW6YTBOI");
        assert_eq!(base32_encode(b""), "");
    }
}
