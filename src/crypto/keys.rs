// ABOUTME: JWS signing key management with kid-based rotation and JWKS generation
// ABOUTME: RS256 or ES256 per issuer; rotation swaps an immutable snapshot and retains the previous key
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

//! Signing key management
//!
//! - Private keys never leave the process
//! - Public keys distributed via `/.well-known/jwks.json`
//! - Rotation retains the previous key for verification until its
//!   descendants have expired
//! - Readers capture one immutable snapshot per request; rotation is an
//!   atomic pointer swap

use crate::errors::{AppError, AppResult};
use arc_swap::ArcSwap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{EncodePrivateKey as _, EncodePublicKey as _, LineEnding};
use rsa::pkcs8::{EncodePrivateKey as _, EncodePublicKey as _};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// RSA key size in bits for RS256 (2048 bits minimum, 4096 recommended)
const RSA_KEY_SIZE: usize = 4096;

/// Signing algorithm configured per issuer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    /// RSASSA-PKCS1-v1_5 with SHA-256
    Rs256,
    /// ECDSA P-256 with SHA-256
    Es256,
}

impl SigningAlgorithm {
    /// JOSE algorithm name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rs256 => "RS256",
            Self::Es256 => "ES256",
        }
    }

    /// Parse from configuration; anything unrecognized falls back to RS256
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "ES256" => Self::Es256,
            _ => Self::Rs256,
        }
    }

    /// The `jsonwebtoken` algorithm; this is the entire verification
    /// allowlist, so `none` and cross-algorithm tokens can never validate
    #[must_use]
    pub const fn jwt_algorithm(self) -> Algorithm {
        match self {
            Self::Rs256 => Algorithm::RS256,
            Self::Es256 => Algorithm::ES256,
        }
    }
}

/// JWK (JSON Web Key) representation for the JWKS endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonWebKey {
    /// Key type ("RSA" or "EC")
    pub kty: String,
    /// Public key use (always "sig")
    #[serde(rename = "use")]
    pub key_use: String,
    /// Key ID for rotation tracking
    pub kid: String,
    /// Algorithm (RS256 or ES256)
    pub alg: String,
    /// RSA modulus (base64url)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// RSA exponent (base64url)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    /// EC curve name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    /// EC x coordinate (base64url)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    /// EC y coordinate (base64url)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

/// JWKS (JSON Web Key Set) container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonWebKeySet {
    /// Public keys, newest first
    pub keys: Vec<JsonWebKey>,
}

/// One generated signing key with both JOSE halves pre-built
struct SigningKey {
    kid: String,
    version: i64,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    jwk: JsonWebKey,
    created_at: DateTime<Utc>,
}

impl SigningKey {
    fn generate(algorithm: SigningAlgorithm, version: i64, rsa_bits: usize) -> AppResult<Self> {
        let kid = format!("sig-{:04}-{}", version, &uuid::Uuid::now_v7().simple().to_string()[..8]);
        match algorithm {
            SigningAlgorithm::Rs256 => Self::generate_rs256(kid, version, rsa_bits),
            SigningAlgorithm::Es256 => Self::generate_es256(kid, version),
        }
    }

    fn generate_rs256(kid: String, version: i64, bits: usize) -> AppResult<Self> {
        let mut rng = rand::rngs::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| AppError::crypto(format!("RSA key generation failed: {e}")))?;
        let public_key = RsaPublicKey::from(&private_key);

        let private_pem = private_key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| AppError::crypto(format!("RSA private key PEM export failed: {e}")))?;
        let public_pem = public_key
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| AppError::crypto(format!("RSA public key PEM export failed: {e}")))?;

        let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| AppError::crypto(format!("RSA encoding key creation failed: {e}")))?;
        let decoding_key = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| AppError::crypto(format!("RSA decoding key creation failed: {e}")))?;

        let jwk = JsonWebKey {
            kty: "RSA".to_owned(),
            key_use: "sig".to_owned(),
            kid: kid.clone(),
            alg: SigningAlgorithm::Rs256.as_str().to_owned(),
            n: Some(URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be())),
            e: Some(URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be())),
            crv: None,
            x: None,
            y: None,
        };

        Ok(Self {
            kid,
            version,
            encoding_key,
            decoding_key,
            jwk,
            created_at: Utc::now(),
        })
    }

    fn generate_es256(kid: String, version: i64) -> AppResult<Self> {
        let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let public = secret.public_key();

        let private_pem = secret
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AppError::crypto(format!("EC private key PEM export failed: {e}")))?;
        let public_pem = public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::crypto(format!("EC public key PEM export failed: {e}")))?;

        let encoding_key = EncodingKey::from_ec_pem(private_pem.as_bytes())
            .map_err(|e| AppError::crypto(format!("EC encoding key creation failed: {e}")))?;
        let decoding_key = DecodingKey::from_ec_pem(public_pem.as_bytes())
            .map_err(|e| AppError::crypto(format!("EC decoding key creation failed: {e}")))?;

        let point = public.to_encoded_point(false);
        let x = point
            .x()
            .ok_or_else(|| AppError::crypto("EC public key missing x coordinate"))?;
        let y = point
            .y()
            .ok_or_else(|| AppError::crypto("EC public key missing y coordinate"))?;

        let jwk = JsonWebKey {
            kty: "EC".to_owned(),
            key_use: "sig".to_owned(),
            kid: kid.clone(),
            alg: SigningAlgorithm::Es256.as_str().to_owned(),
            n: None,
            e: None,
            crv: Some("P-256".to_owned()),
            x: Some(URL_SAFE_NO_PAD.encode(x)),
            y: Some(URL_SAFE_NO_PAD.encode(y)),
        };

        Ok(Self {
            kid,
            version,
            encoding_key,
            decoding_key,
            jwk,
            created_at: Utc::now(),
        })
    }
}

/// Immutable view of the key set; swapped wholesale on rotation
struct KeySnapshot {
    active: Arc<SigningKey>,
    previous: Option<Arc<SigningKey>>,
}

/// Outcome of a signing-key rotation, for the audit log
#[derive(Debug, Clone)]
pub struct KeyRotation {
    /// Retired key id
    pub old_kid: String,
    /// Newly active key id
    pub new_kid: String,
    /// Retired key version
    pub old_version: i64,
    /// New key version
    pub new_version: i64,
}

/// Signing key manager
///
/// Read-mostly: `sign`, `verify`, and `jwks` capture the snapshot pointer
/// once and never observe a half-rotated state.
pub struct SigningKeyManager {
    algorithm: SigningAlgorithm,
    rsa_key_size: usize,
    snapshot: ArcSwap<KeySnapshot>,
    version_counter: AtomicI64,
}

impl SigningKeyManager {
    /// Create a manager with a freshly generated active key
    ///
    /// # Errors
    /// Returns an error if key generation fails.
    pub fn new(algorithm: SigningAlgorithm) -> AppResult<Self> {
        Self::with_rsa_key_size(algorithm, RSA_KEY_SIZE)
    }

    /// Create a manager with a configurable RSA key size
    ///
    /// 2048 bits keeps test suites fast; production stays at 4096.
    ///
    /// # Errors
    /// Returns an error if key generation fails.
    pub fn with_rsa_key_size(algorithm: SigningAlgorithm, rsa_key_size: usize) -> AppResult<Self> {
        let active = Arc::new(SigningKey::generate(algorithm, 1, rsa_key_size)?);
        Ok(Self {
            algorithm,
            rsa_key_size,
            snapshot: ArcSwap::from_pointee(KeySnapshot {
                active,
                previous: None,
            }),
            version_counter: AtomicI64::new(1),
        })
    }

    /// The configured signing algorithm
    #[must_use]
    pub const fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    /// Key id of the currently active signing key
    #[must_use]
    pub fn active_kid(&self) -> String {
        self.snapshot.load().active.kid.clone()
    }

    /// Current key epoch; bumps on every rotation
    ///
    /// Callers caching the discovery or JWKS documents compare epochs to
    /// decide when to regenerate.
    #[must_use]
    pub fn epoch(&self) -> i64 {
        self.version_counter.load(Ordering::Acquire)
    }

    /// Rotate the signing key
    ///
    /// The old active key becomes the previous key and keeps verifying
    /// until the next rotation displaces it.
    ///
    /// # Errors
    /// Returns an error if key generation fails.
    pub fn rotate(&self) -> AppResult<KeyRotation> {
        let new_version = self.version_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let new_key = Arc::new(SigningKey::generate(
            self.algorithm,
            new_version,
            self.rsa_key_size,
        )?);

        let old = self.snapshot.load_full();
        let rotation = KeyRotation {
            old_kid: old.active.kid.clone(),
            new_kid: new_key.kid.clone(),
            old_version: old.active.version,
            new_version,
        };

        self.snapshot.store(Arc::new(KeySnapshot {
            active: new_key,
            previous: Some(Arc::clone(&old.active)),
        }));

        tracing::info!(
            old_kid = %rotation.old_kid,
            new_kid = %rotation.new_kid,
            "signing key rotated"
        );

        Ok(rotation)
    }

    /// Sign claims into a compact JWS with the active key
    ///
    /// # Errors
    /// Returns an error if JWT encoding fails.
    pub fn sign<T: Serialize>(&self, claims: &T, typ: &str) -> AppResult<String> {
        let snapshot = self.snapshot.load();
        let mut header = Header::new(self.algorithm.jwt_algorithm());
        header.kid = Some(snapshot.active.kid.clone());
        header.typ = Some(typ.to_owned());

        encode(&header, claims, &snapshot.active.encoding_key)
            .map_err(|e| AppError::crypto(format!("JWS signing failed: {e}")))
    }

    /// Verify a compact JWS and deserialize its claims
    ///
    /// The configured algorithm is the entire allowlist; `alg: none` and
    /// any cross-algorithm token fail before signature checking. The key is
    /// selected by `kid` among the active and previous keys.
    ///
    /// # Errors
    /// Returns an error on malformed tokens, unknown `kid`, algorithm
    /// mismatch, bad signature, or expired claims (when `validate_exp`).
    pub fn verify<T: DeserializeOwned>(&self, token: &str, validate_exp: bool) -> AppResult<T> {
        let header = decode_header(token)
            .map_err(|e| AppError::invalid_grant(format!("malformed token: {e}")))?;

        if header.alg != self.algorithm.jwt_algorithm() {
            return Err(AppError::invalid_grant("token algorithm not allowed"));
        }

        let snapshot = self.snapshot.load();
        let kid = header.kid.as_deref().unwrap_or_default();
        let key = if snapshot.active.kid == kid {
            &snapshot.active
        } else {
            match &snapshot.previous {
                Some(previous) if previous.kid == kid => previous,
                _ => return Err(AppError::invalid_grant("unknown signing key")),
            }
        };

        let mut validation = Validation::new(self.algorithm.jwt_algorithm());
        validation.validate_exp = validate_exp;
        validation.validate_aud = false;
        validation.leeway = 0;

        decode::<T>(token, &key.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| AppError::invalid_grant(format!("token verification failed: {e}")))
    }

    /// Public JWKS document: current and previous keys
    #[must_use]
    pub fn jwks(&self) -> JsonWebKeySet {
        let snapshot = self.snapshot.load();
        let mut keys = vec![snapshot.active.jwk.clone()];
        if let Some(previous) = &snapshot.previous {
            keys.push(previous.jwk.clone());
        }
        JsonWebKeySet { keys }
    }

    /// Creation time of the active key, for operator visibility
    #[must_use]
    pub fn active_key_created_at(&self) -> DateTime<Utc> {
        self.snapshot.load().active.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct TestClaims {
        sub: String,
        exp: i64,
    }

    fn claims() -> TestClaims {
        TestClaims {
            sub: "subject".into(),
            exp: Utc::now().timestamp() + 300,
        }
    }

    #[test]
    fn es256_sign_verify_round_trip() {
        let manager = SigningKeyManager::new(SigningAlgorithm::Es256).unwrap();
        let token = manager.sign(&claims(), "at+jwt").unwrap();
        let decoded: TestClaims = manager.verify(&token, true).unwrap();
        assert_eq!(decoded.sub, "subject");
    }

    #[test]
    fn rotation_keeps_previous_key_verifiable() {
        let manager = SigningKeyManager::new(SigningAlgorithm::Es256).unwrap();
        let token = manager.sign(&claims(), "at+jwt").unwrap();

        let rotation = manager.rotate().unwrap();
        assert_ne!(rotation.old_kid, rotation.new_kid);

        // Token signed before rotation still verifies via the previous key
        let decoded: TestClaims = manager.verify(&token, true).unwrap();
        assert_eq!(decoded.sub, "subject");

        // A second rotation displaces it
        manager.rotate().unwrap();
        assert!(manager.verify::<TestClaims>(&token, true).is_err());
    }

    #[test]
    fn jwks_exposes_current_and_previous() {
        let manager = SigningKeyManager::new(SigningAlgorithm::Es256).unwrap();
        assert_eq!(manager.jwks().keys.len(), 1);
        manager.rotate().unwrap();
        let jwks = manager.jwks();
        assert_eq!(jwks.keys.len(), 2);
        assert_eq!(jwks.keys[0].kty, "EC");
        assert_eq!(jwks.keys[0].crv.as_deref(), Some("P-256"));
    }

    #[test]
    fn cross_algorithm_token_is_rejected() {
        let es = SigningKeyManager::new(SigningAlgorithm::Es256).unwrap();
        let rs = SigningKeyManager::with_rsa_key_size(SigningAlgorithm::Rs256, 2048).unwrap();
        let token = es.sign(&claims(), "at+jwt").unwrap();
        assert!(rs.verify::<TestClaims>(&token, true).is_err());
    }
}
