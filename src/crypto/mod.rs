// ABOUTME: Cryptographic primitives for the identity platform
// ABOUTME: Secret hashing, CSPRNG generation, PKCE S256, and JWS signing keys
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

/// JWS signing key management and JWKS document generation
pub mod keys;
/// PKCE S256 challenge computation and verifier validation
pub mod pkce;
/// CSPRNG token, code, and OTP generation
pub mod random;
/// PBKDF2-HMAC-SHA256 secret hashing with legacy verify-only support
pub mod secrets;

pub use keys::{JsonWebKey, JsonWebKeySet, SigningAlgorithm, SigningKeyManager};
pub use pkce::{compute_challenge_s256, validate_challenge, validate_verifier, verify_s256};
pub use random::{generate_numeric_otp, generate_token, generate_webauthn_challenge};
pub use secrets::{hash_secret, verify_secret, MIN_PBKDF2_ITERATIONS};
