// ABOUTME: Main library entry point for the Aegis identity platform
// ABOUTME: OAuth 2.1 authorization server and OpenID Connect provider
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

#![deny(unsafe_code)]

//! # Aegis Identity Platform
//!
//! An OAuth 2.1 / OpenID Connect authorization server and identity
//! provider.
//!
//! ## Architecture
//!
//! Three tightly coupled subsystems form the core:
//!
//! - **Authorization code flow state machine** - issuance and redemption of
//!   single-use authorization codes bound to PKCE challenges and resolved
//!   user identities (`oauth2`, `oidc`, `database`)
//! - **Credential engine** - PBKDF2 secret hashing, TOTP/OTP/magic-link
//!   validation, WebAuthn ceremonies with replay protection, client secret
//!   rotation with grace windows (`crypto`, `mfa`, `rotation`)
//! - **Adaptive authentication orchestrator** - risk-scored factor chains
//!   producing an assurance verdict per session (`mfa::orchestrator`)
//!
//! Everything persists through the `database` credential store; every
//! state change is a conditional write guarded by its predecessor state.

/// Structured audit events with PII masking
pub mod audit;

/// Periodic cleanup of expired codes, tokens, sessions, and challenges
pub mod cleanup;

/// Token-endpoint client authentication (secrets, mTLS, assertions)
pub mod client_auth;

/// Configuration management
pub mod config;

/// Shared server resources for HTTP handlers
pub mod context;

/// Cryptographic primitives: hashing, CSPRNG, PKCE, JWS keys
pub mod crypto;

/// Credential store over SQLite
pub mod database;

/// Delivery provider implementations
pub mod delivery;

/// Unified error handling with the OAuth wire vocabulary
pub mod errors;

/// Liveness probe
pub mod health;

/// Structured logging setup
pub mod logging;

/// Multi-factor authentication subsystem
pub mod mfa;

/// Core domain entities
pub mod models;

/// OAuth 2.1 authorization server endpoints
pub mod oauth2;

/// OpenID Connect provider surface
pub mod oidc;

/// Sliding-window rate limiting
pub mod rate_limiting;

/// Secret rotation with grace windows
pub mod rotation;

/// Top-level router assembly
pub mod routes;
