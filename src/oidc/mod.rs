// ABOUTME: OpenID Connect provider surface - login, consent, userinfo, logout, discovery
// ABOUTME: Browser-facing flows are session-bound with CSRF tokens on every form submission
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

/// Consent prompt and authorization code minting
pub mod consent;
/// Cookie helpers
pub mod cookies;
/// Discovery and JWKS documents
pub mod discovery;
/// Login and step-up handlers
pub mod login;
/// Session termination
pub mod logout;
/// Server-rendered HTML
pub mod pages;
/// Router wiring for the /oidc/v1 surface
pub mod routes;
/// Session-guarded TOTP enrollment
pub mod totp_http;
/// Bearer-protected claims endpoint
pub mod userinfo;
/// Browser-driven WebAuthn ceremony endpoints
pub mod webauthn_http;

pub use routes::oidc_router;
