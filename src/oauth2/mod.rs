// ABOUTME: OAuth 2.1 authorization server endpoints
// ABOUTME: Authorization endpoint, token endpoint with all grants, introspection, and revocation
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

/// Authorization endpoint (GET /oauth2/v1/authorize)
pub mod authorize;
/// Wire models and the OAuth error response type
pub mod models;
/// Router wiring for the /oauth2/v1 surface
pub mod routes;
/// Token endpoint, introspection, and revocation
pub mod token;

pub use models::{
    AccessTokenClaims, IdTokenClaims, IntrospectionResponse, OAuth2Error, TokenResponse,
};
pub use routes::oauth2_router;
