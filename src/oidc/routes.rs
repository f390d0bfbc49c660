// ABOUTME: Router for the /oidc/v1 surface and the well-known documents
// ABOUTME: Login, consent, userinfo, logout, WebAuthn ceremonies, discovery, JWKS
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use crate::context::ServerResources;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

/// Build the OIDC router
pub fn oidc_router() -> Router<Arc<ServerResources>> {
    Router::new()
        .route(
            "/oidc/v1/login",
            get(super::login::handle_login_page).post(super::login::handle_login_submit),
        )
        .route("/oidc/v1/login/mfa", post(super::login::handle_login_mfa))
        .route("/oidc/v1/magic", get(super::login::handle_magic_link))
        .route(
            "/oidc/v1/consent",
            get(super::consent::handle_consent_page).post(super::consent::handle_consent_submit),
        )
        .route(
            "/oidc/v1/totp/enroll",
            post(super::totp_http::handle_totp_enroll),
        )
        .route("/oidc/v1/userinfo", get(super::userinfo::handle_userinfo))
        .route("/oidc/v1/logout", post(super::logout::handle_logout))
        .route(
            "/oidc/v1/webauthn/register/begin",
            post(super::webauthn_http::handle_register_begin),
        )
        .route(
            "/oidc/v1/webauthn/register/finish",
            post(super::webauthn_http::handle_register_finish),
        )
        .route(
            "/oidc/v1/webauthn/authenticate/begin",
            post(super::webauthn_http::handle_authenticate_begin),
        )
        .route(
            "/oidc/v1/webauthn/authenticate/finish",
            post(super::webauthn_http::handle_authenticate_finish),
        )
        .route(
            "/.well-known/openid-configuration",
            get(super::discovery::handle_discovery),
        )
        .route("/.well-known/jwks.json", get(super::discovery::handle_jwks))
}
