// ABOUTME: OIDC discovery and JWKS endpoints with short-lived byte-stable caching
// ABOUTME: Documents regenerate only when the signing-key epoch changes; responses carry Cache-Control
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

//! /.well-known/openid-configuration and /.well-known/jwks.json
//!
//! Both documents are serialized once per key epoch and served byte-stable
//! from the cached string until the epoch changes or the short cache TTL
//! lapses (a lapse within one epoch regenerates identical bytes).

use crate::context::ServerResources;
use arc_swap::ArcSwapOption;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

struct CachedDocument {
    epoch: i64,
    rendered_at: Instant,
    body: String,
}

/// Epoch-aware cache for one serialized document
pub struct DocumentCache {
    current: ArcSwapOption<CachedDocument>,
}

impl DocumentCache {
    /// Create an empty cache
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: ArcSwapOption::const_empty(),
        }
    }

    /// Serve the cached body or rebuild via `render`
    fn get_or_render(
        &self,
        epoch: i64,
        ttl: std::time::Duration,
        render: impl FnOnce() -> String,
    ) -> String {
        if let Some(cached) = self.current.load_full() {
            if cached.epoch == epoch && cached.rendered_at.elapsed() < ttl {
                return cached.body.clone();
            }
        }

        let body = render();
        self.current.store(Some(Arc::new(CachedDocument {
            epoch,
            rendered_at: Instant::now(),
            body: body.clone(),
        })));
        body
    }
}

impl Default for DocumentCache {
    fn default() -> Self {
        Self::new()
    }
}

fn json_response(body: String, max_age_secs: u64) -> Response {
    (
        [
            (CONTENT_TYPE, "application/json".to_owned()),
            (CACHE_CONTROL, format!("public, max-age={max_age_secs}")),
        ],
        body,
    )
        .into_response()
}

/// Handle GET /.well-known/openid-configuration
pub async fn handle_discovery(State(resources): State<Arc<ServerResources>>) -> Response {
    let issuer = &resources.config.issuer_url;
    let ttl = std::time::Duration::from_secs(resources.config.discovery_cache_secs);

    let body = resources.discovery_cache.get_or_render(resources.keys.epoch(), ttl, || {
        let document = json!({
            "issuer": issuer,
            "authorization_endpoint": format!("{issuer}/oauth2/v1/authorize"),
            "token_endpoint": format!("{issuer}/oauth2/v1/token"),
            "introspection_endpoint": format!("{issuer}/oauth2/v1/introspect"),
            "revocation_endpoint": format!("{issuer}/oauth2/v1/revoke"),
            "userinfo_endpoint": format!("{issuer}/oidc/v1/userinfo"),
            "end_session_endpoint": format!("{issuer}/oidc/v1/logout"),
            "jwks_uri": format!("{issuer}/.well-known/jwks.json"),
            "response_types_supported": ["code"],
            "grant_types_supported": ["authorization_code", "refresh_token", "client_credentials"],
            "scopes_supported": ["openid", "profile", "email", "offline_access"],
            "code_challenge_methods_supported": ["S256"],
            "token_endpoint_auth_methods_supported": [
                "client_secret_basic",
                "client_secret_post",
                "private_key_jwt",
                "tls_client_auth",
                "self_signed_tls_client_auth",
            ],
            "subject_types_supported": ["public"],
            "id_token_signing_alg_values_supported": [resources.keys.algorithm().as_str()],
        });
        document.to_string()
    });

    json_response(body, resources.config.discovery_cache_secs)
}

/// Handle GET /.well-known/jwks.json
pub async fn handle_jwks(State(resources): State<Arc<ServerResources>>) -> Response {
    let ttl = std::time::Duration::from_secs(resources.config.discovery_cache_secs);

    let body = resources.jwks_cache.get_or_render(resources.keys.epoch(), ttl, || {
        serde_json::to_string(&resources.keys.jwks()).unwrap_or_else(|_| "{\"keys\":[]}".to_owned())
    });

    json_response(body, resources.config.discovery_cache_secs)
}
