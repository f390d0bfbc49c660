// ABOUTME: Shared fixtures for integration tests
// ABOUTME: In-memory database, fast ES256 keys, and seeded users/clients
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(dead_code, missing_docs)]

use aegis_idp::config::environment::{
    CleanupConfig, MfaConfig, RateLimitConfig, RotationConfig, ServerConfig, SessionConfig,
    TokenConfig, WebAuthnConfig,
};
use aegis_idp::context::ServerResources;
use aegis_idp::crypto::{self, SigningAlgorithm};
use aegis_idp::database::Database;
use aegis_idp::delivery::LogDeliveryProvider;
use aegis_idp::errors::AppResult;
use aegis_idp::mfa::otp::DeliveryProvider;
use aegis_idp::models::{Client, ClientAuthMethod, TokenLifetimes, User};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// One recorded outbound message from the capturing provider
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub to: String,
    pub body: String,
}

/// Delivery provider that captures messages for assertions
#[derive(Default)]
pub struct CapturingDelivery {
    pub sent: Mutex<Vec<SentMessage>>,
    pub fail_next: Mutex<bool>,
}

impl CapturingDelivery {
    pub fn last_body(&self) -> Option<String> {
        self.sent.lock().unwrap().last().map(|m| m.body.clone())
    }

    pub fn fail_next(&self) {
        *self.fail_next.lock().unwrap() = true;
    }

    fn record(&self, to: &str, body: &str) -> AppResult<()> {
        if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
            return Err(aegis_idp::errors::AppError::new(
                aegis_idp::errors::ErrorCode::DeliveryFailure,
                "provider unavailable",
            ));
        }
        self.sent.lock().unwrap().push(SentMessage {
            to: to.to_owned(),
            body: body.to_owned(),
        });
        Ok(())
    }
}

#[async_trait]
impl DeliveryProvider for CapturingDelivery {
    async fn send_sms(&self, to: &str, body: &str) -> AppResult<()> {
        self.record(to, body)
    }

    async fn send_email(&self, to: &str, _subject: &str, body: &str) -> AppResult<()> {
        self.record(to, body)
    }

    async fn healthy(&self) -> bool {
        true
    }
}

/// Fresh in-memory database with the schema applied
pub async fn test_database() -> Database {
    let database = Database::connect("sqlite::memory:").await.unwrap();
    database.migrate().await.unwrap();
    database
}

/// Test configuration: in-memory storage, ES256 (fast key generation), and
/// a policy file that keeps the password-only path deterministic
pub fn test_config(policy_file: Option<std::path::PathBuf>) -> ServerConfig {
    ServerConfig {
        issuer_url: "http://idp.test".to_owned(),
        http_port: 0,
        database_url: "sqlite::memory:".to_owned(),
        signing_algorithm: SigningAlgorithm::Es256,
        rsa_key_size_bits: 2048,
        pbkdf2_iterations: 210_000,
        tokens: TokenConfig {
            access_token_secs: 3600,
            refresh_token_secs: 2_592_000,
            id_token_secs: 3600,
            auth_code_secs: 300,
        },
        session: SessionConfig {
            idle_secs: 1800,
            absolute_secs: 28_800,
        },
        rate_limit: RateLimitConfig {
            max_attempts: 3,
            window_secs: 900,
        },
        webauthn: WebAuthnConfig {
            rp_id: "idp.test".to_owned(),
            rp_name: "Aegis Test".to_owned(),
            origins: vec!["http://idp.test".to_owned()],
        },
        mfa: MfaConfig {
            policy_file,
            interactive_timeout_secs: 120,
            non_interactive_timeout_secs: 10,
        },
        rotation: RotationConfig {
            grace_secs: 604_800,
        },
        cleanup: CleanupConfig {
            sweep_interval_secs: 3600,
            grace_secs: 600,
        },
        revocation_cache_secs: 300,
        discovery_cache_secs: 300,
        redirect_uri_strict_match: true,
    }
}

/// Policy YAML that never demands step-up; keeps browser-flow tests
/// independent of the wall clock
pub const PASSWORD_ONLY_POLICY: &str = "weights:\n  unknown_device: 0.0\n  off_hours: 0.0\n  failure_history: 1.0\n";

/// Fully wired resources over an in-memory database
pub async fn test_resources() -> (Arc<ServerResources>, tempfile::NamedTempFile) {
    test_resources_with_delivery(Arc::new(LogDeliveryProvider)).await
}

/// Fully wired resources with a custom delivery provider
pub async fn test_resources_with_delivery(
    delivery: Arc<dyn DeliveryProvider>,
) -> (Arc<ServerResources>, tempfile::NamedTempFile) {
    let policy_file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(policy_file.path(), PASSWORD_ONLY_POLICY).unwrap();

    let config = test_config(Some(policy_file.path().to_path_buf()));
    let resources = ServerResources::initialize(config, delivery, &[7u8; 32], Vec::new())
        .await
        .unwrap();

    (resources, policy_file)
}

/// Seed a user with the given password
pub async fn create_test_user(database: &Database, username: &str, password: &str) -> User {
    let hash = crypto::hash_secret(password, 210_000).unwrap();
    let mut user = User::new(username, hash, Some(format!("{username}@example.com")));
    user.display_name = Some("Test User".to_owned());
    database.create_user(&user).await.unwrap();
    user
}

/// Seed a confidential client with an initial secret version
pub async fn create_test_client(database: &Database, client_id: &str, secret: &str) -> Client {
    let client = Client {
        id: Uuid::now_v7(),
        client_id: client_id.to_owned(),
        name: "Demo Application".to_owned(),
        grant_types: vec![
            "authorization_code".to_owned(),
            "refresh_token".to_owned(),
            "client_credentials".to_owned(),
        ],
        response_types: vec!["code".to_owned()],
        redirect_uris: vec!["https://rp.example/cb".to_owned()],
        allowed_scopes: vec![
            "openid".to_owned(),
            "profile".to_owned(),
            "email".to_owned(),
            "offline_access".to_owned(),
        ],
        auth_method: ClientAuthMethod::SecretBasic,
        require_pkce: true,
        token_lifetimes: TokenLifetimes::default(),
        mtls_fingerprint: None,
        assertion_jwks: None,
        created_at: Utc::now(),
    };
    database.create_client(&client).await.unwrap();

    let hash = crypto::hash_secret(secret, 210_000).unwrap();
    database
        .insert_initial_secret_version(client.id, &hash)
        .await
        .unwrap();

    client
}

/// RFC 7636 appendix values used across the flow tests
pub const PKCE_VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
pub const PKCE_CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";
