// ABOUTME: Shared server resources threaded through every HTTP handler as axum state
// ABOUTME: One aggregate of Arc'd subsystems, wired once at startup
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use crate::client_auth::mtls::{HttpRevocationFetcher, MtlsVerifier};
use crate::client_auth::ClientAuthenticator;
use crate::config::ServerConfig;
use crate::crypto::SigningKeyManager;
use crate::database::Database;
use crate::mfa::orchestrator::{Orchestrator, OrchestratorPolicy, PolicyStore};
use crate::mfa::otp::{DeliveryProvider, OtpAuthenticator};
use crate::mfa::totp::{TotpSecretStore, TotpValidator};
use crate::mfa::webauthn::WebAuthnAuthenticator;
use crate::rotation::SecretRotationService;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

/// Everything a request handler can reach
pub struct ServerResources {
    /// Credential store
    pub database: Database,
    /// Server configuration loaded from the environment
    pub config: Arc<ServerConfig>,
    /// JWS signing keys and JWKS
    pub keys: Arc<SigningKeyManager>,
    /// Token-endpoint client authentication
    pub client_auth: Arc<ClientAuthenticator>,
    /// OTP / magic-link authenticator
    pub otp: Arc<OtpAuthenticator>,
    /// TOTP validator
    pub totp: Arc<TotpValidator>,
    /// At-rest TOTP secret store (doubles as the secret resolver)
    pub totp_secrets: Arc<TotpSecretStore>,
    /// WebAuthn ceremonies
    pub webauthn: Arc<WebAuthnAuthenticator>,
    /// Adaptive authentication orchestrator
    pub orchestrator: Arc<Orchestrator>,
    /// Orchestrator policy store; exposed for operator-driven reload
    pub policy: Arc<PolicyStore>,
    /// Client secret rotation
    pub rotation: Arc<SecretRotationService>,
    /// Epoch-keyed cache for the discovery document
    pub discovery_cache: crate::oidc::discovery::DocumentCache,
    /// Epoch-keyed cache for the JWKS document
    pub jwks_cache: crate::oidc::discovery::DocumentCache,
}

impl ServerResources {
    /// Wire up every subsystem from configuration
    ///
    /// `delivery` is the outbound SMS/email capability; `totp_master_key`
    /// is the externally-managed 32-byte data key; `trust_anchors` are the
    /// DER certificates mTLS clients must chain to.
    ///
    /// # Errors
    /// Returns an error when any subsystem fails to initialize.
    pub async fn initialize(
        config: ServerConfig,
        delivery: Arc<dyn DeliveryProvider>,
        totp_master_key: &[u8],
        trust_anchors: Vec<Vec<u8>>,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(config);

        let database = Database::connect(&config.database_url)
            .await
            .context("database connection failed")?;
        database.migrate().await.context("database migration failed")?;

        let keys = Arc::new(
            SigningKeyManager::with_rsa_key_size(
                config.signing_algorithm,
                config.rsa_key_size_bits,
            )
            .context("signing key generation failed")?,
        );

        let mtls = Arc::new(MtlsVerifier::new(
            trust_anchors,
            Box::new(HttpRevocationFetcher::new()),
            Duration::from_secs(config.revocation_cache_secs),
        ));
        let client_auth = Arc::new(ClientAuthenticator::new(
            database.clone(),
            mtls,
            format!("{}/oauth2/v1/token", config.issuer_url),
        ));

        let otp = Arc::new(OtpAuthenticator::new(
            database.clone(),
            delivery,
            config.rate_limit.max_attempts,
            Duration::from_secs(config.rate_limit.window_secs),
            config.pbkdf2_iterations,
            config.issuer_url.clone(),
        ));

        let totp = Arc::new(TotpValidator::default());
        let totp_secrets = Arc::new(
            TotpSecretStore::new(totp_master_key, database.clone())
                .context("TOTP secret store initialization failed")?,
        );

        let webauthn = Arc::new(WebAuthnAuthenticator::new(
            database.clone(),
            config.webauthn.clone(),
        ));

        let policy = Arc::new(match &config.mfa.policy_file {
            Some(path) => PolicyStore::from_file(path.clone())
                .context("orchestrator policy file failed to load")?,
            None => PolicyStore::new(OrchestratorPolicy::default()),
        });
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&policy),
            Duration::from_secs(config.mfa.interactive_timeout_secs),
            Duration::from_secs(config.mfa.non_interactive_timeout_secs),
        ));

        let rotation = Arc::new(SecretRotationService::new(
            database.clone(),
            chrono::Duration::seconds(config.rotation.grace_secs),
            config.pbkdf2_iterations,
        ));

        Ok(Arc::new(Self {
            database,
            config,
            keys,
            client_auth,
            otp,
            totp,
            totp_secrets,
            webauthn,
            orchestrator,
            policy,
            rotation,
            discovery_cache: crate::oidc::discovery::DocumentCache::new(),
            jwks_cache: crate::oidc::discovery::DocumentCache::new(),
        }))
    }
}
