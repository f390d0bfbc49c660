// ABOUTME: Client authentication dispatcher - mTLS, secret basic/post, and JWT assertions
// ABOUTME: Exactly one credential may be presented; secrets verify against the active and in-grace versions
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

//! Client authentication (token endpoint)
//!
//! One entry point inspects the request for each supported method in
//! order: mTLS, `client_secret_basic`, `client_secret_post`, JWT
//! assertion. Presenting more than one credential is an `invalid_request`.
//! All authentication failures collapse to `invalid_client` without
//! distinguishing the reason.

/// mTLS chain validation and revocation checking
pub mod mtls;

use crate::crypto;
use crate::database::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{Client, ClientAuthMethod};
use axum::http::HeaderMap;
use base64::engine::general_purpose;
use base64::Engine as _;
use chrono::Utc;
use mtls::MtlsVerifier;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// RFC 7523 assertion type for JWT client authentication
const JWT_BEARER_ASSERTION: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Header a TLS-terminating proxy uses to forward the peer certificate
/// (base64 DER)
const CLIENT_CERT_HEADER: &str = "x-ssl-client-cert";

/// Credentials extracted from one token-endpoint request
#[derive(Debug, Default)]
pub struct PresentedCredentials {
    /// `Authorization: Basic` header pair
    pub basic: Option<(String, String)>,
    /// `client_id` + `client_secret` form fields
    pub post: Option<(String, String)>,
    /// (`client_assertion_type`, `client_assertion`) form fields
    pub assertion: Option<(String, String)>,
    /// Forwarded TLS peer certificate, DER
    pub client_cert: Option<Vec<u8>>,
    /// Bare `client_id` form field (mTLS and assertion flows)
    pub client_id_param: Option<String>,
}

impl PresentedCredentials {
    /// Extract credentials from headers and the decoded form body
    #[must_use]
    pub fn from_request(headers: &HeaderMap, form: &HashMap<String, String>) -> Self {
        let basic = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "))
            .and_then(|encoded| general_purpose::STANDARD.decode(encoded).ok())
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .and_then(|pair| {
                pair.split_once(':').map(|(id, secret)| {
                    // RFC 6749 §2.3.1: both halves are form-urlencoded
                    (
                        urlencoding::decode(id).map_or_else(|_| id.to_owned(), |s| s.into_owned()),
                        urlencoding::decode(secret)
                            .map_or_else(|_| secret.to_owned(), |s| s.into_owned()),
                    )
                })
            });

        let post = match (form.get("client_id"), form.get("client_secret")) {
            (Some(id), Some(secret)) => Some((id.clone(), secret.clone())),
            _ => None,
        };

        let assertion = match (form.get("client_assertion_type"), form.get("client_assertion")) {
            (Some(kind), Some(value)) => Some((kind.clone(), value.clone())),
            _ => None,
        };

        let client_cert = headers
            .get(CLIENT_CERT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| general_purpose::STANDARD.decode(v).ok());

        Self {
            basic,
            post,
            assertion,
            client_cert,
            client_id_param: form.get("client_id").cloned(),
        }
    }

    fn presented_count(&self) -> usize {
        usize::from(self.basic.is_some())
            + usize::from(self.post.is_some())
            + usize::from(self.assertion.is_some())
            + usize::from(self.client_cert.is_some())
    }
}

/// Claims of an RFC 7523 client assertion
#[derive(Debug, Deserialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
    aud: serde_json::Value,
    exp: i64,
}

/// Client authenticator
pub struct ClientAuthenticator {
    database: Database,
    mtls: Arc<MtlsVerifier>,
    token_endpoint_url: String,
}

impl ClientAuthenticator {
    /// Create an authenticator
    #[must_use]
    pub fn new(database: Database, mtls: Arc<MtlsVerifier>, token_endpoint_url: String) -> Self {
        Self {
            database,
            mtls,
            token_endpoint_url,
        }
    }

    /// Authenticate the client behind a token-endpoint request
    ///
    /// # Errors
    /// `invalid_request` when multiple credentials are presented;
    /// `invalid_client` for every authentication failure, without
    /// distinguishing the reason.
    pub async fn authenticate(&self, presented: &PresentedCredentials) -> AppResult<Client> {
        match presented.presented_count() {
            0 => return Err(AppError::invalid_client()),
            1 => {}
            _ => {
                return Err(AppError::invalid_request(
                    "multiple client authentication methods presented",
                ))
            }
        }

        if let Some(cert_der) = &presented.client_cert {
            let client_id = presented
                .client_id_param
                .as_deref()
                .ok_or_else(|| AppError::invalid_request("client_id is required with mTLS"))?;
            return self.authenticate_mtls(client_id, cert_der).await;
        }
        if let Some((client_id, secret)) = &presented.basic {
            return self
                .authenticate_secret(client_id, secret, ClientAuthMethod::SecretBasic)
                .await;
        }
        if let Some((client_id, secret)) = &presented.post {
            return self
                .authenticate_secret(client_id, secret, ClientAuthMethod::SecretPost)
                .await;
        }
        if let Some((assertion_type, assertion)) = &presented.assertion {
            return self.authenticate_assertion(assertion_type, assertion).await;
        }

        Err(AppError::invalid_client())
    }

    async fn load_client(&self, client_id: &str) -> AppResult<Client> {
        self.database
            .get_client_by_client_id(client_id)
            .await
            .map_err(|e| {
                tracing::error!("client lookup failed for client_id={client_id}: {e:#}");
                AppError::invalid_client()
            })?
            .ok_or_else(AppError::invalid_client)
    }

    /// Verify a secret against every currently verifiable version
    ///
    /// Every candidate version is checked even after a match so response
    /// time does not reveal which version matched.
    async fn authenticate_secret(
        &self,
        client_id: &str,
        secret: &str,
        method: ClientAuthMethod,
    ) -> AppResult<Client> {
        let client = self.load_client(client_id).await?;

        // Basic and post are interchangeable presentations of the same
        // stored secret; assertion- and certificate-registered clients
        // cannot fall back to a bare secret
        if !matches!(
            client.auth_method,
            ClientAuthMethod::SecretBasic | ClientAuthMethod::SecretPost
        ) {
            tracing::warn!(
                client_id = %client_id,
                "client presented {} but is registered for {}",
                method.as_str(),
                client.auth_method.as_str()
            );
            return Err(AppError::invalid_client());
        }

        let versions = self
            .database
            .verifiable_secret_versions(client.id, Utc::now())
            .await
            .map_err(|e| {
                tracing::error!("secret version lookup failed: {e:#}");
                AppError::invalid_client()
            })?;

        if versions.is_empty() {
            // No active version at all: a misconfigured client fails every
            // secret-based authentication
            tracing::error!(client_id = %client_id, "client has no verifiable secret version");
            return Err(AppError::invalid_client());
        }

        let mut matched = false;
        for version in &versions {
            if crypto::verify_secret(secret, &version.secret_hash).unwrap_or(false) {
                matched = true;
            }
        }

        if matched {
            Ok(client)
        } else {
            Err(AppError::invalid_client())
        }
    }

    async fn authenticate_mtls(&self, client_id: &str, cert_der: &[u8]) -> AppResult<Client> {
        let client = self.load_client(client_id).await?;

        match client.auth_method {
            ClientAuthMethod::Mtls => {
                self.mtls.verify_ca_issued(cert_der).await?;
                Ok(client)
            }
            ClientAuthMethod::SelfSignedMtls => {
                let pin = client
                    .mtls_fingerprint
                    .as_deref()
                    .ok_or_else(AppError::invalid_client)?;
                self.mtls.verify_self_signed(cert_der, pin)?;
                Ok(client)
            }
            _ => Err(AppError::invalid_client()),
        }
    }

    /// Verify an RFC 7523 JWT client assertion
    ///
    /// `private_key_jwt` verifies against the client's registered JWKS.
    /// `client_secret_jwt` cannot verify against hashed secrets and is
    /// rejected; registering such a client is a configuration error.
    async fn authenticate_assertion(
        &self,
        assertion_type: &str,
        assertion: &str,
    ) -> AppResult<Client> {
        if assertion_type != JWT_BEARER_ASSERTION {
            return Err(AppError::invalid_request("unsupported client_assertion_type"));
        }

        // The issuer claim names the client; read it before verification to
        // select the key material
        let header = jsonwebtoken::decode_header(assertion)
            .map_err(|_| AppError::invalid_client())?;
        let unverified = decode_unverified_claims(assertion)?;
        let client = self.load_client(&unverified.iss).await?;

        if client.auth_method != ClientAuthMethod::PrivateKeyJwt {
            tracing::warn!(
                client_id = %client.client_id,
                "assertion presented but client is registered for {}",
                client.auth_method.as_str()
            );
            return Err(AppError::invalid_client());
        }

        let jwks_raw = client
            .assertion_jwks
            .as_deref()
            .ok_or_else(AppError::invalid_client)?;
        let jwks: crate::crypto::JsonWebKeySet =
            serde_json::from_str(jwks_raw).map_err(|_| AppError::invalid_client())?;

        let claims = verify_assertion(assertion, &header, &jwks)?;

        if claims.iss != client.client_id || claims.sub != client.client_id {
            return Err(AppError::invalid_client());
        }
        if !audience_matches(&claims.aud, &self.token_endpoint_url) {
            return Err(AppError::invalid_client());
        }
        if claims.exp <= Utc::now().timestamp() {
            return Err(AppError::invalid_client());
        }

        Ok(client)
    }
}

/// Decode assertion claims without verification, to select key material
fn decode_unverified_claims(assertion: &str) -> AppResult<AssertionClaims> {
    let mut parts = assertion.split('.');
    let payload = parts
        .nth(1)
        .ok_or_else(|| AppError::invalid_request("malformed client_assertion"))?;
    let raw = general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| AppError::invalid_request("malformed client_assertion"))?;
    serde_json::from_slice(&raw).map_err(|_| AppError::invalid_request("malformed client_assertion"))
}

/// Verify the assertion signature against one of the registered JWKs
fn verify_assertion(
    assertion: &str,
    header: &jsonwebtoken::Header,
    jwks: &crate::crypto::JsonWebKeySet,
) -> AppResult<AssertionClaims> {
    use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

    let candidates = jwks.keys.iter().filter(|jwk| {
        header
            .kid
            .as_deref()
            .is_none_or(|kid| jwk.kid == kid)
    });

    for jwk in candidates {
        let (algorithm, key) = match (jwk.kty.as_str(), &jwk.n, &jwk.e, &jwk.x, &jwk.y) {
            ("RSA", Some(n), Some(e), _, _) => {
                match DecodingKey::from_rsa_components(n, e) {
                    Ok(key) => (Algorithm::RS256, key),
                    Err(_) => continue,
                }
            }
            ("EC", _, _, Some(x), Some(y)) => match DecodingKey::from_ec_components(x, y) {
                Ok(key) => (Algorithm::ES256, key),
                Err(_) => continue,
            },
            _ => continue,
        };

        if header.alg != algorithm {
            continue;
        }

        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        validation.validate_aud = false;
        if let Ok(data) = decode::<AssertionClaims>(assertion, &key, &validation) {
            return Ok(data.claims);
        }
    }

    Err(AppError::invalid_client())
}

/// RFC 7523 audience: a string or array containing the token endpoint
fn audience_matches(aud: &serde_json::Value, token_endpoint: &str) -> bool {
    match aud {
        serde_json::Value::String(s) => s == token_endpoint,
        serde_json::Value::Array(values) => values
            .iter()
            .any(|v| v.as_str() == Some(token_endpoint)),
        _ => false,
    }
}
