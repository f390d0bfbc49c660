// ABOUTME: WebAuthn registration and assertion ceremonies with sign-counter replay detection
// ABOUTME: Challenges are stored keyed by their own bytes with a 5-minute TTL and consumed atomically
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

//! WebAuthn authenticator
//!
//! Both ceremonies follow the same outline: mint a 32-byte challenge,
//! persist it keyed by its own bytes, hand options to the browser, then on
//! finish consume the stored challenge, validate client data (type, origin)
//! and authenticator data (RP ID hash, flags), and verify the attestation
//! or assertion cryptographically. A sign counter that fails to strictly
//! increase marks the credential suspect and rejects the assertion.

/// COSE public key parsing and signature verification
pub mod cose;

use crate::audit;
use crate::config::environment::WebAuthnConfig;
use crate::crypto;
use crate::database::Database;
use crate::errors::{AppError, AppResult, ErrorCode};
use crate::models::{
    AuthenticationChallenge, ChallengeKind, User, WebAuthnCredential, WebAuthnCredentialState,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use cose::CosePublicKey;
use serde::Deserialize;
use serde_cbor::Value as CborValue;
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Authenticator data flag: user present
const FLAG_USER_PRESENT: u8 = 0x01;
/// Authenticator data flag: attested credential data included
const FLAG_ATTESTED_CREDENTIAL_DATA: u8 = 0x40;

/// Client data as posted by the browser (decoded from `clientDataJSON`)
#[derive(Debug, Deserialize)]
struct CollectedClientData {
    #[serde(rename = "type")]
    ceremony_type: String,
    challenge: String,
    origin: String,
}

/// Inner registration response fields
#[derive(Debug, Deserialize)]
pub struct AttestationResponseInner {
    /// Base64url `clientDataJSON`
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: String,
    /// Base64url CBOR attestation object
    #[serde(rename = "attestationObject")]
    pub attestation_object: String,
}

/// Registration ceremony response from the browser
#[derive(Debug, Deserialize)]
pub struct RegistrationResponse {
    /// Base64url credential id
    pub id: String,
    /// Response payloads
    pub response: AttestationResponseInner,
}

/// Inner assertion response fields
#[derive(Debug, Deserialize)]
pub struct AssertionResponseInner {
    /// Base64url `clientDataJSON`
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: String,
    /// Base64url raw authenticator data
    #[serde(rename = "authenticatorData")]
    pub authenticator_data: String,
    /// Base64url signature
    pub signature: String,
}

/// Assertion ceremony response from the browser
#[derive(Debug, Deserialize)]
pub struct AssertionResponse {
    /// Base64url credential id
    pub id: String,
    /// Response payloads
    pub response: AssertionResponseInner,
}

/// Parsed authenticator data
struct AuthenticatorData {
    rp_id_hash: [u8; 32],
    flags: u8,
    sign_count: u32,
    attested_credential: Option<AttestedCredentialData>,
}

/// Attested credential data (registration only)
struct AttestedCredentialData {
    aaguid: [u8; 16],
    credential_id: Vec<u8>,
    public_key_cose: Vec<u8>,
}

fn parse_authenticator_data(bytes: &[u8], expect_attested: bool) -> AppResult<AuthenticatorData> {
    if bytes.len() < 37 {
        return Err(AppError::invalid_request("authenticator data too short"));
    }

    let mut rp_id_hash = [0u8; 32];
    rp_id_hash.copy_from_slice(&bytes[..32]);
    let flags = bytes[32];
    let sign_count = u32::from_be_bytes([bytes[33], bytes[34], bytes[35], bytes[36]]);

    let attested_credential = if flags & FLAG_ATTESTED_CREDENTIAL_DATA != 0 {
        let rest = &bytes[37..];
        if rest.len() < 18 {
            return Err(AppError::invalid_request("attested credential data truncated"));
        }
        let mut aaguid = [0u8; 16];
        aaguid.copy_from_slice(&rest[..16]);
        let id_len = usize::from(u16::from_be_bytes([rest[16], rest[17]]));
        if rest.len() < 18 + id_len {
            return Err(AppError::invalid_request("credential id truncated"));
        }
        let credential_id = rest[18..18 + id_len].to_vec();

        // The COSE key is a single CBOR value; extensions may follow it
        let key_bytes = &rest[18 + id_len..];
        let mut deserializer = serde_cbor::Deserializer::from_slice(key_bytes);
        let key_value: CborValue = serde::Deserialize::deserialize(&mut deserializer)
            .map_err(|_| AppError::invalid_request("malformed COSE key in authenticator data"))?;
        let public_key_cose = serde_cbor::to_vec(&key_value)
            .map_err(|_| AppError::crypto("COSE key re-serialization failed"))?;

        Some(AttestedCredentialData {
            aaguid,
            credential_id,
            public_key_cose,
        })
    } else {
        None
    };

    if expect_attested && attested_credential.is_none() {
        return Err(AppError::invalid_request(
            "registration requires attested credential data",
        ));
    }

    Ok(AuthenticatorData {
        rp_id_hash,
        flags,
        sign_count,
        attested_credential,
    })
}

/// WebAuthn registration and assertion ceremonies
pub struct WebAuthnAuthenticator {
    database: Database,
    config: WebAuthnConfig,
}

impl WebAuthnAuthenticator {
    /// Create an authenticator for the configured relying party
    #[must_use]
    pub const fn new(database: Database, config: WebAuthnConfig) -> Self {
        Self { database, config }
    }

    fn validate_client_data(
        &self,
        client_data_b64: &str,
        expected_type: &str,
    ) -> AppResult<(CollectedClientData, Vec<u8>)> {
        let raw = URL_SAFE_NO_PAD
            .decode(client_data_b64)
            .map_err(|_| AppError::invalid_request("clientDataJSON is not base64url"))?;
        let client_data: CollectedClientData = serde_json::from_slice(&raw)
            .map_err(|_| AppError::invalid_request("clientDataJSON is not valid JSON"))?;

        if client_data.ceremony_type != expected_type {
            return Err(AppError::invalid_request("unexpected client data type"));
        }
        let origin = client_data.origin.trim_end_matches('/');
        if !self.config.origins.iter().any(|allowed| allowed == origin) {
            return Err(AppError::new(
                ErrorCode::AccessDenied,
                "origin is not in the allow-list",
            ));
        }

        Ok((client_data, raw))
    }

    fn check_rp_id_hash(&self, auth_data: &AuthenticatorData) -> AppResult<()> {
        let expected = Sha256::digest(self.config.rp_id.as_bytes());
        if auth_data.rp_id_hash != expected.as_slice() {
            return Err(AppError::invalid_request("relying party id hash mismatch"));
        }
        if auth_data.flags & FLAG_USER_PRESENT == 0 {
            return Err(AppError::invalid_request("user presence flag not set"));
        }
        Ok(())
    }

    async fn store_ceremony_challenge(
        &self,
        kind: ChallengeKind,
        user_id: Uuid,
        challenge_b64: &str,
    ) -> AppResult<()> {
        let now = Utc::now();
        let challenge = AuthenticationChallenge {
            id: Uuid::now_v7(),
            kind,
            user_id: Some(user_id),
            verifier_hash: None,
            webauthn_challenge: Some(challenge_b64.to_owned()),
            metadata: json!({}),
            created_at: now,
            expires_at: now + kind.ttl(),
            attempts: 0,
            max_attempts: 1,
            consumed: false,
            failed: false,
        };
        self.database
            .create_challenge(&challenge)
            .await
            .map_err(AppError::from)
    }

    /// Begin a registration ceremony: mint and store a challenge, return
    /// creation options for the browser
    ///
    /// # Errors
    /// Returns an error on RNG or storage failure.
    pub async fn begin_registration(&self, user: &User) -> AppResult<JsonValue> {
        let challenge_bytes = crypto::generate_webauthn_challenge()?;
        let challenge_b64 = URL_SAFE_NO_PAD.encode(&challenge_bytes);

        self.store_ceremony_challenge(
            ChallengeKind::WebauthnRegistration,
            user.id,
            &challenge_b64,
        )
        .await?;

        let existing = self
            .database
            .list_webauthn_credentials(user.id)
            .await
            .map_err(AppError::from)?;
        let exclude: Vec<JsonValue> = existing
            .iter()
            .map(|c| json!({ "type": "public-key", "id": c.credential_id }))
            .collect();

        Ok(json!({
            "rp": { "id": self.config.rp_id, "name": self.config.rp_name },
            "user": {
                "id": URL_SAFE_NO_PAD.encode(user.id.as_bytes()),
                "name": user.username,
                "displayName": user.display_name.as_deref().unwrap_or(&user.username),
            },
            "challenge": challenge_b64,
            "pubKeyCredParams": [
                { "type": "public-key", "alg": -7 },
                { "type": "public-key", "alg": -257 },
            ],
            "excludeCredentials": exclude,
            "authenticatorSelection": { "userVerification": "preferred" },
            "attestation": "none",
            "timeout": 120_000,
        }))
    }

    /// Finish a registration ceremony and store the new credential
    ///
    /// # Errors
    /// Returns an error when the challenge is dead, the origin or RP ID
    /// does not match, or the attestation object is malformed.
    pub async fn finish_registration(
        &self,
        response: &RegistrationResponse,
        label: Option<String>,
    ) -> AppResult<WebAuthnCredential> {
        let (client_data, _) =
            self.validate_client_data(&response.response.client_data_json, "webauthn.create")?;

        let now = Utc::now();
        let challenge = self
            .database
            .consume_webauthn_challenge(
                ChallengeKind::WebauthnRegistration,
                &client_data.challenge,
                now,
            )
            .await
            .map_err(AppError::from)?
            .ok_or_else(|| AppError::invalid_grant("unknown or expired registration challenge"))?;
        let user_id = challenge
            .user_id
            .ok_or_else(|| AppError::internal("registration challenge without subject"))?;

        let attestation_bytes = URL_SAFE_NO_PAD
            .decode(&response.response.attestation_object)
            .map_err(|_| AppError::invalid_request("attestationObject is not base64url"))?;
        let attestation: CborValue = serde_cbor::from_slice(&attestation_bytes)
            .map_err(|_| AppError::invalid_request("attestationObject is not valid CBOR"))?;
        let CborValue::Map(attestation) = attestation else {
            return Err(AppError::invalid_request("attestationObject is not a CBOR map"));
        };

        let fmt = match attestation.get(&CborValue::Text("fmt".into())) {
            Some(CborValue::Text(fmt)) => fmt.clone(),
            _ => return Err(AppError::invalid_request("attestation fmt missing")),
        };
        let auth_data_bytes = match attestation.get(&CborValue::Text("authData".into())) {
            Some(CborValue::Bytes(bytes)) => bytes.clone(),
            _ => return Err(AppError::invalid_request("attestation authData missing")),
        };

        // `none` must carry an empty statement; `packed`/`direct` statements
        // are parsed but acceptance policy is out of scope
        match attestation.get(&CborValue::Text("attStmt".into())) {
            Some(CborValue::Map(statement)) => {
                if fmt == "none" && !statement.is_empty() {
                    return Err(AppError::invalid_request(
                        "attestation fmt 'none' must have an empty statement",
                    ));
                }
                if fmt != "none" {
                    tracing::debug!(fmt = %fmt, "attestation statement parsed, conveyance accepted");
                }
            }
            _ => return Err(AppError::invalid_request("attestation attStmt missing")),
        }

        let auth_data = parse_authenticator_data(&auth_data_bytes, true)?;
        self.check_rp_id_hash(&auth_data)?;

        let attested = auth_data
            .attested_credential
            .ok_or_else(|| AppError::invalid_request("attested credential data missing"))?;

        // Sanity: the outer credential id must match the attested one
        let attested_id_b64 = URL_SAFE_NO_PAD.encode(&attested.credential_id);
        if response.id != attested_id_b64 {
            return Err(AppError::invalid_request("credential id mismatch"));
        }

        // Parse now so an unusable key is rejected at enrollment, not at login
        CosePublicKey::parse(&attested.public_key_cose)?;

        let credential = WebAuthnCredential {
            credential_id: attested_id_b64,
            user_id,
            public_key_cose: attested.public_key_cose,
            attestation_format: fmt,
            aaguid: Some(hex::encode(attested.aaguid)),
            sign_count: i64::from(auth_data.sign_count),
            state: WebAuthnCredentialState::Registered,
            label,
            created_at: now,
            last_used_at: None,
        };

        self.database
            .store_webauthn_credential(&credential)
            .await
            .map_err(AppError::from)?;
        self.database
            .delete_challenge(challenge.id)
            .await
            .map_err(AppError::from)?;

        Ok(credential)
    }

    /// Begin an authentication ceremony: mint and store a challenge, return
    /// request options listing the user's credentials
    ///
    /// # Errors
    /// Returns an error on RNG or storage failure, or when the user has no
    /// usable credentials.
    pub async fn begin_authentication(&self, user_id: Uuid) -> AppResult<JsonValue> {
        let credentials = self
            .database
            .list_webauthn_credentials(user_id)
            .await
            .map_err(AppError::from)?;
        let allow: Vec<JsonValue> = credentials
            .iter()
            .filter(|c| c.state != WebAuthnCredentialState::Suspect)
            .map(|c| json!({ "type": "public-key", "id": c.credential_id }))
            .collect();
        if allow.is_empty() {
            return Err(AppError::invalid_request(
                "user has no usable WebAuthn credentials",
            ));
        }

        let challenge_bytes = crypto::generate_webauthn_challenge()?;
        let challenge_b64 = URL_SAFE_NO_PAD.encode(&challenge_bytes);
        self.store_ceremony_challenge(ChallengeKind::WebauthnAssertion, user_id, &challenge_b64)
            .await?;

        Ok(json!({
            "rpId": self.config.rp_id,
            "challenge": challenge_b64,
            "allowCredentials": allow,
            "userVerification": "preferred",
            "timeout": 120_000,
        }))
    }

    /// Finish an authentication ceremony
    ///
    /// The sign counter must be strictly greater than the stored value;
    /// anything else is a cloned-authenticator event that marks the
    /// credential suspect and rejects the assertion.
    ///
    /// # Errors
    /// `ReplayDetected` on counter regression; `InvalidGrant` on any other
    /// verification failure.
    pub async fn finish_authentication(&self, response: &AssertionResponse) -> AppResult<Uuid> {
        let (client_data, client_data_raw) =
            self.validate_client_data(&response.response.client_data_json, "webauthn.get")?;

        let now = Utc::now();
        let challenge = self
            .database
            .consume_webauthn_challenge(
                ChallengeKind::WebauthnAssertion,
                &client_data.challenge,
                now,
            )
            .await
            .map_err(AppError::from)?
            .ok_or_else(|| AppError::invalid_grant("unknown or expired assertion challenge"))?;

        let credential = self
            .database
            .get_webauthn_credential(&response.id)
            .await
            .map_err(AppError::from)?
            .ok_or_else(|| AppError::invalid_grant("unknown credential"))?;

        if challenge.user_id != Some(credential.user_id) {
            return Err(AppError::invalid_grant("credential does not belong to subject"));
        }
        if credential.state == WebAuthnCredentialState::Suspect {
            return Err(AppError::invalid_grant("credential is suspended"));
        }

        let auth_data_bytes = URL_SAFE_NO_PAD
            .decode(&response.response.authenticator_data)
            .map_err(|_| AppError::invalid_request("authenticatorData is not base64url"))?;
        let auth_data = parse_authenticator_data(&auth_data_bytes, false)?;
        self.check_rp_id_hash(&auth_data)?;

        let signature = URL_SAFE_NO_PAD
            .decode(&response.response.signature)
            .map_err(|_| AppError::invalid_request("signature is not base64url"))?;

        // Signed message: authenticatorData || SHA-256(clientDataJSON)
        let mut message = auth_data_bytes.clone();
        message.extend_from_slice(&Sha256::digest(&client_data_raw));

        let key = CosePublicKey::parse(&credential.public_key_cose)?;
        if !key.verify(&message, &signature)? {
            return Err(AppError::invalid_grant("assertion signature invalid"));
        }

        let presented_count = i64::from(auth_data.sign_count);
        if presented_count <= credential.sign_count {
            self.database
                .mark_webauthn_credential_suspect(&credential.credential_id)
                .await
                .map_err(AppError::from)?;
            audit::credential_suspect(
                &credential.credential_id,
                credential.sign_count,
                presented_count,
            );
            return Err(AppError::new(
                ErrorCode::ReplayDetected,
                "sign counter did not increase",
            ));
        }

        let advanced = self
            .database
            .advance_sign_count(
                &credential.credential_id,
                credential.sign_count,
                presented_count,
                now,
            )
            .await
            .map_err(AppError::from)?;
        if !advanced {
            // A concurrent assertion won the compare-and-set
            return Err(AppError::conflict("concurrent assertion for credential"));
        }

        self.database
            .delete_challenge(challenge.id)
            .await
            .map_err(AppError::from)?;

        Ok(credential.user_id)
    }
}
