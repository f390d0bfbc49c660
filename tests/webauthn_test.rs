// ABOUTME: WebAuthn ceremony tests with a synthetic software authenticator
// ABOUTME: Registration, assertion, sign-counter replay detection, and origin enforcement
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use aegis_idp::config::environment::WebAuthnConfig;
use aegis_idp::errors::ErrorCode;
use aegis_idp::mfa::webauthn::{
    AssertionResponse, AssertionResponseInner, AttestationResponseInner, RegistrationResponse,
    WebAuthnAuthenticator,
};
use aegis_idp::models::WebAuthnCredentialState;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use p256::ecdsa::signature::Signer as _;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use serde_cbor::Value as Cbor;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const RP_ID: &str = "idp.test";
const ORIGIN: &str = "http://idp.test";

/// A minimal software authenticator holding one P-256 credential
struct SoftAuthenticator {
    key: p256::ecdsa::SigningKey,
    credential_id: Vec<u8>,
}

impl SoftAuthenticator {
    fn new() -> Self {
        Self {
            key: p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng),
            credential_id: b"soft-authenticator-credential-01".to_vec(),
        }
    }

    fn credential_id_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.credential_id)
    }

    fn cose_key(&self) -> Vec<u8> {
        let point = self.key.verifying_key().as_affine().to_encoded_point(false);
        let mut map = BTreeMap::new();
        map.insert(Cbor::Integer(1), Cbor::Integer(2)); // kty: EC2
        map.insert(Cbor::Integer(3), Cbor::Integer(-7)); // alg: ES256
        map.insert(Cbor::Integer(-1), Cbor::Integer(1)); // crv: P-256
        map.insert(Cbor::Integer(-2), Cbor::Bytes(point.x().unwrap().to_vec()));
        map.insert(Cbor::Integer(-3), Cbor::Bytes(point.y().unwrap().to_vec()));
        serde_cbor::to_vec(&Cbor::Map(map)).unwrap()
    }

    fn registration_auth_data(&self, sign_count: u32) -> Vec<u8> {
        let mut data = Sha256::digest(RP_ID.as_bytes()).to_vec();
        data.push(0x41); // UP | AT
        data.extend_from_slice(&sign_count.to_be_bytes());
        data.extend_from_slice(&[0u8; 16]); // aaguid
        data.extend_from_slice(&(self.credential_id.len() as u16).to_be_bytes());
        data.extend_from_slice(&self.credential_id);
        data.extend_from_slice(&self.cose_key());
        data
    }

    fn assertion_auth_data(sign_count: u32) -> Vec<u8> {
        let mut data = Sha256::digest(RP_ID.as_bytes()).to_vec();
        data.push(0x01); // UP
        data.extend_from_slice(&sign_count.to_be_bytes());
        data
    }

    fn client_data(ceremony: &str, challenge: &str, origin: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "type": ceremony,
            "challenge": challenge,
            "origin": origin,
        }))
        .unwrap()
    }

    fn register(&self, challenge: &str) -> RegistrationResponse {
        let client_data = Self::client_data("webauthn.create", challenge, ORIGIN);

        let mut attestation = BTreeMap::new();
        attestation.insert(Cbor::Text("fmt".into()), Cbor::Text("none".into()));
        attestation.insert(Cbor::Text("attStmt".into()), Cbor::Map(BTreeMap::new()));
        attestation.insert(
            Cbor::Text("authData".into()),
            Cbor::Bytes(self.registration_auth_data(0)),
        );
        let attestation_object = serde_cbor::to_vec(&Cbor::Map(attestation)).unwrap();

        RegistrationResponse {
            id: self.credential_id_b64(),
            response: AttestationResponseInner {
                client_data_json: URL_SAFE_NO_PAD.encode(&client_data),
                attestation_object: URL_SAFE_NO_PAD.encode(&attestation_object),
            },
        }
    }

    fn assert(&self, challenge: &str, sign_count: u32, origin: &str) -> AssertionResponse {
        let client_data = Self::client_data("webauthn.get", challenge, origin);
        let auth_data = Self::assertion_auth_data(sign_count);

        let mut message = auth_data.clone();
        message.extend_from_slice(&Sha256::digest(&client_data));
        let signature: p256::ecdsa::Signature = self.key.sign(&message);

        AssertionResponse {
            id: self.credential_id_b64(),
            response: AssertionResponseInner {
                client_data_json: URL_SAFE_NO_PAD.encode(&client_data),
                authenticator_data: URL_SAFE_NO_PAD.encode(&auth_data),
                signature: URL_SAFE_NO_PAD.encode(signature.to_der().as_bytes()),
            },
        }
    }
}

fn config() -> WebAuthnConfig {
    WebAuthnConfig {
        rp_id: RP_ID.to_owned(),
        rp_name: "Aegis Test".to_owned(),
        origins: vec![ORIGIN.to_owned()],
    }
}

fn challenge_from(options: &serde_json::Value) -> String {
    options["challenge"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn registration_and_assertion_round_trip() {
    let database = common::test_database().await;
    let user = common::create_test_user(&database, "alice", "pw-wa-1").await;
    let webauthn = WebAuthnAuthenticator::new(database.clone(), config());
    let authenticator = SoftAuthenticator::new();

    let options = webauthn.begin_registration(&user).await.unwrap();
    assert_eq!(options["rp"]["id"], RP_ID);
    let credential = webauthn
        .finish_registration(
            &authenticator.register(&challenge_from(&options)),
            Some("test key".to_owned()),
        )
        .await
        .unwrap();
    assert_eq!(credential.sign_count, 0);
    assert_eq!(credential.attestation_format, "none");
    assert_eq!(credential.state, WebAuthnCredentialState::Registered);

    // First assertion: counter 1 beats the stored 0
    let options = webauthn.begin_authentication(user.id).await.unwrap();
    let verified = webauthn
        .finish_authentication(&authenticator.assert(&challenge_from(&options), 1, ORIGIN))
        .await
        .unwrap();
    assert_eq!(verified, user.id);

    let stored = database
        .get_webauthn_credential(&authenticator.credential_id_b64())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.sign_count, 1);
    assert_eq!(stored.state, WebAuthnCredentialState::InUse);
}

#[tokio::test]
async fn counter_zero_on_a_fresh_credential_is_rejected() {
    let database = common::test_database().await;
    let user = common::create_test_user(&database, "alice", "pw-wa-2").await;
    let webauthn = WebAuthnAuthenticator::new(database.clone(), config());
    let authenticator = SoftAuthenticator::new();

    let options = webauthn.begin_registration(&user).await.unwrap();
    webauthn
        .finish_registration(&authenticator.register(&challenge_from(&options)), None)
        .await
        .unwrap();

    // Counter equal to the stored value (0) must fail and flag the credential
    let options = webauthn.begin_authentication(user.id).await.unwrap();
    let error = webauthn
        .finish_authentication(&authenticator.assert(&challenge_from(&options), 0, ORIGIN))
        .await
        .unwrap_err();
    assert_eq!(error.code, ErrorCode::ReplayDetected);

    let stored = database
        .get_webauthn_credential(&authenticator.credential_id_b64())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, WebAuthnCredentialState::Suspect);
}

#[tokio::test]
async fn replayed_assertion_marks_the_credential_suspect() {
    let database = common::test_database().await;
    let user = common::create_test_user(&database, "alice", "pw-wa-3").await;
    let webauthn = WebAuthnAuthenticator::new(database.clone(), config());
    let authenticator = SoftAuthenticator::new();

    let options = webauthn.begin_registration(&user).await.unwrap();
    webauthn
        .finish_registration(&authenticator.register(&challenge_from(&options)), None)
        .await
        .unwrap();

    // Advance the counter to 7 legitimately
    for count in 1..=7 {
        let options = webauthn.begin_authentication(user.id).await.unwrap();
        webauthn
            .finish_authentication(&authenticator.assert(&challenge_from(&options), count, ORIGIN))
            .await
            .unwrap();
    }

    // A cloned authenticator replays counter 7
    let options = webauthn.begin_authentication(user.id).await.unwrap();
    let error = webauthn
        .finish_authentication(&authenticator.assert(&challenge_from(&options), 7, ORIGIN))
        .await
        .unwrap_err();
    assert_eq!(error.code, ErrorCode::ReplayDetected);

    let stored = database
        .get_webauthn_credential(&authenticator.credential_id_b64())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.sign_count, 7, "counter is unchanged by the replay");
    assert_eq!(stored.state, WebAuthnCredentialState::Suspect);

    // Suspect is terminal: a higher counter no longer helps
    let error = webauthn.begin_authentication(user.id).await.unwrap_err();
    assert_eq!(error.code, ErrorCode::InvalidRequest);

    // Only an operator reset brings the credential back
    assert!(database
        .reset_webauthn_credential(&authenticator.credential_id_b64())
        .await
        .unwrap());
    let options = webauthn.begin_authentication(user.id).await.unwrap();
    webauthn
        .finish_authentication(&authenticator.assert(&challenge_from(&options), 8, ORIGIN))
        .await
        .unwrap();
}

#[tokio::test]
async fn foreign_origin_is_rejected() {
    let database = common::test_database().await;
    let user = common::create_test_user(&database, "alice", "pw-wa-4").await;
    let webauthn = WebAuthnAuthenticator::new(database.clone(), config());
    let authenticator = SoftAuthenticator::new();

    let options = webauthn.begin_registration(&user).await.unwrap();
    webauthn
        .finish_registration(&authenticator.register(&challenge_from(&options)), None)
        .await
        .unwrap();

    let options = webauthn.begin_authentication(user.id).await.unwrap();
    let error = webauthn
        .finish_authentication(&authenticator.assert(
            &challenge_from(&options),
            1,
            "https://evil.example",
        ))
        .await
        .unwrap_err();
    assert_eq!(error.code, ErrorCode::AccessDenied);
}

#[tokio::test]
async fn a_ceremony_challenge_is_single_use() {
    let database = common::test_database().await;
    let user = common::create_test_user(&database, "alice", "pw-wa-5").await;
    let webauthn = WebAuthnAuthenticator::new(database.clone(), config());
    let authenticator = SoftAuthenticator::new();

    let options = webauthn.begin_registration(&user).await.unwrap();
    webauthn
        .finish_registration(&authenticator.register(&challenge_from(&options)), None)
        .await
        .unwrap();

    let options = webauthn.begin_authentication(user.id).await.unwrap();
    let challenge = challenge_from(&options);
    webauthn
        .finish_authentication(&authenticator.assert(&challenge, 1, ORIGIN))
        .await
        .unwrap();

    // Same stored challenge again: consumed, so the ceremony fails
    let error = webauthn
        .finish_authentication(&authenticator.assert(&challenge, 2, ORIGIN))
        .await
        .unwrap_err();
    assert_eq!(error.code, ErrorCode::InvalidGrant);
}
