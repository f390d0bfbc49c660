// ABOUTME: Repository-level tests for code redemption, refresh rotation, and family revocation
// ABOUTME: Exercises the conditional-update serialization and the reuse-detection paths directly
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use aegis_idp::crypto;
use aegis_idp::database::{CodeRedemption, Database, RefreshRotation, TokenSpec};
use aegis_idp::models::AuthorizationRequest;
use chrono::{Duration, Utc};
use uuid::Uuid;

fn spec() -> TokenSpec {
    TokenSpec {
        access_jti: Uuid::now_v7(),
        access_lifetime: Duration::seconds(3600),
        refresh_id: Uuid::now_v7(),
        refresh_token: crypto::generate_token().unwrap(),
        refresh_lifetime: Duration::days(30),
    }
}

/// Seed a request that has passed login and consent: user bound, code minted
async fn seeded_code(database: &Database, client_id: Uuid, user_id: Uuid, scope: &str) -> String {
    let now = Utc::now();
    let request = AuthorizationRequest {
        id: Uuid::now_v7(),
        client_id,
        redirect_uri: "https://rp.example/cb".to_owned(),
        scope: scope.to_owned(),
        state: Some("xyz".to_owned()),
        code_challenge: crypto::compute_challenge_s256(common::PKCE_VERIFIER),
        code_challenge_method: "S256".to_owned(),
        created_at: now,
        expires_at: now + Duration::minutes(5),
        consumed: false,
        consumed_at: None,
        user_id: None,
        code: None,
        code_expires_at: None,
        row_version: 0,
    };
    database.create_authorization_request(&request).await.unwrap();
    assert!(database
        .attach_user_to_request(request.id, user_id, 0, now)
        .await
        .unwrap());

    let code = crypto::generate_token().unwrap();
    assert!(database
        .set_code_on_request(request.id, &code, now + Duration::minutes(5), 1, now)
        .await
        .unwrap());
    code
}

#[tokio::test]
async fn redemption_is_single_use_and_replay_revokes_the_family() {
    let database = common::test_database().await;
    let user = common::create_test_user(&database, "alice", "pw-alice-1").await;
    let client = common::create_test_client(&database, "demo-client", "s1").await;

    let code = seeded_code(&database, client.id, user.id, "openid offline_access").await;

    let first = database
        .redeem_authorization_code(
            &code,
            client.id,
            "https://rp.example/cb",
            common::PKCE_VERIFIER,
            Utc::now(),
            spec(),
        )
        .await
        .unwrap();
    let CodeRedemption::Success {
        access, refresh, ..
    } = first
    else {
        panic!("first redemption must succeed");
    };
    let refresh = refresh.expect("offline_access grants a refresh token");
    assert_eq!(access.family_id, refresh.family_id);
    assert_eq!(access.user_id, Some(user.id));

    // Second redemption: replayed, family revoked
    let second = database
        .redeem_authorization_code(
            &code,
            client.id,
            "https://rp.example/cb",
            common::PKCE_VERIFIER,
            Utc::now(),
            spec(),
        )
        .await
        .unwrap();
    assert!(matches!(second, CodeRedemption::Replayed { .. }));

    let stored_access = database.get_access_token(access.jti).await.unwrap().unwrap();
    assert!(stored_access.revoked);
    let stored_refresh = database
        .get_refresh_token(&refresh.token)
        .await
        .unwrap()
        .unwrap();
    assert!(stored_refresh.revoked);
}

#[tokio::test]
async fn redirect_uri_must_match_byte_for_byte() {
    let database = common::test_database().await;
    let user = common::create_test_user(&database, "alice", "pw-alice-2").await;
    let client = common::create_test_client(&database, "demo-client", "s1").await;

    let code = seeded_code(&database, client.id, user.id, "openid").await;

    let with_slash = database
        .redeem_authorization_code(
            &code,
            client.id,
            "https://rp.example/cb/",
            common::PKCE_VERIFIER,
            Utc::now(),
            spec(),
        )
        .await
        .unwrap();
    assert!(matches!(with_slash, CodeRedemption::Rejected));

    // And the exact URI still works afterwards: a mismatched attempt does
    // not consume the code
    let exact = database
        .redeem_authorization_code(
            &code,
            client.id,
            "https://rp.example/cb",
            common::PKCE_VERIFIER,
            Utc::now(),
            spec(),
        )
        .await
        .unwrap();
    assert!(matches!(exact, CodeRedemption::Success { .. }));
}

#[tokio::test]
async fn expired_code_is_rejected_at_the_boundary() {
    let database = common::test_database().await;
    let user = common::create_test_user(&database, "alice", "pw-alice-3").await;
    let client = common::create_test_client(&database, "demo-client", "s1").await;

    let code = seeded_code(&database, client.id, user.id, "openid").await;

    // now == code_expires_at counts as expired
    let at_expiry = Utc::now() + Duration::minutes(5);
    let outcome = database
        .redeem_authorization_code(
            &code,
            client.id,
            "https://rp.example/cb",
            common::PKCE_VERIFIER,
            at_expiry,
            spec(),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, CodeRedemption::Rejected));
}

#[tokio::test]
async fn rotation_replaces_and_reuse_revokes_descendants() {
    let database = common::test_database().await;
    let user = common::create_test_user(&database, "alice", "pw-alice-4").await;
    let client = common::create_test_client(&database, "demo-client", "s1").await;

    let code = seeded_code(&database, client.id, user.id, "openid offline_access").await;
    let CodeRedemption::Success { refresh, .. } = database
        .redeem_authorization_code(
            &code,
            client.id,
            "https://rp.example/cb",
            common::PKCE_VERIFIER,
            Utc::now(),
            spec(),
        )
        .await
        .unwrap()
    else {
        panic!("redemption must succeed");
    };
    let first_refresh = refresh.unwrap();

    // Rotate: old revoked, replacement in the same family
    let rotation = database
        .rotate_refresh_token(&first_refresh.token, client.id, Utc::now(), spec())
        .await
        .unwrap();
    let RefreshRotation::Rotated {
        old,
        access: second_access,
        refresh: second_refresh,
    } = rotation
    else {
        panic!("rotation must succeed");
    };
    assert_eq!(old.token, first_refresh.token);
    assert_eq!(second_refresh.family_id, first_refresh.family_id);

    let stored_old = database
        .get_refresh_token(&first_refresh.token)
        .await
        .unwrap()
        .unwrap();
    assert!(stored_old.revoked);

    // Presenting the revoked ancestor is misuse: the entire family dies,
    // including the freshly rotated descendants
    let reuse = database
        .rotate_refresh_token(&first_refresh.token, client.id, Utc::now(), spec())
        .await
        .unwrap();
    assert!(matches!(reuse, RefreshRotation::ReuseDetected { .. }));

    let descendant = database
        .get_refresh_token(&second_refresh.token)
        .await
        .unwrap()
        .unwrap();
    assert!(descendant.revoked, "descendants are revoked on reuse");
    let descendant_access = database
        .get_access_token(second_access.jti)
        .await
        .unwrap()
        .unwrap();
    assert!(descendant_access.revoked);
}

#[tokio::test]
async fn client_mismatch_is_rejected_without_consumption() {
    let database = common::test_database().await;
    let user = common::create_test_user(&database, "alice", "pw-alice-5").await;
    let client = common::create_test_client(&database, "demo-client", "s1").await;
    let other = common::create_test_client(&database, "other-client", "s2").await;

    let code = seeded_code(&database, client.id, user.id, "openid").await;

    let outcome = database
        .redeem_authorization_code(
            &code,
            other.id,
            "https://rp.example/cb",
            common::PKCE_VERIFIER,
            Utc::now(),
            spec(),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, CodeRedemption::Rejected));

    let rightful = database
        .redeem_authorization_code(
            &code,
            client.id,
            "https://rp.example/cb",
            common::PKCE_VERIFIER,
            Utc::now(),
            spec(),
        )
        .await
        .unwrap();
    assert!(matches!(rightful, CodeRedemption::Success { .. }));
}
