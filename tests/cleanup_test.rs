// ABOUTME: Cleanup scheduler tests - expired rows vanish, live rows survive, failures stay isolated
// ABOUTME: Runs single sweeps directly against a seeded in-memory database
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use aegis_idp::cleanup::CleanupScheduler;
use aegis_idp::crypto;
use aegis_idp::models::{
    AssuranceLevel, AuthenticationChallenge, AuthorizationRequest, ChallengeKind, Session,
};
use chrono::{Duration, Utc};
use uuid::Uuid;

fn expired_request(client_id: Uuid) -> AuthorizationRequest {
    let created = Utc::now() - Duration::hours(2);
    AuthorizationRequest {
        id: Uuid::now_v7(),
        client_id,
        redirect_uri: "https://rp.example/cb".to_owned(),
        scope: "openid".to_owned(),
        state: None,
        code_challenge: "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM".to_owned(),
        code_challenge_method: "S256".to_owned(),
        created_at: created,
        expires_at: created + Duration::minutes(5),
        consumed: false,
        consumed_at: None,
        user_id: None,
        code: None,
        code_expires_at: None,
        row_version: 0,
    }
}

fn session(user_id: Uuid, idle_offset: Duration) -> Session {
    let now = Utc::now();
    Session {
        id: Uuid::now_v7(),
        user_id,
        token: crypto::generate_token().unwrap(),
        csrf_token: crypto::generate_token().unwrap(),
        created_at: now - Duration::hours(3),
        idle_expires_at: now + idle_offset,
        absolute_expires_at: now + Duration::hours(5),
        assurance: AssuranceLevel::Password,
        last_ip: None,
        last_user_agent: None,
        row_version: 0,
    }
}

fn consumed_challenge(user_id: Uuid) -> AuthenticationChallenge {
    let now = Utc::now();
    AuthenticationChallenge {
        id: Uuid::now_v7(),
        kind: ChallengeKind::EmailOtp,
        user_id: Some(user_id),
        verifier_hash: Some("pbkdf2$210000$x$y".to_owned()),
        webauthn_challenge: None,
        metadata: serde_json::json!({}),
        created_at: now - Duration::hours(1),
        expires_at: now - Duration::minutes(50),
        attempts: 1,
        max_attempts: 3,
        consumed: true,
        failed: false,
    }
}

#[tokio::test]
async fn sweep_deletes_expired_rows_and_keeps_live_ones() {
    let database = common::test_database().await;
    let user = common::create_test_user(&database, "alice", "pw-clean-1").await;
    let client = common::create_test_client(&database, "demo-client", "s1").await;

    // One expired and one live authorization request
    database
        .create_authorization_request(&expired_request(client.id))
        .await
        .unwrap();
    let mut live = expired_request(client.id);
    live.id = Uuid::now_v7();
    live.created_at = Utc::now();
    live.expires_at = Utc::now() + Duration::minutes(5);
    database.create_authorization_request(&live).await.unwrap();

    // One idle-expired and one live session
    let dead_session = session(user.id, Duration::hours(-2));
    database.create_session(&dead_session).await.unwrap();
    let live_session = session(user.id, Duration::minutes(20));
    database.create_session(&live_session).await.unwrap();

    // One consumed challenge
    database
        .create_challenge(&consumed_challenge(user.id))
        .await
        .unwrap();

    let scheduler = CleanupScheduler::new(
        database.clone(),
        std::time::Duration::from_secs(3600),
        Duration::minutes(10),
    );
    let report = scheduler.run_sweep().await;

    assert!(report.failed.is_empty());
    assert_eq!(report.deleted["authorization_requests"], 1);
    assert_eq!(report.deleted["sessions"], 1);
    assert_eq!(report.deleted["challenges"], 1);

    // Live rows survived
    assert!(database
        .get_authorization_request(live.id)
        .await
        .unwrap()
        .is_some());
    assert!(database
        .get_live_session(&live_session.token, Utc::now())
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn deleted_users_are_invisible_until_purged() {
    let database = common::test_database().await;
    let user = common::create_test_user(&database, "carol", "pw-purge-1").await;

    database
        .set_user_status(user.id, aegis_idp::models::UserStatus::Deleted)
        .await
        .unwrap();

    // Invisible to every query
    assert!(database.get_user(user.id).await.unwrap().is_none());
    assert!(database
        .get_user_by_username("carol")
        .await
        .unwrap()
        .is_none());

    // Purge is the only path that sees them
    assert_eq!(database.purge_deleted_users().await.unwrap(), 1);
    assert_eq!(database.purge_deleted_users().await.unwrap(), 0);
}

#[tokio::test]
async fn sweep_with_nothing_to_do_reports_zeroes() {
    let database = common::test_database().await;
    let scheduler = CleanupScheduler::new(
        database,
        std::time::Duration::from_secs(3600),
        Duration::minutes(10),
    );

    let report = scheduler.run_sweep().await;
    assert!(report.failed.is_empty());
    assert!(report.deleted.values().all(|&count| count == 0));
}

#[tokio::test]
async fn grace_keeps_freshly_expired_rows_one_sweep_longer() {
    let database = common::test_database().await;
    let client = common::create_test_client(&database, "demo-client", "s1").await;

    // Expired three minutes ago: inside the ten-minute grace
    let mut request = expired_request(client.id);
    request.created_at = Utc::now() - Duration::minutes(8);
    request.expires_at = Utc::now() - Duration::minutes(3);
    database.create_authorization_request(&request).await.unwrap();

    let scheduler = CleanupScheduler::new(
        database.clone(),
        std::time::Duration::from_secs(3600),
        Duration::minutes(10),
    );
    let report = scheduler.run_sweep().await;
    assert_eq!(report.deleted["authorization_requests"], 0);
    assert!(database
        .get_authorization_request(request.id)
        .await
        .unwrap()
        .is_some());
}
