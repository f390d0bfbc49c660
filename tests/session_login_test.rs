// ABOUTME: Login flow tests - TOTP step-up, locked accounts, CSRF enforcement, logout
// ABOUTME: Drives the HTML flow through the router with cookie and hidden-field plumbing
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use aegis_idp::config::environment::ServerConfig;
use aegis_idp::context::ServerResources;
use aegis_idp::delivery::LogDeliveryProvider;
use aegis_idp::mfa::totp::{TotpSecretStore, TotpValidator};
use aegis_idp::models::UserStatus;
use aegis_idp::routes::build_router;
use axum::body::{to_bytes, Body};
use axum::http::header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use std::sync::Arc;
use tower::util::ServiceExt;

const TOTP_MASTER_KEY: [u8; 32] = [7u8; 32];

/// Step-up policy: every login needs one extra factor, never a strong one
const STEP_UP_POLICY: &str =
    "thresholds:\n  basic_mfa: 0.0\n  strong_mfa: 10.0\n";

async fn resources_with_policy(
    policy_yaml: &str,
) -> (Arc<ServerResources>, tempfile::NamedTempFile) {
    let policy_file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(policy_file.path(), policy_yaml).unwrap();
    let config: ServerConfig = common::test_config(Some(policy_file.path().to_path_buf()));
    let resources = ServerResources::initialize(
        config,
        Arc::new(LogDeliveryProvider),
        &TOTP_MASTER_KEY,
        Vec::new(),
    )
    .await
    .unwrap();
    (resources, policy_file)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, String) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}

fn get(uri: &str, cookies: &str) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if !cookies.is_empty() {
        builder = builder.header(COOKIE, cookies);
    }
    builder.body(Body::empty()).unwrap()
}

fn post_form(uri: &str, form: &[(&str, &str)], cookies: &str) -> Request<Body> {
    let body = serde_urlencoded::to_string(form).unwrap();
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded");
    if !cookies.is_empty() {
        builder = builder.header(COOKIE, cookies);
    }
    builder.body(Body::from(body)).unwrap()
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|v| {
            let (n, value) = v.split(';').next()?.split_once('=')?;
            (n == name).then(|| value.to_owned())
        })
}

fn hidden_field(html: &str, name: &str) -> String {
    let marker = format!("name=\"{name}\" value=\"");
    let start = html.find(&marker).unwrap() + marker.len();
    let end = html[start..].find('"').unwrap();
    html[start..start + end].to_owned()
}

/// Start an authorization and submit the credential form; returns
/// (request_id, response status, headers, body)
async fn login_with(
    router: &Router,
    username: &str,
    password: &str,
) -> (String, StatusCode, HeaderMap, String) {
    let authorize_uri = format!(
        "/oauth2/v1/authorize?response_type=code&client_id=demo-client\
         &redirect_uri=https%3A%2F%2Frp.example%2Fcb&scope=openid&state=s1\
         &code_challenge={}&code_challenge_method=S256",
        common::PKCE_CHALLENGE
    );
    let (_, headers, _) = send(router, get(&authorize_uri, "")).await;
    let login_url = headers.get(LOCATION).unwrap().to_str().unwrap().to_owned();
    let request_id = login_url.split("request_id=").nth(1).unwrap().to_owned();

    let (_, headers, html) = send(router, get(&login_url, "")).await;
    let csrf = hidden_field(&html, "csrf_token");
    let csrf_cookie = cookie_value(&headers, "aegis_csrf").unwrap();

    let (status, headers, body) = send(
        router,
        post_form(
            "/oidc/v1/login",
            &[
                ("request_id", request_id.as_str()),
                ("csrf_token", csrf.as_str()),
                ("username", username),
                ("password", password),
            ],
            &format!("aegis_csrf={csrf_cookie}"),
        ),
    )
    .await;
    (request_id, status, headers, body)
}

#[tokio::test]
async fn totp_step_up_raises_assurance_and_reaches_consent() {
    let (resources, _policy) = resources_with_policy(STEP_UP_POLICY).await;
    let user = common::create_test_user(&resources.database, "alice", "correct horse").await;
    common::create_test_client(&resources.database, "demo-client", "demo-secret-v1").await;

    // Enroll TOTP with a known plaintext secret
    let store = TotpSecretStore::new(&TOTP_MASTER_KEY, resources.database.clone()).unwrap();
    let secret = b"12345678901234567890";
    let encrypted = store.encrypt(secret).unwrap();
    resources
        .database
        .set_user_totp_secret(user.id, &encrypted)
        .await
        .unwrap();

    let router = build_router(resources.clone());
    let (request_id, status, headers, body) =
        login_with(&router, "alice", "correct horse").await;

    // Password alone is not enough: the TOTP prompt renders
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("authenticator app"), "{body}");
    let session_cookie = cookie_value(&headers, "aegis_session").unwrap();
    let mfa_csrf = hidden_field(&body, "csrf_token");
    let cookies = format!("aegis_session={session_cookie}");

    // A wrong code is rejected with the generic category
    let (status, _, _) = send(
        &router,
        post_form(
            "/oidc/v1/login/mfa",
            &[
                ("request_id", request_id.as_str()),
                ("csrf_token", mfa_csrf.as_str()),
                ("totp_code", "000000"),
            ],
            &cookies,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // The right code for this moment raises the session and moves on
    let code = TotpValidator::code_at(secret, Utc::now()).unwrap();
    let (status, headers, _) = send(
        &router,
        post_form(
            "/oidc/v1/login/mfa",
            &[
                ("request_id", request_id.as_str()),
                ("csrf_token", mfa_csrf.as_str()),
                ("totp_code", code.as_str()),
            ],
            &cookies,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert!(headers
        .get(LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .contains("/oidc/v1/consent"));

    // The session's achieved assurance is now basic_mfa
    let session = resources
        .database
        .get_live_session(&session_cookie, Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        session.assurance,
        aegis_idp::models::AssuranceLevel::BasicMfa
    );
}

#[tokio::test]
async fn locked_account_fails_with_the_generic_category() {
    let (resources, _policy) = common::test_resources().await;
    let user = common::create_test_user(&resources.database, "mallory", "right password").await;
    common::create_test_client(&resources.database, "demo-client", "demo-secret-v1").await;
    resources
        .database
        .set_user_status(user.id, UserStatus::Locked)
        .await
        .unwrap();

    let router = build_router(resources);
    let (_, status, _, body) = login_with(&router, "mallory", "right password").await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("Sign-in failed"));
    assert!(!body.to_lowercase().contains("locked"), "lock state is not disclosed");
}

#[tokio::test]
async fn unknown_user_and_wrong_password_render_the_same_page() {
    let (resources, _policy) = common::test_resources().await;
    common::create_test_user(&resources.database, "alice", "correct horse").await;
    common::create_test_client(&resources.database, "demo-client", "demo-secret-v1").await;

    let router = build_router(resources);
    let (_, status_ghost, _, body_ghost) = login_with(&router, "ghost", "anything").await;
    let (_, status_wrong, _, body_wrong) = login_with(&router, "alice", "wrong").await;

    assert_eq!(status_ghost, StatusCode::UNAUTHORIZED);
    assert_eq!(status_wrong, StatusCode::UNAUTHORIZED);
    // Identical page modulo the embedded request/CSRF identifiers
    assert!(body_ghost.contains("Sign-in failed"));
    assert!(body_wrong.contains("Sign-in failed"));
}

#[tokio::test]
async fn csrf_mismatch_is_refused() {
    let (resources, _policy) = common::test_resources().await;
    common::create_test_user(&resources.database, "alice", "correct horse").await;
    common::create_test_client(&resources.database, "demo-client", "demo-secret-v1").await;
    let router = build_router(resources);

    let authorize_uri = format!(
        "/oauth2/v1/authorize?response_type=code&client_id=demo-client\
         &redirect_uri=https%3A%2F%2Frp.example%2Fcb&scope=openid\
         &code_challenge={}&code_challenge_method=S256",
        common::PKCE_CHALLENGE
    );
    let (_, headers, _) = send(&router, get(&authorize_uri, "")).await;
    let login_url = headers.get(LOCATION).unwrap().to_str().unwrap().to_owned();
    let request_id = login_url.split("request_id=").nth(1).unwrap().to_owned();

    let (_, headers, _) = send(&router, get(&login_url, "")).await;
    let csrf_cookie = cookie_value(&headers, "aegis_csrf").unwrap();

    // Token in the form does not match the cookie
    let (status, _, _) = send(
        &router,
        post_form(
            "/oidc/v1/login",
            &[
                ("request_id", request_id.as_str()),
                ("csrf_token", "forged-token"),
                ("username", "alice"),
                ("password", "correct horse"),
            ],
            &format!("aegis_csrf={csrf_cookie}"),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn totp_enrollment_stores_ciphertext_and_returns_the_uri_once() {
    let (resources, _policy) = common::test_resources().await;
    let user = common::create_test_user(&resources.database, "alice", "correct horse").await;
    common::create_test_client(&resources.database, "demo-client", "demo-secret-v1").await;
    let router = build_router(resources.clone());

    let (_, status, headers, _) = login_with(&router, "alice", "correct horse").await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    let session_cookie = cookie_value(&headers, "aegis_session").unwrap();

    let (status, _, body) = send(
        &router,
        post_form(
            "/oidc/v1/totp/enroll",
            &[],
            &format!("aegis_session={session_cookie}"),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    let uri = json["otpauth_uri"].as_str().unwrap();
    assert!(uri.starts_with("otpauth://totp/"));
    assert!(uri.contains("alice"));
    assert!(uri.contains("algorithm=SHA1"));

    // The stored ciphertext decrypts back to a 20-byte secret
    let stored = resources
        .database
        .get_user(user.id)
        .await
        .unwrap()
        .unwrap()
        .totp_secret_enc
        .unwrap();
    let store = TotpSecretStore::new(&TOTP_MASTER_KEY, resources.database.clone()).unwrap();
    assert_eq!(store.decrypt(&stored).unwrap().len(), 20);
}

#[tokio::test]
async fn logout_terminates_the_session_and_revokes_tokens() {
    let (resources, _policy) = common::test_resources().await;
    common::create_test_user(&resources.database, "alice", "correct horse").await;
    common::create_test_client(&resources.database, "demo-client", "demo-secret-v1").await;
    let router = build_router(resources.clone());

    let (_, status, headers, _) = login_with(&router, "alice", "correct horse").await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    let session_cookie = cookie_value(&headers, "aegis_session").unwrap();

    let session = resources
        .database
        .get_live_session(&session_cookie, Utc::now())
        .await
        .unwrap()
        .unwrap();

    let (status, headers, _) = send(
        &router,
        post_form(
            "/oidc/v1/logout",
            &[("csrf_token", session.csrf_token.as_str())],
            &format!("aegis_session={session_cookie}"),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    // The cookie is expired in the response
    let cleared = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.starts_with("aegis_session=") && v.contains("Max-Age=0"));
    assert!(cleared);

    // The session is gone
    assert!(resources
        .database
        .get_live_session(&session_cookie, Utc::now())
        .await
        .unwrap()
        .is_none());
}
