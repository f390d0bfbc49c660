// ABOUTME: End-to-end authorization code flow tests through the full router
// ABOUTME: Covers the successful flow, code replay revocation, PKCE mismatch, and consent reuse
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use aegis_idp::routes::build_router;
use axum::body::{to_bytes, Body};
use axum::http::header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use tower::util::ServiceExt;

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, body.to_vec())
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

/// Collect `name=value` pairs from every Set-Cookie header
fn cookies_from(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| {
            let pair = v.split(';').next()?;
            let (name, value) = pair.split_once('=')?;
            Some((name.to_owned(), value.to_owned()))
        })
        .collect()
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    cookies_from(headers)
        .into_iter()
        .find_map(|(n, v)| (n == name).then_some(v))
}

/// Pull a hidden form field out of a rendered page
fn hidden_field(html: &str, name: &str) -> String {
    let marker = format!("name=\"{name}\" value=\"");
    let start = html.find(&marker).unwrap() + marker.len();
    let end = html[start..].find('"').unwrap();
    html[start..start + end].to_owned()
}

fn location(headers: &HeaderMap) -> String {
    headers
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| urlencoding::decode(value).unwrap().into_owned())
    })
}

/// Drive the browser half of the flow: authorize → login → consent,
/// returning the authorization code delivered to the client
///
/// When a prior consent already covers the requested scopes the consent
/// prompt is skipped and the login response carries the code directly.
async fn obtain_code(router: &Router) -> String {
    let authorize_uri = format!(
        "/oauth2/v1/authorize?response_type=code&client_id=demo-client\
         &redirect_uri=https%3A%2F%2Frp.example%2Fcb&scope=openid%20email&state=xyz\
         &code_challenge={}&code_challenge_method=S256",
        common::PKCE_CHALLENGE
    );

    let (status, headers, _) = send(router, get(&authorize_uri, "")).await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    let login_url = location(&headers);
    assert!(login_url.contains("/oidc/v1/login?request_id="));
    let request_id = query_param(&login_url, "request_id").unwrap();

    let (status, headers, body) = send(router, get(&login_url, "")).await;
    assert_eq!(status, StatusCode::OK);
    let html = String::from_utf8(body).unwrap();
    let csrf = hidden_field(&html, "csrf_token");
    let csrf_cookie = cookie_value(&headers, "aegis_csrf").unwrap();

    let (status, headers, _) = send(
        router,
        post_form(
            "/oidc/v1/login",
            &[
                ("request_id", request_id.as_str()),
                ("csrf_token", csrf.as_str()),
                ("username", "alice"),
                ("password", "correct horse"),
            ],
            &format!("aegis_csrf={csrf_cookie}"),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    let session_cookie = cookie_value(&headers, "aegis_session").unwrap();
    let after_login = location(&headers);

    if after_login.starts_with("https://rp.example/cb") {
        // Covering consent on file: straight back to the client
        assert_eq!(query_param(&after_login, "state").as_deref(), Some("xyz"));
        return query_param(&after_login, "code").unwrap();
    }

    let cookies = format!("aegis_session={session_cookie}");
    let (status, headers, body) = send(router, get(&after_login, &cookies)).await;
    if status == StatusCode::SEE_OTHER {
        let target = location(&headers);
        return query_param(&target, "code").unwrap();
    }
    assert_eq!(status, StatusCode::OK);
    let html = String::from_utf8(body).unwrap();
    let consent_csrf = hidden_field(&html, "csrf_token");

    let (status, headers, _) = send(
        router,
        post_form(
            "/oidc/v1/consent",
            &[
                ("request_id", request_id.as_str()),
                ("csrf_token", consent_csrf.as_str()),
                ("action", "approve"),
            ],
            &cookies,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    let target = location(&headers);
    assert!(target.starts_with("https://rp.example/cb"));
    assert_eq!(query_param(&target, "state").as_deref(), Some("xyz"));
    query_param(&target, "code").unwrap()
}

#[tokio::test]
async fn full_code_flow_replay_and_pkce() {
    let (resources, _policy) = common::test_resources().await;
    common::create_test_user(&resources.database, "alice", "correct horse").await;
    let _client =
        common::create_test_client(&resources.database, "demo-client", "demo-secret-v1").await;
    let router = build_router(resources.clone());

    // Scenario 1: successful flow
    let code = obtain_code(&router).await;
    assert!(!code.is_empty());

    let token_form = [
        ("grant_type", "authorization_code"),
        ("code", code.as_str()),
        ("code_verifier", common::PKCE_VERIFIER),
        ("client_id", "demo-client"),
        ("client_secret", "demo-secret-v1"),
        ("redirect_uri", "https://rp.example/cb"),
    ];
    let (status, _, body) = send(&router, post_form("/oauth2/v1/token", &token_form, "")).await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    let token_response: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(token_response["token_type"], "Bearer");
    assert_eq!(token_response["scope"], "openid email");
    let access_token = token_response["access_token"].as_str().unwrap().to_owned();
    assert!(token_response["id_token"].is_string(), "openid grants an id token");
    // No offline_access scope: no refresh token
    assert!(token_response.get("refresh_token").is_none());

    // The subject is alice's real identifier, never a placeholder
    let alice = resources
        .database
        .get_user_by_username("alice")
        .await
        .unwrap()
        .unwrap();
    let claims: serde_json::Value = {
        let payload = access_token.split('.').nth(1).unwrap();
        use base64::Engine as _;
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload)
            .unwrap();
        serde_json::from_slice(&raw).unwrap()
    };
    assert_eq!(claims["sub"], alice.id.to_string());
    assert_eq!(claims["client_id"], "demo-client");

    // The token introspects active
    let introspect_form = [
        ("token", access_token.as_str()),
        ("client_id", "demo-client"),
        ("client_secret", "demo-secret-v1"),
    ];
    let (status, _, body) =
        send(&router, post_form("/oauth2/v1/introspect", &introspect_form, "")).await;
    assert_eq!(status, StatusCode::OK);
    let introspection: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(introspection["active"], true);
    assert_eq!(introspection["sub"], alice.id.to_string());

    // Scenario 2: replaying the code fails and revokes the issued tokens
    let (status, _, body) = send(&router, post_form("/oauth2/v1/token", &token_form, "")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["error"], "invalid_grant");

    let (_, _, body) =
        send(&router, post_form("/oauth2/v1/introspect", &introspect_form, "")).await;
    let introspection: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        introspection["active"], false,
        "replay must revoke the family issued from the code"
    );

    // The recorded consent covers a repeat authorization: the second pass
    // never shows the consent prompt and still produces a working code
    let second_code = obtain_code(&router).await;
    assert!(!second_code.is_empty());
    assert_ne!(second_code, code);
}

#[tokio::test]
async fn pkce_mismatch_is_invalid_grant() {
    let (resources, _policy) = common::test_resources().await;
    common::create_test_user(&resources.database, "alice", "correct horse").await;
    common::create_test_client(&resources.database, "demo-client", "demo-secret-v1").await;
    let router = build_router(resources);

    let code = obtain_code(&router).await;

    // Last character changed (scenario 3)
    let bad_verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXl";
    let (status, _, body) = send(
        &router,
        post_form(
            "/oauth2/v1/token",
            &[
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("code_verifier", bad_verifier),
                ("client_id", "demo-client"),
                ("client_secret", "demo-secret-v1"),
                ("redirect_uri", "https://rp.example/cb"),
            ],
            "",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["error"], "invalid_grant");

    // The code was burned by the mismatch; the correct verifier cannot
    // resurrect it
    let (status, _, body) = send(
        &router,
        post_form(
            "/oauth2/v1/token",
            &[
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("code_verifier", common::PKCE_VERIFIER),
                ("client_id", "demo-client"),
                ("client_secret", "demo-secret-v1"),
                ("redirect_uri", "https://rp.example/cb"),
            ],
            "",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["error"], "invalid_grant");
}

#[tokio::test]
async fn authorize_validation_order() {
    let (resources, _policy) = common::test_resources().await;
    common::create_test_client(&resources.database, "demo-client", "demo-secret-v1").await;
    let router = build_router(resources);

    // Unknown client: direct HTTP error, no redirect
    let (status, headers, _) = send(
        &router,
        get(
            "/oauth2/v1/authorize?response_type=code&client_id=ghost\
             &redirect_uri=https%3A%2F%2Frp.example%2Fcb&scope=openid\
             &code_challenge=E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM&code_challenge_method=S256",
            "",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(headers.get(LOCATION).is_none());

    // Trailing slash differs from registration: direct error, no redirect
    let (status, headers, _) = send(
        &router,
        get(
            "/oauth2/v1/authorize?response_type=code&client_id=demo-client\
             &redirect_uri=https%3A%2F%2Frp.example%2Fcb%2F&scope=openid\
             &code_challenge=E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM&code_challenge_method=S256",
            "",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(headers.get(LOCATION).is_none());

    // Wrong response type: redirect with the error
    let (status, headers, _) = send(
        &router,
        get(
            "/oauth2/v1/authorize?response_type=token&client_id=demo-client\
             &redirect_uri=https%3A%2F%2Frp.example%2Fcb&scope=openid&state=xyz\
             &code_challenge=E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM&code_challenge_method=S256",
            "",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    let target = location(&headers);
    assert!(target.starts_with("https://rp.example/cb"));
    assert_eq!(
        query_param(&target, "error").as_deref(),
        Some("unsupported_response_type")
    );
    assert_eq!(query_param(&target, "state").as_deref(), Some("xyz"));

    // PKCE method plain: rejected with invalid_request
    let (status, headers, _) = send(
        &router,
        get(
            "/oauth2/v1/authorize?response_type=code&client_id=demo-client\
             &redirect_uri=https%3A%2F%2Frp.example%2Fcb&scope=openid\
             &code_challenge=E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM&code_challenge_method=plain",
            "",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(
        query_param(&location(&headers), "error").as_deref(),
        Some("invalid_request")
    );

    // Scope outside the allow-list
    let (status, headers, _) = send(
        &router,
        get(
            "/oauth2/v1/authorize?response_type=code&client_id=demo-client\
             &redirect_uri=https%3A%2F%2Frp.example%2Fcb&scope=admin%3Aall\
             &code_challenge=E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM&code_challenge_method=S256",
            "",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(
        query_param(&location(&headers), "error").as_deref(),
        Some("invalid_scope")
    );
}

#[tokio::test]
async fn discovery_is_byte_stable_within_an_epoch() {
    let (resources, _policy) = common::test_resources().await;
    let router = build_router(resources);

    let (status, _, first) = send(&router, get("/.well-known/openid-configuration", "")).await;
    assert_eq!(status, StatusCode::OK);
    let (_, _, second) = send(&router, get("/.well-known/openid-configuration", "")).await;
    assert_eq!(first, second);

    let document: serde_json::Value = serde_json::from_slice(&first).unwrap();
    assert_eq!(document["issuer"], "http://idp.test");
    assert_eq!(document["code_challenge_methods_supported"][0], "S256");
    assert_eq!(document["response_types_supported"][0], "code");

    let (status, _, jwks) = send(&router, get("/.well-known/jwks.json", "")).await;
    assert_eq!(status, StatusCode::OK);
    let jwks: serde_json::Value = serde_json::from_slice(&jwks).unwrap();
    assert_eq!(jwks["keys"].as_array().unwrap().len(), 1);
    assert_eq!(jwks["keys"][0]["alg"], "ES256");
}
