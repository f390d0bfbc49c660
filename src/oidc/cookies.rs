// ABOUTME: Cookie parsing and Set-Cookie construction for the browser-facing flows
// ABOUTME: All cookies are HttpOnly, SameSite=Lax, Path=/
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use axum::http::header::{HeaderMap, COOKIE};

/// Session cookie name
pub const SESSION_COOKIE: &str = "aegis_session";

/// Pre-authentication CSRF cookie name (double-submit for the login form)
pub const CSRF_COOKIE: &str = "aegis_csrf";

/// Extract one cookie value from the request headers
#[must_use]
pub fn get_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then(|| value.to_owned())
        })
        .next()
}

/// Build a Set-Cookie header value
#[must_use]
pub fn build_cookie(name: &str, value: &str, max_age_secs: i64) -> String {
    format!("{name}={value}; HttpOnly; SameSite=Lax; Path=/; Max-Age={max_age_secs}")
}

/// Build an expired Set-Cookie header value (deletion)
#[must_use]
pub fn expire_cookie(name: &str) -> String {
    format!("{name}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "a=1; aegis_session=tok; b=2".parse().unwrap());
        assert_eq!(get_cookie(&headers, "aegis_session"), Some("tok".into()));
        assert_eq!(get_cookie(&headers, "missing"), None);
    }
}
