// ABOUTME: Minimal server-rendered HTML for the login and consent flows
// ABOUTME: Error pages name only the failure category and never disclose account existence
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use std::fmt::Write as _;

/// Escape a string for HTML text and attribute contexts
#[must_use]
pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// User-visible failure categories; deliberately coarse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Username/password or second factor rejected
    CredentialInvalid,
    /// Authorization request or code expired
    CodeExpired,
    /// Browser session expired or missing
    SessionExpired,
}

impl ErrorCategory {
    const fn message(self) -> &'static str {
        match self {
            Self::CredentialInvalid => "Sign-in failed. Check your credentials and try again.",
            Self::CodeExpired => "This sign-in request has expired. Start again from the application.",
            Self::SessionExpired => "Your session has expired. Start again from the application.",
        }
    }
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         <title>{}</title>\n</head>\n<body>\n{}\n</body>\n</html>\n",
        escape(title),
        body
    )
}

/// The login form
#[must_use]
pub fn login_page(request_id: &str, csrf_token: &str, error: Option<ErrorCategory>) -> String {
    let mut body = String::new();
    body.push_str("<h1>Sign in</h1>\n");
    if let Some(error) = error {
        let _ = writeln!(body, "<p role=\"alert\">{}</p>", escape(error.message()));
    }
    let _ = write!(
        body,
        "<form method=\"post\" action=\"/oidc/v1/login\">\n\
         <input type=\"hidden\" name=\"request_id\" value=\"{}\">\n\
         <input type=\"hidden\" name=\"csrf_token\" value=\"{}\">\n\
         <label>Username <input type=\"text\" name=\"username\" autocomplete=\"username\" required></label>\n\
         <label>Password <input type=\"password\" name=\"password\" autocomplete=\"current-password\" required></label>\n\
         <button type=\"submit\">Sign in</button>\n\
         </form>",
        escape(request_id),
        escape(csrf_token)
    );
    page("Sign in", &body)
}

/// Second-factor prompt: TOTP code entry
#[must_use]
pub fn totp_page(request_id: &str, csrf_token: &str, error: Option<ErrorCategory>) -> String {
    let mut body = String::new();
    body.push_str("<h1>Verification required</h1>\n");
    if let Some(error) = error {
        let _ = writeln!(body, "<p role=\"alert\">{}</p>", escape(error.message()));
    }
    let _ = write!(
        body,
        "<p>Enter the code from your authenticator app.</p>\n\
         <form method=\"post\" action=\"/oidc/v1/login/mfa\">\n\
         <input type=\"hidden\" name=\"request_id\" value=\"{}\">\n\
         <input type=\"hidden\" name=\"csrf_token\" value=\"{}\">\n\
         <label>Code <input type=\"text\" name=\"totp_code\" inputmode=\"numeric\" autocomplete=\"one-time-code\" required></label>\n\
         <button type=\"submit\">Verify</button>\n\
         </form>",
        escape(request_id),
        escape(csrf_token)
    );
    page("Verification required", &body)
}

/// Second-factor prompt: emailed OTP entry
#[must_use]
pub fn otp_page(
    request_id: &str,
    csrf_token: &str,
    challenge_id: &str,
    error: Option<ErrorCategory>,
) -> String {
    let mut body = String::new();
    body.push_str("<h1>Verification required</h1>\n");
    if let Some(error) = error {
        let _ = writeln!(body, "<p role=\"alert\">{}</p>", escape(error.message()));
    }
    let _ = write!(
        body,
        "<p>We sent a code to your registered address.</p>\n\
         <form method=\"post\" action=\"/oidc/v1/login/mfa\">\n\
         <input type=\"hidden\" name=\"request_id\" value=\"{}\">\n\
         <input type=\"hidden\" name=\"csrf_token\" value=\"{}\">\n\
         <input type=\"hidden\" name=\"challenge_id\" value=\"{}\">\n\
         <label>Code <input type=\"text\" name=\"otp_code\" inputmode=\"numeric\" autocomplete=\"one-time-code\" required></label>\n\
         <button type=\"submit\">Verify</button>\n\
         </form>",
        escape(request_id),
        escape(csrf_token),
        escape(challenge_id)
    );
    page("Verification required", &body)
}

/// The consent form listing requested scopes
#[must_use]
pub fn consent_page(
    request_id: &str,
    csrf_token: &str,
    client_name: &str,
    scopes: &[&str],
) -> String {
    let mut body = String::new();
    let _ = writeln!(
        body,
        "<h1>Authorize {}</h1>\n<p>This application requests access to:</p>\n<ul>",
        escape(client_name)
    );
    for scope in scopes {
        let _ = writeln!(body, "<li>{}</li>", escape(scope));
    }
    body.push_str("</ul>\n");
    let _ = write!(
        body,
        "<form method=\"post\" action=\"/oidc/v1/consent\">\n\
         <input type=\"hidden\" name=\"request_id\" value=\"{}\">\n\
         <input type=\"hidden\" name=\"csrf_token\" value=\"{}\">\n\
         <button type=\"submit\" name=\"action\" value=\"approve\">Allow</button>\n\
         <button type=\"submit\" name=\"action\" value=\"deny\">Deny</button>\n\
         </form>",
        escape(request_id),
        escape(csrf_token)
    );
    page("Authorize", &body)
}

/// Terminal error page naming only the category
#[must_use]
pub fn error_page(category: ErrorCategory) -> String {
    page(
        "Sign-in error",
        &format!("<h1>Sign-in error</h1>\n<p>{}</p>", escape(category.message())),
    )
}
