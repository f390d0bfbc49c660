// ABOUTME: Structured audit event emission with PII minimization
// ABOUTME: Emails are masked to domain-only and IPs to their /24 (or /48 for v6) before any event leaves the process
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

//! Audit events
//!
//! Security-relevant events flow through this module so masking cannot be
//! forgotten at individual call sites. Events are `tracing` records with
//! `target: "audit"`, which the subscriber can route to a dedicated sink.

use std::net::IpAddr;

/// Mask an email address to its domain: `alice@example.com` → `***@example.com`
#[must_use]
pub fn mask_email(address: &str) -> String {
    address
        .rsplit_once('@')
        .map_or_else(|| "***".to_owned(), |(_, domain)| format!("***@{domain}"))
}

/// Mask an IP to its network: /24 for IPv4, /48 for IPv6
#[must_use]
pub fn mask_ip(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let octets = v4.octets();
            format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2])
        }
        Ok(IpAddr::V6(v6)) => {
            let segments = v6.segments();
            format!(
                "{:x}:{:x}:{:x}::/48",
                segments[0], segments[1], segments[2]
            )
        }
        Err(_) => "invalid".to_owned(),
    }
}

/// Mask a phone number to its last two digits
#[must_use]
pub fn mask_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < 2 {
        "***".to_owned()
    } else {
        format!("***{}", &digits[digits.len() - 2..])
    }
}

/// A challenge was generated and its secret dispatched
pub fn challenge_issued(kind: &str, subject_masked: &str, challenge_id: &str) {
    tracing::info!(
        target: "audit",
        event = "challenge_issued",
        kind,
        subject = subject_masked,
        challenge_id,
    );
}

/// A verification attempt ran; `success` covers the indistinguishable
/// not-found/failed cases as one `false`
pub fn verify_attempt(kind: &str, subject_masked: &str, ip_masked: &str, success: bool) {
    tracing::info!(
        target: "audit",
        event = "verify_attempt",
        kind,
        subject = subject_masked,
        ip = ip_masked,
        success,
    );
}

/// A challenge crossed its attempt ceiling and is terminally failed
pub fn challenge_terminal_failure(kind: &str, subject_masked: &str, challenge_id: &str) {
    tracing::warn!(
        target: "audit",
        event = "challenge_terminal_failure",
        kind,
        subject = subject_masked,
        challenge_id,
    );
}

/// A client secret or signing key rotated
pub fn rotation(key_id: &str, old_version: i64, new_version: i64, actor: &str, reason: &str) {
    tracing::info!(
        target: "audit",
        event = "rotation",
        key_id,
        old_version,
        new_version,
        actor,
        reason,
    );
}

/// A WebAuthn credential was marked suspect after a counter regression
pub fn credential_suspect(credential_id: &str, stored_count: i64, presented_count: i64) {
    tracing::warn!(
        target: "audit",
        event = "credential_suspect",
        credential_id,
        stored_count,
        presented_count,
    );
}

/// A token family was revoked after replay or refresh reuse
pub fn family_revoked(family_id: &str, trigger: &str) {
    tracing::warn!(
        target: "audit",
        event = "family_revoked",
        family_id,
        trigger,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_masks_to_domain() {
        assert_eq!(mask_email("alice@example.com"), "***@example.com");
        assert_eq!(mask_email("not-an-email"), "***");
    }

    #[test]
    fn ipv4_masks_to_slash_24() {
        assert_eq!(mask_ip("203.0.113.77"), "203.0.113.0/24");
    }

    #[test]
    fn ipv6_masks_to_slash_48() {
        assert_eq!(mask_ip("2001:db8:abcd:12::1"), "2001:db8:abcd::/48");
    }

    #[test]
    fn garbage_ip_masks_entirely() {
        assert_eq!(mask_ip("nonsense"), "invalid");
    }
}
