// ABOUTME: OTP and magic-link authenticator - generate, deliver, and verify short-lived challenges
// ABOUTME: Verification failures are indistinguishable from missing challenges to prevent enumeration
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

//! OTP / magic-link authentication
//!
//! A generated secret is hashed and persisted as an
//! [`AuthenticationChallenge`]; only the challenge identifier ever returns
//! to the caller. Verification is rate limited per subject and per IP on
//! independent sliding windows, and a challenge terminally fails after its
//! third failed attempt.

use crate::audit;
use crate::crypto;
use crate::database::Database;
use crate::errors::{AppError, AppResult, ErrorCode};
use crate::models::{AuthenticationChallenge, ChallengeKind};
use crate::rate_limiting::{RateLimitDecision, SlidingWindowLimiter};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Maximum failed attempts per challenge before terminal failure
const MAX_CHALLENGE_ATTEMPTS: i64 = 3;

/// Outbound delivery capability for OTP codes and magic links
///
/// The authenticator never attempts failover itself; delivery errors
/// surface as `DeliveryFailure` and no challenge is created.
#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    /// Send an SMS message
    async fn send_sms(&self, to: &str, body: &str) -> AppResult<()>;

    /// Send an email message
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> AppResult<()>;

    /// Provider liveness, surfaced to health checks
    async fn healthy(&self) -> bool;
}

/// The single error every verification failure collapses into
///
/// Not-found, expired, consumed, wrong code, and over-limit all look the
/// same to the caller; the audit log keeps the real reason.
fn verification_failed() -> AppError {
    AppError::new(ErrorCode::InvalidGrant, "verification failed")
}

/// OTP / magic-link authenticator
pub struct OtpAuthenticator {
    database: Database,
    delivery: Arc<dyn DeliveryProvider>,
    subject_limiter: SlidingWindowLimiter,
    ip_limiter: SlidingWindowLimiter,
    pbkdf2_iterations: u32,
    magic_link_base: String,
}

impl OtpAuthenticator {
    /// Create an authenticator
    #[must_use]
    pub fn new(
        database: Database,
        delivery: Arc<dyn DeliveryProvider>,
        max_attempts: u32,
        window: std::time::Duration,
        pbkdf2_iterations: u32,
        magic_link_base: String,
    ) -> Self {
        Self {
            database,
            delivery,
            subject_limiter: SlidingWindowLimiter::new(max_attempts, window),
            ip_limiter: SlidingWindowLimiter::new(max_attempts, window),
            pbkdf2_iterations,
            magic_link_base,
        }
    }

    /// Generate a challenge, deliver its secret, and persist the hash
    ///
    /// The plaintext secret leaves through the delivery provider only; the
    /// caller receives the challenge identifier. No challenge exists if
    /// delivery fails.
    ///
    /// # Errors
    /// `DeliveryFailure` when the provider rejects the message; storage and
    /// crypto errors otherwise.
    pub async fn generate(
        &self,
        user_id: Uuid,
        kind: ChallengeKind,
        address: &str,
    ) -> AppResult<Uuid> {
        let (secret, masked_subject) = match kind {
            ChallengeKind::SmsOtp => (crypto::generate_numeric_otp()?, audit::mask_phone(address)),
            ChallengeKind::EmailOtp => {
                (crypto::generate_numeric_otp()?, audit::mask_email(address))
            }
            ChallengeKind::MagicLink => (crypto::generate_token()?, audit::mask_email(address)),
            ChallengeKind::WebauthnRegistration | ChallengeKind::WebauthnAssertion => {
                return Err(AppError::invalid_request(
                    "WebAuthn challenges are issued by the WebAuthn authenticator",
                ));
            }
        };

        let verifier_hash = crypto::hash_secret(&secret, self.pbkdf2_iterations)?;
        let now = Utc::now();
        let challenge = AuthenticationChallenge {
            id: Uuid::now_v7(),
            kind,
            user_id: Some(user_id),
            verifier_hash: Some(verifier_hash),
            webauthn_challenge: None,
            metadata: json!({ "address": masked_subject }),
            created_at: now,
            expires_at: now + kind.ttl(),
            attempts: 0,
            max_attempts: MAX_CHALLENGE_ATTEMPTS,
            consumed: false,
            failed: false,
        };

        // Delivery first: a challenge must not exist when delivery fails
        match kind {
            ChallengeKind::SmsOtp => {
                self.delivery
                    .send_sms(address, &format!("Your verification code is {secret}"))
                    .await
                    .map_err(|e| {
                        tracing::warn!("SMS delivery failed: {e}");
                        AppError::new(ErrorCode::DeliveryFailure, "SMS delivery failed")
                    })?;
            }
            ChallengeKind::EmailOtp => {
                self.delivery
                    .send_email(
                        address,
                        "Your verification code",
                        &format!("Your verification code is {secret}. It expires in 5 minutes."),
                    )
                    .await
                    .map_err(|e| {
                        tracing::warn!("email delivery failed: {e}");
                        AppError::new(ErrorCode::DeliveryFailure, "email delivery failed")
                    })?;
            }
            ChallengeKind::MagicLink => {
                let link = format!(
                    "{}/oidc/v1/magic?challenge_id={}&token={}",
                    self.magic_link_base, challenge.id, secret
                );
                self.delivery
                    .send_email(
                        address,
                        "Your sign-in link",
                        &format!("Sign in with this link: {link}\nIt expires in 15 minutes."),
                    )
                    .await
                    .map_err(|e| {
                        tracing::warn!("magic link delivery failed: {e}");
                        AppError::new(ErrorCode::DeliveryFailure, "email delivery failed")
                    })?;
            }
            ChallengeKind::WebauthnRegistration | ChallengeKind::WebauthnAssertion => {
                return Err(AppError::invalid_request(
                    "WebAuthn challenges are issued by the WebAuthn authenticator",
                ));
            }
        }

        self.database
            .create_challenge(&challenge)
            .await
            .map_err(AppError::from)?;

        audit::challenge_issued(kind.as_str(), &masked_subject, &challenge.id.to_string());

        Ok(challenge.id)
    }

    /// Verify a presented secret against a challenge
    ///
    /// Every failure path returns the same error; success consumes the
    /// challenge and deletes it. Rate limits run before the challenge is
    /// even looked up, on independent per-subject and per-IP windows.
    ///
    /// # Errors
    /// One indistinguishable verification error for all failure causes.
    pub async fn verify(
        &self,
        challenge_id: Uuid,
        presented: &str,
        ip: &str,
        subject_hint: Option<Uuid>,
    ) -> AppResult<Uuid> {
        let subject_key = subject_hint
            .map_or_else(|| challenge_id.to_string(), |user_id| user_id.to_string());
        let ip_masked = audit::mask_ip(ip);

        if matches!(
            self.subject_limiter.check(&subject_key),
            RateLimitDecision::Limited { .. }
        ) || matches!(self.ip_limiter.check(ip), RateLimitDecision::Limited { .. })
        {
            audit::verify_attempt("otp_rate_limited", &subject_key, &ip_masked, false);
            return Err(verification_failed());
        }

        let now = Utc::now();
        let Some(challenge) = self
            .database
            .get_live_challenge(challenge_id, now)
            .await
            .map_err(AppError::from)?
        else {
            audit::verify_attempt("otp", &subject_key, &ip_masked, false);
            return Err(verification_failed());
        };

        let Some(verifier_hash) = challenge.verifier_hash.as_deref() else {
            audit::verify_attempt("otp", &subject_key, &ip_masked, false);
            return Err(verification_failed());
        };

        let matches = crypto::verify_secret(presented, verifier_hash).unwrap_or(false);

        if matches {
            // Consume-then-delete; the conditional consume is what beats a
            // concurrent verifier to the challenge
            let consumed = self
                .database
                .consume_challenge(challenge_id, now)
                .await
                .map_err(AppError::from)?;
            if consumed.is_none() {
                audit::verify_attempt(challenge.kind.as_str(), &subject_key, &ip_masked, false);
                return Err(verification_failed());
            }
            self.database
                .delete_challenge(challenge_id)
                .await
                .map_err(AppError::from)?;

            audit::verify_attempt(challenge.kind.as_str(), &subject_key, &ip_masked, true);
            challenge.user_id.ok_or_else(verification_failed)
        } else {
            if let Some((_, failed)) = self
                .database
                .record_failed_attempt(challenge_id, now)
                .await
                .map_err(AppError::from)?
            {
                if failed {
                    audit::challenge_terminal_failure(
                        challenge.kind.as_str(),
                        &subject_key,
                        &challenge_id.to_string(),
                    );
                }
            }
            audit::verify_attempt(challenge.kind.as_str(), &subject_key, &ip_masked, false);
            Err(verification_failed())
        }
    }

    /// Delivery provider liveness, for the health endpoint
    pub async fn delivery_healthy(&self) -> bool {
        self.delivery.healthy().await
    }
}
