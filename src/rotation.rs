// ABOUTME: Client secret rotation with multi-version grace windows and audit events
// ABOUTME: The plaintext replacement secret is returned to the caller exactly once
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

//! Secret rotation
//!
//! A rotation inserts a new active [`ClientSecretVersion`], retires the
//! prior active version with a grace window (default 7 days), and appends
//! a [`KeyRotationEvent`], all in one transaction. During the grace window
//! both versions verify; afterwards only the new one.
//!
//! [`ClientSecretVersion`]: crate::models::ClientSecretVersion
//! [`KeyRotationEvent`]: crate::models::KeyRotationEvent

use crate::audit;
use crate::crypto;
use crate::database::Database;
use crate::errors::{AppError, AppResult};
use chrono::Duration;
use uuid::Uuid;

/// Result of a rotation; `plaintext` exists only in this value and is never
/// persisted or logged
#[derive(Debug)]
pub struct RotatedSecret {
    /// The rotated client's internal id
    pub client_id: Uuid,
    /// The new secret, handed to the caller exactly once
    pub plaintext: String,
    /// Retired version number
    pub old_version: i64,
    /// New active version number
    pub new_version: i64,
}

/// Client secret rotation service
pub struct SecretRotationService {
    database: Database,
    grace: Duration,
    pbkdf2_iterations: u32,
}

impl SecretRotationService {
    /// Create a rotation service
    #[must_use]
    pub const fn new(database: Database, grace: Duration, pbkdf2_iterations: u32) -> Self {
        Self {
            database,
            grace,
            pbkdf2_iterations,
        }
    }

    /// Rotate a client's secret
    ///
    /// Notification of the client's operators is best-effort and never
    /// blocks the rotation transaction; the audit trail records the event
    /// either way.
    ///
    /// # Errors
    /// Returns an error for unknown clients, clients whose authentication
    /// method is not secret-based, or storage failures.
    pub async fn rotate(
        &self,
        client_public_id: &str,
        actor: &str,
        reason: &str,
    ) -> AppResult<RotatedSecret> {
        let client = self
            .database
            .get_client_by_client_id(client_public_id)
            .await
            .map_err(AppError::from)?
            .ok_or_else(|| AppError::not_found("client"))?;

        if !client.auth_method.is_secret_based() {
            return Err(AppError::invalid_request(
                "client does not authenticate with a secret",
            ));
        }

        let plaintext = crypto::generate_token()?;
        let secret_hash = crypto::hash_secret(&plaintext, self.pbkdf2_iterations)?;

        let event = self
            .database
            .rotate_client_secret(client.id, &secret_hash, self.grace, actor, reason)
            .await
            .map_err(AppError::from)?;

        audit::rotation(
            &event.key_id,
            event.old_version,
            event.new_version,
            actor,
            reason,
        );

        Ok(RotatedSecret {
            client_id: client.id,
            plaintext,
            old_version: event.old_version,
            new_version: event.new_version,
        })
    }
}
