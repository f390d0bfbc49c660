// ABOUTME: Authentication challenge repository - OTP, magic-link, and WebAuthn ceremony state
// ABOUTME: Consumption and attempt accounting are single conditional updates; failed is terminal and silent
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use super::{row_uuid_opt, Database};
use crate::models::{AuthenticationChallenge, ChallengeKind};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

fn challenge_from_row(row: &SqliteRow) -> Result<AuthenticationChallenge> {
    let metadata: String = row.try_get("metadata")?;
    Ok(AuthenticationChallenge {
        id: super::row_uuid(row, "id")?,
        kind: ChallengeKind::parse(&row.try_get::<String, _>("kind")?),
        user_id: row_uuid_opt(row, "user_id")?,
        verifier_hash: row.try_get("verifier_hash")?,
        webauthn_challenge: row.try_get("webauthn_challenge")?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        consumed: row.try_get("consumed")?,
        failed: row.try_get("failed")?,
    })
}

impl Database {
    /// Persist a new challenge
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn create_challenge(&self, challenge: &AuthenticationChallenge) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO authentication_challenges
                (id, kind, user_id, verifier_hash, webauthn_challenge, metadata,
                 created_at, expires_at, attempts, max_attempts, consumed, failed)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, 0, 0)
            ",
        )
        .bind(challenge.id.to_string())
        .bind(challenge.kind.as_str())
        .bind(challenge.user_id.map(|u| u.to_string()))
        .bind(&challenge.verifier_hash)
        .bind(&challenge.webauthn_challenge)
        .bind(serde_json::to_string(&challenge.metadata)?)
        .bind(challenge.created_at)
        .bind(challenge.expires_at)
        .bind(challenge.max_attempts)
        .execute(&self.pool)
        .await
        .context("failed to create challenge")?;

        Ok(())
    }

    /// Get a live challenge by id
    ///
    /// Consumed, failed, and expired challenges are indistinguishable from
    /// missing ones.
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn get_live_challenge(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<AuthenticationChallenge>> {
        let row = sqlx::query(
            r"
            SELECT * FROM authentication_challenges
            WHERE id = ?1 AND consumed = 0 AND failed = 0 AND expires_at > ?2
            ",
        )
        .bind(id.to_string())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("failed to get challenge")?;

        row.as_ref().map(challenge_from_row).transpose()
    }

    /// Mark a challenge consumed; only a live challenge transitions
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn consume_challenge(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<AuthenticationChallenge>> {
        let row = sqlx::query(
            r"
            UPDATE authentication_challenges
            SET consumed = 1
            WHERE id = ?1 AND consumed = 0 AND failed = 0 AND expires_at > ?2
            RETURNING *
            ",
        )
        .bind(id.to_string())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("failed to consume challenge")?;

        row.as_ref().map(challenge_from_row).transpose()
    }

    /// Atomically consume a live WebAuthn ceremony challenge keyed by its own bytes
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn consume_webauthn_challenge(
        &self,
        kind: ChallengeKind,
        challenge_b64: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AuthenticationChallenge>> {
        let row = sqlx::query(
            r"
            UPDATE authentication_challenges
            SET consumed = 1
            WHERE webauthn_challenge = ?1 AND kind = ?2
              AND consumed = 0 AND failed = 0 AND expires_at > ?3
            RETURNING *
            ",
        )
        .bind(challenge_b64)
        .bind(kind.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("failed to consume WebAuthn challenge")?;

        row.as_ref().map(challenge_from_row).transpose()
    }

    /// Record a failed attempt; the third failure transitions the challenge
    /// to terminal-failed in the same statement
    ///
    /// Returns the updated attempt count and whether the challenge is now
    /// terminally failed, or `None` when the challenge was not live.
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn record_failed_attempt(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<(i64, bool)>> {
        let row = sqlx::query(
            r"
            UPDATE authentication_challenges
            SET attempts = attempts + 1,
                failed = CASE WHEN attempts + 1 >= max_attempts THEN 1 ELSE 0 END
            WHERE id = ?1 AND consumed = 0 AND failed = 0 AND expires_at > ?2
            RETURNING attempts, failed
            ",
        )
        .bind(id.to_string())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("failed to record challenge attempt")?;

        row.map(|row| {
            let attempts: i64 = row.try_get("attempts")?;
            let failed: bool = row.try_get("failed")?;
            Ok((attempts, failed))
        })
        .transpose()
    }

    /// Delete a challenge outright (successful consumption path)
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn delete_challenge(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM authentication_challenges WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("failed to delete challenge")?;

        Ok(())
    }
}
