// ABOUTME: WebAuthn credential repository - COSE keys, sign counters, and suspect marking
// ABOUTME: Counter updates are conditional on the prior value; concurrent assertions cannot both win
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use super::{row_uuid, Database};
use crate::models::{WebAuthnCredential, WebAuthnCredentialState};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

fn credential_from_row(row: &SqliteRow) -> Result<WebAuthnCredential> {
    Ok(WebAuthnCredential {
        credential_id: row.try_get("credential_id")?,
        user_id: row_uuid(row, "user_id")?,
        public_key_cose: row.try_get("public_key_cose")?,
        attestation_format: row.try_get("attestation_format")?,
        aaguid: row.try_get("aaguid")?,
        sign_count: row.try_get("sign_count")?,
        state: WebAuthnCredentialState::parse(&row.try_get::<String, _>("state")?),
        label: row.try_get("label")?,
        created_at: row.try_get("created_at")?,
        last_used_at: row.try_get("last_used_at")?,
    })
}

impl Database {
    /// Store a newly registered credential
    ///
    /// # Errors
    /// Returns an error on storage failure or a credential id collision.
    pub async fn store_webauthn_credential(&self, credential: &WebAuthnCredential) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO webauthn_credentials
                (credential_id, user_id, public_key_cose, attestation_format, aaguid,
                 sign_count, state, label, created_at, last_used_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL)
            ",
        )
        .bind(&credential.credential_id)
        .bind(credential.user_id.to_string())
        .bind(&credential.public_key_cose)
        .bind(&credential.attestation_format)
        .bind(&credential.aaguid)
        .bind(credential.sign_count)
        .bind(credential.state.as_str())
        .bind(&credential.label)
        .bind(credential.created_at)
        .execute(&self.pool)
        .await
        .context("failed to store WebAuthn credential")?;

        Ok(())
    }

    /// Get a credential by its authenticator-assigned id
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn get_webauthn_credential(
        &self,
        credential_id: &str,
    ) -> Result<Option<WebAuthnCredential>> {
        let row = sqlx::query("SELECT * FROM webauthn_credentials WHERE credential_id = ?1")
            .bind(credential_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to get WebAuthn credential")?;

        row.as_ref().map(credential_from_row).transpose()
    }

    /// List a user's registered credentials
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn list_webauthn_credentials(&self, user_id: Uuid) -> Result<Vec<WebAuthnCredential>> {
        let rows = sqlx::query(
            "SELECT * FROM webauthn_credentials WHERE user_id = ?1 ORDER BY created_at",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("failed to list WebAuthn credentials")?;

        rows.iter().map(credential_from_row).collect()
    }

    /// Advance the sign counter after a verified assertion
    ///
    /// Conditional on the prior counter value so concurrent assertions of
    /// the same credential cannot both succeed, and refused outright for
    /// suspect credentials.
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn advance_sign_count(
        &self,
        credential_id: &str,
        prior_count: i64,
        new_count: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE webauthn_credentials
            SET sign_count = ?3, state = 'in_use', last_used_at = ?4
            WHERE credential_id = ?1 AND sign_count = ?2 AND state != 'suspect'
            ",
        )
        .bind(credential_id)
        .bind(prior_count)
        .bind(new_count)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to advance sign counter")?;

        Ok(result.rows_affected() == 1)
    }

    /// Mark a credential suspect after a cloned-authenticator event; terminal
    /// until an operator resets it
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn mark_webauthn_credential_suspect(&self, credential_id: &str) -> Result<()> {
        sqlx::query("UPDATE webauthn_credentials SET state = 'suspect' WHERE credential_id = ?1")
            .bind(credential_id)
            .execute(&self.pool)
            .await
            .context("failed to mark credential suspect")?;

        Ok(())
    }

    /// Operator reset of a suspect credential back to `registered`
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn reset_webauthn_credential(&self, credential_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE webauthn_credentials SET state = 'registered' WHERE credential_id = ?1 AND state = 'suspect'",
        )
        .bind(credential_id)
        .execute(&self.pool)
        .await
        .context("failed to reset credential")?;

        Ok(result.rows_affected() == 1)
    }
}
