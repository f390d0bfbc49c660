// ABOUTME: Consent decision repository - one non-expired decision per (user, client) pair
// ABOUTME: Newer decisions supersede older via upsert on the unique pair index
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use super::{row_string_vec, row_uuid, Database};
use crate::models::ConsentDecision;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

fn consent_from_row(row: &SqliteRow) -> Result<ConsentDecision> {
    Ok(ConsentDecision {
        id: row_uuid(row, "id")?,
        user_id: row_uuid(row, "user_id")?,
        client_id: row_uuid(row, "client_id")?,
        scopes: row_string_vec(row, "scopes")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

impl Database {
    /// Record a consent decision, superseding any prior decision for the pair
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn upsert_consent(&self, consent: &ConsentDecision) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO consent_decisions (id, user_id, client_id, scopes, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (user_id, client_id) DO UPDATE SET
                id = excluded.id,
                scopes = excluded.scopes,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            ",
        )
        .bind(consent.id.to_string())
        .bind(consent.user_id.to_string())
        .bind(consent.client_id.to_string())
        .bind(serde_json::to_string(&consent.scopes)?)
        .bind(consent.created_at)
        .bind(consent.expires_at)
        .execute(&self.pool)
        .await
        .context("failed to upsert consent decision")?;

        Ok(())
    }

    /// Get the non-expired consent decision for a (user, client) pair
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn get_consent(
        &self,
        user_id: Uuid,
        client_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ConsentDecision>> {
        let row = sqlx::query(
            r"
            SELECT * FROM consent_decisions
            WHERE user_id = ?1 AND client_id = ?2 AND expires_at > ?3
            ",
        )
        .bind(user_id.to_string())
        .bind(client_id.to_string())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("failed to get consent decision")?;

        row.as_ref().map(consent_from_row).transpose()
    }
}
