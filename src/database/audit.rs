// ABOUTME: Append-only audit repository for key and secret rotation events
// ABOUTME: Events are written once and only ever read back for operator review
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use super::{row_uuid, Database};
use crate::models::KeyRotationEvent;
use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

fn event_from_row(row: &SqliteRow) -> Result<KeyRotationEvent> {
    Ok(KeyRotationEvent {
        id: row_uuid(row, "id")?,
        key_id: row.try_get("key_id")?,
        old_version: row.try_get("old_version")?,
        new_version: row.try_get("new_version")?,
        reason: row.try_get("reason")?,
        actor: row.try_get("actor")?,
        created_at: row.try_get("created_at")?,
    })
}

impl Database {
    /// Append a rotation event
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn append_rotation_event(&self, event: &KeyRotationEvent) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO key_rotation_events (id, key_id, old_version, new_version, reason, actor, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
        )
        .bind(event.id.to_string())
        .bind(&event.key_id)
        .bind(event.old_version)
        .bind(event.new_version)
        .bind(&event.reason)
        .bind(&event.actor)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .context("failed to append rotation event")?;

        Ok(())
    }

    /// Rotation history for a key, newest first
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn list_rotation_events(&self, key_id: &str) -> Result<Vec<KeyRotationEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM key_rotation_events WHERE key_id = ?1 ORDER BY created_at DESC",
        )
        .bind(key_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list rotation events")?;

        rows.iter().map(event_from_row).collect()
    }
}
