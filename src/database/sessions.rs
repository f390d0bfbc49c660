// ABOUTME: Session repository - cookie-bound browser sessions with idle and absolute expiry
// ABOUTME: Assurance level raises are compare-and-set and monotonic; sessions never downgrade
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use super::{row_uuid, Database};
use crate::models::{AssuranceLevel, Session};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

fn session_from_row(row: &SqliteRow) -> Result<Session> {
    Ok(Session {
        id: row_uuid(row, "id")?,
        user_id: row_uuid(row, "user_id")?,
        token: row.try_get("token")?,
        csrf_token: row.try_get("csrf_token")?,
        created_at: row.try_get("created_at")?,
        idle_expires_at: row.try_get("idle_expires_at")?,
        absolute_expires_at: row.try_get("absolute_expires_at")?,
        assurance: AssuranceLevel::parse(&row.try_get::<String, _>("assurance")?),
        last_ip: row.try_get("last_ip")?,
        last_user_agent: row.try_get("last_user_agent")?,
        row_version: row.try_get("row_version")?,
    })
}

impl Database {
    /// Persist a new session
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn create_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO sessions (id, user_id, token, csrf_token, created_at, idle_expires_at,
                                  absolute_expires_at, assurance, last_ip, last_user_agent, row_version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0)
            ",
        )
        .bind(session.id.to_string())
        .bind(session.user_id.to_string())
        .bind(&session.token)
        .bind(&session.csrf_token)
        .bind(session.created_at)
        .bind(session.idle_expires_at)
        .bind(session.absolute_expires_at)
        .bind(session.assurance.as_str())
        .bind(&session.last_ip)
        .bind(&session.last_user_agent)
        .execute(&self.pool)
        .await
        .context("failed to create session")?;

        Ok(())
    }

    /// Look up a live session by its opaque cookie token
    ///
    /// Expired sessions (idle or absolute) are invisible; the cleanup
    /// scheduler deletes them later.
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn get_live_session(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let row = sqlx::query(
            r"
            SELECT * FROM sessions
            WHERE token = ?1 AND idle_expires_at > ?2 AND absolute_expires_at > ?2
            ",
        )
        .bind(token)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("failed to get session")?;

        row.as_ref().map(session_from_row).transpose()
    }

    /// Touch a session: extend idle expiry (capped by the absolute expiry)
    /// and record the request's network observables
    ///
    /// Conditional on the observed row version.
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn touch_session(
        &self,
        id: Uuid,
        new_idle_expires_at: DateTime<Utc>,
        ip: Option<&str>,
        user_agent: Option<&str>,
        expected_version: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE sessions
            SET idle_expires_at = MIN(?2, absolute_expires_at),
                last_ip = COALESCE(?3, last_ip),
                last_user_agent = COALESCE(?4, last_user_agent),
                row_version = row_version + 1
            WHERE id = ?1 AND row_version = ?5
            ",
        )
        .bind(id.to_string())
        .bind(new_idle_expires_at)
        .bind(ip)
        .bind(user_agent)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .context("failed to touch session")?;

        Ok(result.rows_affected() == 1)
    }

    /// Raise a session's assurance level; the level only ever increases
    ///
    /// The guard re-checks monotonicity in SQL so a concurrent raise to a
    /// higher level is never clobbered by a lower one.
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn raise_session_assurance(
        &self,
        id: Uuid,
        assurance: AssuranceLevel,
        expected_version: i64,
    ) -> Result<bool> {
        let rank = |level: AssuranceLevel| match level {
            AssuranceLevel::Password => 0i64,
            AssuranceLevel::BasicMfa => 1,
            AssuranceLevel::StrongMfa => 2,
        };

        let result = sqlx::query(
            r"
            UPDATE sessions
            SET assurance = ?2, row_version = row_version + 1
            WHERE id = ?1 AND row_version = ?3
              AND (CASE assurance
                     WHEN 'password' THEN 0
                     WHEN 'basic_mfa' THEN 1
                     ELSE 2
                   END) < ?4
            ",
        )
        .bind(id.to_string())
        .bind(assurance.as_str())
        .bind(expected_version)
        .bind(rank(assurance))
        .execute(&self.pool)
        .await
        .context("failed to raise session assurance")?;

        Ok(result.rows_affected() == 1)
    }

    /// Whether the user has any session recorded from this IP; a cheap
    /// known-device signal for risk scoring
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn user_has_session_from_ip(&self, user_id: Uuid, ip: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sessions WHERE user_id = ?1 AND last_ip = ?2",
        )
        .bind(user_id.to_string())
        .bind(ip)
        .fetch_one(&self.pool)
        .await
        .context("failed to count sessions by ip")?;

        Ok(count > 0)
    }

    /// Delete a session (logout)
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn delete_session(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("failed to delete session")?;

        Ok(())
    }
}
