// ABOUTME: Authorization request repository - the /authorize → login → token bridge
// ABOUTME: State transitions are conditional updates guarded by predecessor state and row version
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use super::{row_uuid, row_uuid_opt, Database};
use crate::models::AuthorizationRequest;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

pub(crate) fn request_from_row(row: &SqliteRow) -> Result<AuthorizationRequest> {
    Ok(AuthorizationRequest {
        id: row_uuid(row, "id")?,
        client_id: row_uuid(row, "client_id")?,
        redirect_uri: row.try_get("redirect_uri")?,
        scope: row.try_get("scope")?,
        state: row.try_get("state")?,
        code_challenge: row.try_get("code_challenge")?,
        code_challenge_method: row.try_get("code_challenge_method")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        consumed: row.try_get("consumed")?,
        consumed_at: row.try_get("consumed_at")?,
        user_id: row_uuid_opt(row, "user_id")?,
        code: row.try_get("code")?,
        code_expires_at: row.try_get("code_expires_at")?,
        row_version: row.try_get("row_version")?,
    })
}

impl Database {
    /// Persist a freshly validated authorization request
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn create_authorization_request(&self, request: &AuthorizationRequest) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO authorization_requests
                (id, client_id, redirect_uri, scope, state, code_challenge, code_challenge_method,
                 created_at, expires_at, consumed, user_id, code, code_expires_at, row_version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, NULL, NULL, NULL, 0)
            ",
        )
        .bind(request.id.to_string())
        .bind(request.client_id.to_string())
        .bind(&request.redirect_uri)
        .bind(&request.scope)
        .bind(&request.state)
        .bind(&request.code_challenge)
        .bind(&request.code_challenge_method)
        .bind(request.created_at)
        .bind(request.expires_at)
        .execute(&self.pool)
        .await
        .context("failed to create authorization request")?;

        Ok(())
    }

    /// Get an authorization request by id
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn get_authorization_request(
        &self,
        id: Uuid,
    ) -> Result<Option<AuthorizationRequest>> {
        let row = sqlx::query("SELECT * FROM authorization_requests WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("failed to get authorization request")?;

        row.as_ref().map(request_from_row).transpose()
    }

    /// Bind the authenticated user to a live, not-yet-consumed request
    ///
    /// Conditional on the row version observed by the caller; returns
    /// `false` when the compare-and-set loses, so the caller can re-read
    /// and retry.
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn attach_user_to_request(
        &self,
        id: Uuid,
        user_id: Uuid,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE authorization_requests
            SET user_id = ?2, row_version = row_version + 1
            WHERE id = ?1 AND consumed = 0 AND expires_at > ?3 AND row_version = ?4
            ",
        )
        .bind(id.to_string())
        .bind(user_id.to_string())
        .bind(now)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .context("failed to attach user to authorization request")?;

        Ok(result.rows_affected() == 1)
    }

    /// Mint the authorization code onto a request with an authenticated user
    ///
    /// A code cannot exist without a bound user: the predecessor-state guard
    /// includes `user_id IS NOT NULL`.
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn set_code_on_request(
        &self,
        id: Uuid,
        code: &str,
        code_expires_at: DateTime<Utc>,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE authorization_requests
            SET code = ?2, code_expires_at = ?3, row_version = row_version + 1
            WHERE id = ?1 AND consumed = 0 AND code IS NULL AND user_id IS NOT NULL
              AND expires_at > ?4 AND row_version = ?5
            ",
        )
        .bind(id.to_string())
        .bind(code)
        .bind(code_expires_at)
        .bind(now)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .context("failed to set authorization code")?;

        Ok(result.rows_affected() == 1)
    }
}
