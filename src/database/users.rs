// ABOUTME: User repository - account CRUD with soft-delete invisibility
// ABOUTME: Deleted users never surface from any query except the purge path
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use super::{row_uuid, Database};
use crate::models::{User, UserStatus};
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

fn user_from_row(row: &SqliteRow) -> Result<User> {
    Ok(User {
        id: row_uuid(row, "id")?,
        username: row.try_get("username")?,
        display_name: row.try_get("display_name")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        status: UserStatus::parse(&row.try_get::<String, _>("status")?),
        totp_secret_enc: row.try_get("totp_secret_enc")?,
        otp_phone: row.try_get("otp_phone")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Database {
    /// Create a new user account
    ///
    /// # Errors
    /// Returns an error on storage failure or a username/email collision.
    pub async fn create_user(&self, user: &User) -> Result<Uuid> {
        sqlx::query(
            r"
            INSERT INTO users (id, username, display_name, email, password_hash, status,
                               totp_secret_enc, otp_phone, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
        )
        .bind(user.id.to_string())
        .bind(&user.username)
        .bind(&user.display_name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.status.as_str())
        .bind(&user.totp_secret_enc)
        .bind(&user.otp_phone)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to create user")?;

        Ok(user.id)
    }

    /// Get a user by id; deleted users are invisible
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn get_user(&self, user_id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?1 AND status != 'deleted'")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("failed to get user")?;

        row.as_ref().map(user_from_row).transpose()
    }

    /// Get a user by case-folded username; deleted users are invisible
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE username = ?1 AND status != 'deleted'")
            .bind(username.to_lowercase())
            .fetch_optional(&self.pool)
            .await
            .context("failed to get user by username")?;

        row.as_ref().map(user_from_row).transpose()
    }

    /// Replace a user's password verifier (migration re-hash or password change)
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn update_user_password(&self, user_id: Uuid, password_hash: &str) -> Result<()> {
        sqlx::query(
            "UPDATE users SET password_hash = ?2, updated_at = ?3 WHERE id = ?1 AND status != 'deleted'",
        )
        .bind(user_id.to_string())
        .bind(password_hash)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to update password")?;

        Ok(())
    }

    /// Transition a user's status
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn set_user_status(&self, user_id: Uuid, status: UserStatus) -> Result<()> {
        sqlx::query("UPDATE users SET status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(user_id.to_string())
            .bind(status.as_str())
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("failed to set user status")?;

        Ok(())
    }

    /// Store the AES-GCM-encrypted TOTP secret for a user
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn set_user_totp_secret(&self, user_id: Uuid, secret_enc: &str) -> Result<()> {
        sqlx::query(
            "UPDATE users SET totp_secret_enc = ?2, updated_at = ?3 WHERE id = ?1 AND status != 'deleted'",
        )
        .bind(user_id.to_string())
        .bind(secret_enc)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to set TOTP secret")?;

        Ok(())
    }

    /// Permanently remove soft-deleted users; the only path that sees them
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn purge_deleted_users(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM users WHERE status = 'deleted'")
            .execute(&self.pool)
            .await
            .context("failed to purge deleted users")?;

        Ok(result.rows_affected())
    }
}
