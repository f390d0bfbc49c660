// ABOUTME: Client repository - registered relying parties and their multi-version secrets
// ABOUTME: Rotation inserts a new version, retires the prior active one, and appends an audit event atomically
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use super::{row_string_vec, row_uuid, Database};
use crate::models::{Client, ClientAuthMethod, ClientSecretVersion, KeyRotationEvent, TokenLifetimes};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

fn client_from_row(row: &SqliteRow) -> Result<Client> {
    Ok(Client {
        id: row_uuid(row, "id")?,
        client_id: row.try_get("client_id")?,
        name: row.try_get("name")?,
        grant_types: row_string_vec(row, "grant_types")?,
        response_types: row_string_vec(row, "response_types")?,
        redirect_uris: row_string_vec(row, "redirect_uris")?,
        allowed_scopes: row_string_vec(row, "allowed_scopes")?,
        auth_method: ClientAuthMethod::parse(&row.try_get::<String, _>("auth_method")?),
        require_pkce: row.try_get("require_pkce")?,
        token_lifetimes: TokenLifetimes {
            access_secs: row.try_get("access_token_secs")?,
            refresh_secs: row.try_get("refresh_token_secs")?,
            id_secs: row.try_get("id_token_secs")?,
        },
        mtls_fingerprint: row.try_get("mtls_fingerprint")?,
        assertion_jwks: row.try_get("assertion_jwks")?,
        created_at: row.try_get("created_at")?,
    })
}

fn secret_version_from_row(row: &SqliteRow) -> Result<ClientSecretVersion> {
    Ok(ClientSecretVersion {
        id: row_uuid(row, "id")?,
        client_id: row_uuid(row, "client_id")?,
        version: row.try_get("version")?,
        secret_hash: row.try_get("secret_hash")?,
        created_at: row.try_get("created_at")?,
        activated_at: row.try_get("activated_at")?,
        retired_at: row.try_get("retired_at")?,
        grace_until: row.try_get("grace_until")?,
    })
}

impl Database {
    /// Register a client
    ///
    /// # Errors
    /// Returns an error on storage failure or a `client_id` collision.
    pub async fn create_client(&self, client: &Client) -> Result<Uuid> {
        sqlx::query(
            r"
            INSERT INTO clients (id, client_id, name, grant_types, response_types, redirect_uris,
                                 allowed_scopes, auth_method, require_pkce, access_token_secs,
                                 refresh_token_secs, id_token_secs, mtls_fingerprint, assertion_jwks,
                                 created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ",
        )
        .bind(client.id.to_string())
        .bind(&client.client_id)
        .bind(&client.name)
        .bind(serde_json::to_string(&client.grant_types)?)
        .bind(serde_json::to_string(&client.response_types)?)
        .bind(serde_json::to_string(&client.redirect_uris)?)
        .bind(serde_json::to_string(&client.allowed_scopes)?)
        .bind(client.auth_method.as_str())
        .bind(client.require_pkce)
        .bind(client.token_lifetimes.access_secs)
        .bind(client.token_lifetimes.refresh_secs)
        .bind(client.token_lifetimes.id_secs)
        .bind(&client.mtls_fingerprint)
        .bind(&client.assertion_jwks)
        .bind(client.created_at)
        .execute(&self.pool)
        .await
        .context("failed to create client")?;

        Ok(client.id)
    }

    /// Get a client by its public `client_id`
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn get_client_by_client_id(&self, client_id: &str) -> Result<Option<Client>> {
        let row = sqlx::query("SELECT * FROM clients WHERE client_id = ?1")
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to get client")?;

        row.as_ref().map(client_from_row).transpose()
    }

    /// Get a client by internal id
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn get_client(&self, id: Uuid) -> Result<Option<Client>> {
        let row = sqlx::query("SELECT * FROM clients WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("failed to get client by id")?;

        row.as_ref().map(client_from_row).transpose()
    }

    /// Insert the first secret version for a freshly registered client
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn insert_initial_secret_version(
        &self,
        client_id: Uuid,
        secret_hash: &str,
    ) -> Result<ClientSecretVersion> {
        let now = Utc::now();
        let version = ClientSecretVersion {
            id: Uuid::now_v7(),
            client_id,
            version: 1,
            secret_hash: secret_hash.to_owned(),
            created_at: now,
            activated_at: now,
            retired_at: None,
            grace_until: None,
        };

        sqlx::query(
            r"
            INSERT INTO client_secret_versions (id, client_id, version, secret_hash,
                                                created_at, activated_at, retired_at, grace_until)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL)
            ",
        )
        .bind(version.id.to_string())
        .bind(client_id.to_string())
        .bind(version.version)
        .bind(&version.secret_hash)
        .bind(version.created_at)
        .bind(version.activated_at)
        .execute(&self.pool)
        .await
        .context("failed to insert initial secret version")?;

        Ok(version)
    }

    /// All secret versions for a client, newest first
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn list_secret_versions(&self, client_id: Uuid) -> Result<Vec<ClientSecretVersion>> {
        let rows = sqlx::query(
            "SELECT * FROM client_secret_versions WHERE client_id = ?1 ORDER BY version DESC",
        )
        .bind(client_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("failed to list secret versions")?;

        rows.iter().map(secret_version_from_row).collect()
    }

    /// Secret versions that still verify at `now`: the active version plus
    /// any retired version inside its grace window
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn verifiable_secret_versions(
        &self,
        client_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClientSecretVersion>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM client_secret_versions
            WHERE client_id = ?1
              AND (retired_at IS NULL OR grace_until > ?2)
            ORDER BY version DESC
            ",
        )
        .bind(client_id.to_string())
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("failed to load verifiable secret versions")?;

        rows.iter().map(secret_version_from_row).collect()
    }

    /// Rotate a client secret: insert the new version, retire the prior
    /// active version with a grace window, and append the audit event, all
    /// in one transaction
    ///
    /// # Errors
    /// Returns an error on storage failure; nothing is persisted on error.
    pub async fn rotate_client_secret(
        &self,
        client_id: Uuid,
        new_secret_hash: &str,
        grace: chrono::Duration,
        actor: &str,
        reason: &str,
    ) -> Result<KeyRotationEvent> {
        let now = Utc::now();
        let new_secret_hash = new_secret_hash.to_owned();
        let actor = actor.to_owned();
        let reason = reason.to_owned();

        self.with_transaction(move |tx| {
            Box::pin(async move {
                let prior: Option<i64> = sqlx::query_scalar(
                    "SELECT MAX(version) FROM client_secret_versions WHERE client_id = ?1",
                )
                .bind(client_id.to_string())
                .fetch_one(&mut **tx)
                .await
                .context("failed to read current secret version")?;

                let old_version = prior.unwrap_or(0);
                let new_version = old_version + 1;
                let grace_until = now + grace;

                // Retire whatever is currently active
                sqlx::query(
                    r"
                    UPDATE client_secret_versions
                    SET retired_at = ?2, grace_until = ?3
                    WHERE client_id = ?1 AND retired_at IS NULL
                    ",
                )
                .bind(client_id.to_string())
                .bind(now)
                .bind(grace_until)
                .execute(&mut **tx)
                .await
                .context("failed to retire active secret version")?;

                sqlx::query(
                    r"
                    INSERT INTO client_secret_versions (id, client_id, version, secret_hash,
                                                        created_at, activated_at, retired_at, grace_until)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL)
                    ",
                )
                .bind(Uuid::now_v7().to_string())
                .bind(client_id.to_string())
                .bind(new_version)
                .bind(&new_secret_hash)
                .bind(now)
                .bind(now)
                .execute(&mut **tx)
                .await
                .context("failed to insert rotated secret version")?;

                let event = KeyRotationEvent {
                    id: Uuid::now_v7(),
                    key_id: client_id.to_string(),
                    old_version,
                    new_version,
                    reason,
                    actor,
                    created_at: now,
                };

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
                .execute(&mut **tx)
                .await
                .context("failed to append rotation audit event")?;

                Ok(event)
            })
        })
        .await
    }
}
