// ABOUTME: Credential store over SQLite via sqlx with typed per-domain repositories
// ABOUTME: Single serialization point for concurrent writers; transactions and per-row compare-and-set
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

//! # Credential store
//!
//! All mutation of owned entities flows through [`Database`]. State
//! transitions are single `UPDATE ... WHERE <predecessor-state> RETURNING`
//! statements so concurrent writers serialize on the row, and multi-table
//! sequences run inside [`Database::with_transaction`]. Strong
//! serializability is not required; hotspot reads take no locks and updates
//! carry a version counter for compare-and-set.

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool, Transaction};
use std::str::FromStr;
use uuid::Uuid;

mod audit;
mod challenges;
mod cleanup;
mod clients;
mod consents;
mod requests;
mod sessions;
mod tokens;
mod users;
mod webauthn;

pub use cleanup::SweepTarget;
pub use tokens::{CodeRedemption, RefreshRotation, TokenSpec};

/// Bounded retries for conditional updates that lose a compare-and-set race
pub const CAS_MAX_RETRIES: u32 = 3;

/// Database handle wrapping a SQLite connection pool
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to the database and prepare the pool
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the pool cannot be created.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("invalid database URL")?
            .create_if_missing(true)
            .foreign_keys(true);

        // An in-memory database exists per connection; a wider pool would
        // hand each caller a different empty database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("failed to open database pool")?;

        Ok(Self { pool })
    }

    /// Access the underlying pool
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the schema; idempotent
    ///
    /// # Errors
    /// Returns an error if any DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("migration statement failed: {statement}"))?;
        }
        Ok(())
    }

    /// Run `op` inside a transaction, committing on `Ok` and rolling back on `Err`
    ///
    /// Nesting is forbidden; callers must not invoke `with_transaction` from
    /// inside `op`.
    ///
    /// # Errors
    /// Propagates the operation's error after rollback, or the commit error.
    pub async fn with_transaction<T, F>(&self, op: F) -> Result<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Transaction<'static, sqlx::Sqlite>) -> BoxFuture<'t, Result<T>>
            + Send,
    {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        match op(&mut tx).await {
            Ok(value) => {
                tx.commit().await.context("failed to commit transaction")?;
                Ok(value)
            }
            Err(error) => {
                // Rollback failure is secondary to the original error
                let _ = tx.rollback().await;
                Err(error)
            }
        }
    }
}

/// Parse a UUID column stored as text
pub(crate) fn row_uuid(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Uuid> {
    let raw: String = row.try_get(column)?;
    Uuid::parse_str(&raw).with_context(|| format!("invalid UUID in column {column}"))
}

/// Parse a nullable UUID column stored as text
pub(crate) fn row_uuid_opt(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Option<Uuid>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| Uuid::parse_str(&s).with_context(|| format!("invalid UUID in column {column}")))
        .transpose()
}

/// Parse a JSON-array column of strings
pub(crate) fn row_string_vec(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Vec<String>> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON array in column {column}"))
}

/// Idempotent schema; every statement is `IF NOT EXISTS`
const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        display_name TEXT,
        email TEXT UNIQUE,
        password_hash TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        totp_secret_enc TEXT,
        otp_phone TEXT,
        created_at TIMESTAMP NOT NULL,
        updated_at TIMESTAMP NOT NULL
    )",
    r"
    CREATE TABLE IF NOT EXISTS clients (
        id TEXT PRIMARY KEY,
        client_id TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        grant_types TEXT NOT NULL,
        response_types TEXT NOT NULL,
        redirect_uris TEXT NOT NULL,
        allowed_scopes TEXT NOT NULL,
        auth_method TEXT NOT NULL,
        require_pkce INTEGER NOT NULL DEFAULT 1,
        access_token_secs INTEGER NOT NULL,
        refresh_token_secs INTEGER NOT NULL,
        id_token_secs INTEGER NOT NULL,
        mtls_fingerprint TEXT,
        assertion_jwks TEXT,
        created_at TIMESTAMP NOT NULL
    )",
    r"
    CREATE TABLE IF NOT EXISTS client_secret_versions (
        id TEXT PRIMARY KEY,
        client_id TEXT NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
        version INTEGER NOT NULL,
        secret_hash TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL,
        activated_at TIMESTAMP NOT NULL,
        retired_at TIMESTAMP,
        grace_until TIMESTAMP,
        UNIQUE (client_id, version)
    )",
    r"
    CREATE TABLE IF NOT EXISTS authorization_requests (
        id TEXT PRIMARY KEY,
        client_id TEXT NOT NULL,
        redirect_uri TEXT NOT NULL,
        scope TEXT NOT NULL,
        state TEXT,
        code_challenge TEXT NOT NULL,
        code_challenge_method TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL,
        expires_at TIMESTAMP NOT NULL,
        consumed INTEGER NOT NULL DEFAULT 0,
        consumed_at TIMESTAMP,
        user_id TEXT,
        code TEXT UNIQUE,
        code_expires_at TIMESTAMP,
        family_id TEXT,
        row_version INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_authorization_requests_code ON authorization_requests(code)",
    "CREATE INDEX IF NOT EXISTS idx_authorization_requests_expires ON authorization_requests(expires_at)",
    r"
    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        token TEXT NOT NULL UNIQUE,
        csrf_token TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL,
        idle_expires_at TIMESTAMP NOT NULL,
        absolute_expires_at TIMESTAMP NOT NULL,
        assurance TEXT NOT NULL DEFAULT 'password',
        last_ip TEXT,
        last_user_agent TEXT,
        row_version INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id)",
    r"
    CREATE TABLE IF NOT EXISTS consent_decisions (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        client_id TEXT NOT NULL,
        scopes TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL,
        expires_at TIMESTAMP NOT NULL,
        UNIQUE (user_id, client_id)
    )",
    r"
    CREATE TABLE IF NOT EXISTS authentication_challenges (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        user_id TEXT,
        verifier_hash TEXT,
        webauthn_challenge TEXT,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TIMESTAMP NOT NULL,
        expires_at TIMESTAMP NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 3,
        consumed INTEGER NOT NULL DEFAULT 0,
        failed INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_challenges_webauthn ON authentication_challenges(webauthn_challenge)",
    "CREATE INDEX IF NOT EXISTS idx_challenges_expires ON authentication_challenges(expires_at)",
    r"
    CREATE TABLE IF NOT EXISTS access_tokens (
        jti TEXT PRIMARY KEY,
        user_id TEXT,
        client_id TEXT NOT NULL,
        scope TEXT NOT NULL,
        family_id TEXT NOT NULL,
        issued_at TIMESTAMP NOT NULL,
        expires_at TIMESTAMP NOT NULL,
        revoked INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_access_tokens_family ON access_tokens(family_id)",
    "CREATE INDEX IF NOT EXISTS idx_access_tokens_expires ON access_tokens(expires_at)",
    r"
    CREATE TABLE IF NOT EXISTS refresh_tokens (
        id TEXT PRIMARY KEY,
        token TEXT NOT NULL UNIQUE,
        user_id TEXT NOT NULL,
        client_id TEXT NOT NULL,
        scope TEXT NOT NULL,
        family_id TEXT NOT NULL,
        issued_at TIMESTAMP NOT NULL,
        expires_at TIMESTAMP NOT NULL,
        revoked INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_refresh_tokens_family ON refresh_tokens(family_id)",
    "CREATE INDEX IF NOT EXISTS idx_refresh_tokens_expires ON refresh_tokens(expires_at)",
    r"
    CREATE TABLE IF NOT EXISTS webauthn_credentials (
        credential_id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        public_key_cose BLOB NOT NULL,
        attestation_format TEXT NOT NULL,
        aaguid TEXT,
        sign_count INTEGER NOT NULL DEFAULT 0,
        state TEXT NOT NULL DEFAULT 'registered',
        label TEXT,
        created_at TIMESTAMP NOT NULL,
        last_used_at TIMESTAMP
    )",
    "CREATE INDEX IF NOT EXISTS idx_webauthn_credentials_user ON webauthn_credentials(user_id)",
    r"
    CREATE TABLE IF NOT EXISTS key_rotation_events (
        id TEXT PRIMARY KEY,
        key_id TEXT NOT NULL,
        old_version INTEGER NOT NULL,
        new_version INTEGER NOT NULL,
        reason TEXT NOT NULL,
        actor TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_key_rotation_events_key ON key_rotation_events(key_id)",
];
