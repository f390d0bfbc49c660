// ABOUTME: Token repository - code redemption, refresh rotation, family revocation, introspection lookups
// ABOUTME: Redemption and rotation are single transactions; replay detection revokes the whole token family
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use super::requests::request_from_row;
use super::{row_uuid, row_uuid_opt, Database};
use crate::crypto;
use crate::models::{AccessTokenRecord, AuthorizationRequest, RefreshTokenRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use uuid::Uuid;

/// Scope value that gates refresh-token issuance
const OFFLINE_ACCESS_SCOPE: &str = "offline_access";

fn access_token_from_row(row: &SqliteRow) -> Result<AccessTokenRecord> {
    Ok(AccessTokenRecord {
        jti: row_uuid(row, "jti")?,
        user_id: row_uuid_opt(row, "user_id")?,
        client_id: row_uuid(row, "client_id")?,
        scope: row.try_get("scope")?,
        family_id: row_uuid(row, "family_id")?,
        issued_at: row.try_get("issued_at")?,
        expires_at: row.try_get("expires_at")?,
        revoked: row.try_get("revoked")?,
    })
}

fn refresh_token_from_row(row: &SqliteRow) -> Result<RefreshTokenRecord> {
    Ok(RefreshTokenRecord {
        id: row_uuid(row, "id")?,
        token: row.try_get("token")?,
        user_id: row_uuid(row, "user_id")?,
        client_id: row_uuid(row, "client_id")?,
        scope: row.try_get("scope")?,
        family_id: row_uuid(row, "family_id")?,
        issued_at: row.try_get("issued_at")?,
        expires_at: row.try_get("expires_at")?,
        revoked: row.try_get("revoked")?,
    })
}

async fn insert_access_token(
    tx: &mut Transaction<'static, Sqlite>,
    token: &AccessTokenRecord,
) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO access_tokens (jti, user_id, client_id, scope, family_id, issued_at, expires_at, revoked)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)
        ",
    )
    .bind(token.jti.to_string())
    .bind(token.user_id.map(|u| u.to_string()))
    .bind(token.client_id.to_string())
    .bind(&token.scope)
    .bind(token.family_id.to_string())
    .bind(token.issued_at)
    .bind(token.expires_at)
    .execute(&mut **tx)
    .await
    .context("failed to insert access token")?;

    Ok(())
}

async fn insert_refresh_token(
    tx: &mut Transaction<'static, Sqlite>,
    token: &RefreshTokenRecord,
) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO refresh_tokens (id, token, user_id, client_id, scope, family_id, issued_at, expires_at, revoked)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)
        ",
    )
    .bind(token.id.to_string())
    .bind(&token.token)
    .bind(token.user_id.to_string())
    .bind(token.client_id.to_string())
    .bind(&token.scope)
    .bind(token.family_id.to_string())
    .bind(token.issued_at)
    .bind(token.expires_at)
    .execute(&mut **tx)
    .await
    .context("failed to insert refresh token")?;

    Ok(())
}

async fn revoke_family_in_tx(tx: &mut Transaction<'static, Sqlite>, family_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE access_tokens SET revoked = 1 WHERE family_id = ?1")
        .bind(family_id.to_string())
        .execute(&mut **tx)
        .await
        .context("failed to revoke access token family")?;
    sqlx::query("UPDATE refresh_tokens SET revoked = 1 WHERE family_id = ?1")
        .bind(family_id.to_string())
        .execute(&mut **tx)
        .await
        .context("failed to revoke refresh token family")?;

    Ok(())
}

/// Pre-generated identifiers and lifetimes for the tokens a grant will mint
///
/// The subject and scope come from the consumed grant inside the
/// transaction; everything random is generated by the caller beforehand so
/// the transaction itself never blocks on the RNG.
#[derive(Debug, Clone)]
pub struct TokenSpec {
    /// `jti` for the access token
    pub access_jti: Uuid,
    /// Access token lifetime
    pub access_lifetime: Duration,
    /// Row id for the refresh token, when one may be issued
    pub refresh_id: Uuid,
    /// Opaque refresh token value, when one may be issued
    pub refresh_token: String,
    /// Refresh token lifetime
    pub refresh_lifetime: Duration,
}

/// Outcome of an authorization-code redemption attempt
#[derive(Debug)]
pub enum CodeRedemption {
    /// Exactly one concurrent redeemer wins and receives the tokens
    Success {
        /// The consumed request, user bound and PKCE verified
        request: AuthorizationRequest,
        /// The stored access token record
        access: AccessTokenRecord,
        /// The stored refresh token record, when `offline_access` was granted
        refresh: Option<RefreshTokenRecord>,
    },
    /// The code was already consumed; the token family it minted is now revoked
    Replayed {
        /// The family that was revoked, when the consumed code had minted one
        family_id: Option<Uuid>,
    },
    /// Not found, expired, client/redirect mismatch, or no bound user
    Rejected,
    /// The code was consumed just now but the PKCE verifier did not match;
    /// the consumption stands and no tokens exist
    PkceMismatch,
}

/// Outcome of a refresh-token rotation attempt
#[derive(Debug)]
pub enum RefreshRotation {
    /// Rotation succeeded; the presented token is revoked and replaced
    Rotated {
        /// The record of the token that was just consumed
        old: RefreshTokenRecord,
        /// The replacement access token record
        access: AccessTokenRecord,
        /// The replacement refresh token record
        refresh: RefreshTokenRecord,
    },
    /// The presented token was already revoked; its whole family is now revoked
    ReuseDetected {
        /// The revoked family
        family_id: Uuid,
    },
    /// Not found, expired, or client mismatch
    Rejected,
}

impl Database {
    /// Redeem an authorization code: consume the request, verify PKCE, and
    /// issue the replacement tokens, all inside one transaction
    ///
    /// The conditional `UPDATE ... WHERE consumed = 0` serializes concurrent
    /// redemptions of the same code; exactly one succeeds. Replay of a
    /// consumed code revokes every token in the family it minted. A PKCE
    /// mismatch commits the consumption (the code is burned) but issues
    /// nothing. A refresh token is stored only when the granted scope
    /// contains `offline_access`.
    ///
    /// # Errors
    /// Returns an error on storage failure; the transaction rolls back.
    pub async fn redeem_authorization_code(
        &self,
        code: &str,
        client_id: Uuid,
        redirect_uri: &str,
        code_verifier: &str,
        now: DateTime<Utc>,
        spec: TokenSpec,
    ) -> Result<CodeRedemption> {
        let code = code.to_owned();
        let redirect_uri = redirect_uri.to_owned();
        let code_verifier = code_verifier.to_owned();
        let family_id = Uuid::now_v7();

        self.with_transaction(move |tx| {
            Box::pin(async move {
                let row = sqlx::query(
                    r"
                    UPDATE authorization_requests
                    SET consumed = 1, consumed_at = ?4, family_id = ?5, row_version = row_version + 1
                    WHERE code = ?1
                      AND client_id = ?2
                      AND redirect_uri = ?3
                      AND consumed = 0
                      AND user_id IS NOT NULL
                      AND code_expires_at > ?4
                    RETURNING *
                    ",
                )
                .bind(&code)
                .bind(client_id.to_string())
                .bind(&redirect_uri)
                .bind(now)
                .bind(family_id.to_string())
                .fetch_optional(&mut **tx)
                .await
                .context("failed to atomically consume authorization code")?;

                let Some(row) = row else {
                    // Distinguish replay from plain rejection: a consumed row
                    // with this code means double redemption
                    let consumed = sqlx::query(
                        "SELECT family_id FROM authorization_requests WHERE code = ?1 AND consumed = 1",
                    )
                    .bind(&code)
                    .fetch_optional(&mut **tx)
                    .await
                    .context("failed to check for code replay")?;

                    if let Some(consumed_row) = consumed {
                        let minted_family = row_uuid_opt(&consumed_row, "family_id")?;
                        if let Some(minted_family) = minted_family {
                            revoke_family_in_tx(tx, minted_family).await?;
                        }
                        return Ok(CodeRedemption::Replayed {
                            family_id: minted_family,
                        });
                    }
                    return Ok(CodeRedemption::Rejected);
                };

                let request = request_from_row(&row)?;

                // PKCE after consumption: a failed verifier burns the code
                // instead of leaving it open to retry
                if crypto::validate_verifier(&code_verifier).is_err()
                    || !crypto::verify_s256(&code_verifier, &request.code_challenge)
                {
                    return Ok(CodeRedemption::PkceMismatch);
                }

                let user_id = request
                    .user_id
                    .context("consumed request row lost its user binding")?;

                let access = AccessTokenRecord {
                    jti: spec.access_jti,
                    user_id: Some(user_id),
                    client_id,
                    scope: request.scope.clone(),
                    family_id,
                    issued_at: now,
                    expires_at: now + spec.access_lifetime,
                    revoked: false,
                };
                insert_access_token(tx, &access).await?;

                let refresh = if request
                    .scope
                    .split(' ')
                    .any(|s| s == OFFLINE_ACCESS_SCOPE)
                {
                    let refresh = RefreshTokenRecord {
                        id: spec.refresh_id,
                        token: spec.refresh_token.clone(),
                        user_id,
                        client_id,
                        scope: request.scope.clone(),
                        family_id,
                        issued_at: now,
                        expires_at: now + spec.refresh_lifetime,
                        revoked: false,
                    };
                    insert_refresh_token(tx, &refresh).await?;
                    Some(refresh)
                } else {
                    None
                };

                Ok(CodeRedemption::Success {
                    request,
                    access,
                    refresh,
                })
            })
        })
        .await
    }

    /// Issue tokens outside code redemption (client credentials grant)
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn issue_client_credentials_token(
        &self,
        access: AccessTokenRecord,
    ) -> Result<()> {
        self.with_transaction(move |tx| {
            Box::pin(async move { insert_access_token(tx, &access).await })
        })
        .await
    }

    /// Rotate a refresh token: revoke the presented token and issue its
    /// replacements in the same transaction
    ///
    /// The replacement refresh token stays in the presented token's family.
    /// Presenting an already-revoked token is misuse; the entire family
    /// descended from it is revoked before returning.
    ///
    /// # Errors
    /// Returns an error on storage failure; the transaction rolls back.
    pub async fn rotate_refresh_token(
        &self,
        presented: &str,
        client_id: Uuid,
        now: DateTime<Utc>,
        spec: TokenSpec,
    ) -> Result<RefreshRotation> {
        let presented = presented.to_owned();

        self.with_transaction(move |tx| {
            Box::pin(async move {
                let row = sqlx::query(
                    r"
                    UPDATE refresh_tokens
                    SET revoked = 1
                    WHERE token = ?1 AND client_id = ?2 AND revoked = 0 AND expires_at > ?3
                    RETURNING *
                    ",
                )
                .bind(&presented)
                .bind(client_id.to_string())
                .bind(now)
                .fetch_optional(&mut **tx)
                .await
                .context("failed to atomically consume refresh token")?;

                let Some(row) = row else {
                    let existing =
                        sqlx::query("SELECT family_id, revoked FROM refresh_tokens WHERE token = ?1")
                            .bind(&presented)
                            .fetch_optional(&mut **tx)
                            .await
                            .context("failed to check refresh token reuse")?;

                    if let Some(existing) = existing {
                        let revoked: bool = existing.try_get("revoked")?;
                        if revoked {
                            let family_id = row_uuid(&existing, "family_id")?;
                            revoke_family_in_tx(tx, family_id).await?;
                            return Ok(RefreshRotation::ReuseDetected { family_id });
                        }
                    }
                    return Ok(RefreshRotation::Rejected);
                };

                let old = refresh_token_from_row(&row)?;

                let access = AccessTokenRecord {
                    jti: spec.access_jti,
                    user_id: Some(old.user_id),
                    client_id,
                    scope: old.scope.clone(),
                    family_id: old.family_id,
                    issued_at: now,
                    expires_at: now + spec.access_lifetime,
                    revoked: false,
                };
                insert_access_token(tx, &access).await?;

                let refresh = RefreshTokenRecord {
                    id: spec.refresh_id,
                    token: spec.refresh_token.clone(),
                    user_id: old.user_id,
                    client_id,
                    scope: old.scope.clone(),
                    family_id: old.family_id,
                    issued_at: now,
                    expires_at: now + spec.refresh_lifetime,
                    revoked: false,
                };
                insert_refresh_token(tx, &refresh).await?;

                Ok(RefreshRotation::Rotated {
                    old,
                    access,
                    refresh,
                })
            })
        })
        .await
    }

    /// Look up an access token record by its `jti`
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn get_access_token(&self, jti: Uuid) -> Result<Option<AccessTokenRecord>> {
        let row = sqlx::query("SELECT * FROM access_tokens WHERE jti = ?1")
            .bind(jti.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("failed to get access token")?;

        row.as_ref().map(access_token_from_row).transpose()
    }

    /// Look up a refresh token record by its opaque value
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn get_refresh_token(&self, token: &str) -> Result<Option<RefreshTokenRecord>> {
        let row = sqlx::query("SELECT * FROM refresh_tokens WHERE token = ?1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .context("failed to get refresh token")?;

        row.as_ref().map(refresh_token_from_row).transpose()
    }

    /// Revoke a single access token by `jti`
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn revoke_access_token(&self, jti: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE access_tokens SET revoked = 1 WHERE jti = ?1")
            .bind(jti.to_string())
            .execute(&self.pool)
            .await
            .context("failed to revoke access token")?;

        Ok(result.rows_affected() > 0)
    }

    /// Revoke every token (access and refresh) in a family, in one transaction
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn revoke_token_family(&self, family_id: Uuid) -> Result<()> {
        self.with_transaction(move |tx| {
            Box::pin(async move { revoke_family_in_tx(tx, family_id).await })
        })
        .await
    }

    /// Revoke all tokens belonging to a user (logout)
    ///
    /// # Errors
    /// Returns an error on storage failure.
    pub async fn revoke_tokens_for_user(&self, user_id: Uuid) -> Result<()> {
        self.with_transaction(move |tx| {
            Box::pin(async move {
                sqlx::query("UPDATE access_tokens SET revoked = 1 WHERE user_id = ?1")
                    .bind(user_id.to_string())
                    .execute(&mut **tx)
                    .await
                    .context("failed to revoke user access tokens")?;
                sqlx::query("UPDATE refresh_tokens SET revoked = 1 WHERE user_id = ?1")
                    .bind(user_id.to_string())
                    .execute(&mut **tx)
                    .await
                    .context("failed to revoke user refresh tokens")?;
                Ok(())
            })
        })
        .await
    }
}
