// ABOUTME: Bulk deletion of expired rows, one target per call for failure isolation
// ABOUTME: The cleanup scheduler drives these; each returns its deleted-row count
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use super::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

/// Cleanup targets, one per owned-entity table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepTarget {
    /// Expired authorization requests (consumed or not)
    AuthorizationRequests,
    /// Expired access tokens
    AccessTokens,
    /// Expired refresh tokens
    RefreshTokens,
    /// Sessions past their idle or absolute expiry
    Sessions,
    /// Consumed, failed, or expired authentication challenges
    Challenges,
    /// Expired consent decisions
    ConsentDecisions,
}

impl SweepTarget {
    /// All targets in sweep order
    pub const ALL: [Self; 6] = [
        Self::AuthorizationRequests,
        Self::AccessTokens,
        Self::RefreshTokens,
        Self::Sessions,
        Self::Challenges,
        Self::ConsentDecisions,
    ];

    /// Metric label for this target
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthorizationRequests => "authorization_requests",
            Self::AccessTokens => "access_tokens",
            Self::RefreshTokens => "refresh_tokens",
            Self::Sessions => "sessions",
            Self::Challenges => "challenges",
            Self::ConsentDecisions => "consent_decisions",
        }
    }
}

impl Database {
    /// Bulk-delete rows of `target` that expired before `cutoff`
    ///
    /// # Errors
    /// Returns an error on storage failure; other targets are unaffected.
    pub async fn bulk_delete_expired_before(
        &self,
        target: SweepTarget,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let query = match target {
            SweepTarget::AuthorizationRequests => {
                "DELETE FROM authorization_requests WHERE expires_at < ?1"
            }
            SweepTarget::AccessTokens => "DELETE FROM access_tokens WHERE expires_at < ?1",
            SweepTarget::RefreshTokens => "DELETE FROM refresh_tokens WHERE expires_at < ?1",
            SweepTarget::Sessions => {
                "DELETE FROM sessions WHERE idle_expires_at < ?1 OR absolute_expires_at < ?1"
            }
            SweepTarget::Challenges => {
                "DELETE FROM authentication_challenges WHERE consumed = 1 OR failed = 1 OR expires_at < ?1"
            }
            SweepTarget::ConsentDecisions => "DELETE FROM consent_decisions WHERE expires_at < ?1",
        };

        let result = sqlx::query(query)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .with_context(|| format!("bulk delete failed for {}", target.as_str()))?;

        Ok(result.rows_affected())
    }
}
