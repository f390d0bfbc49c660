// ABOUTME: Periodic cleanup scheduler deleting expired codes, tokens, sessions, and challenges
// ABOUTME: Targets are swept independently; one failing target never aborts the sweep
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

//! Cleanup scheduler
//!
//! Every sweep visits each target with `bulk_delete_expired_before(now -
//! grace)`. The small grace keeps rows around briefly past expiry so
//! in-flight requests referencing them fail with their real error instead
//! of a phantom not-found.

use crate::database::{Database, SweepTarget};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use tokio::task::JoinHandle;

/// Counts (or errors) from one sweep, per target
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Deleted-row count per target; failed targets are absent and logged
    pub deleted: HashMap<&'static str, u64>,
    /// Targets whose deletion failed this sweep
    pub failed: Vec<&'static str>,
}

/// Periodic cleanup scheduler
pub struct CleanupScheduler {
    database: Database,
    interval: std::time::Duration,
    grace: Duration,
}

impl CleanupScheduler {
    /// Create a scheduler
    #[must_use]
    pub const fn new(database: Database, interval: std::time::Duration, grace: Duration) -> Self {
        Self {
            database,
            interval,
            grace,
        }
    }

    /// Run one sweep over every target, isolating failures
    pub async fn run_sweep(&self) -> SweepReport {
        let cutoff = Utc::now() - self.grace;
        let mut report = SweepReport::default();

        for target in SweepTarget::ALL {
            match self
                .database
                .bulk_delete_expired_before(target, cutoff)
                .await
            {
                Ok(count) => {
                    if count > 0 {
                        tracing::info!(
                            target_table = target.as_str(),
                            deleted = count,
                            "cleanup sweep deleted expired rows"
                        );
                    }
                    report.deleted.insert(target.as_str(), count);
                }
                Err(e) => {
                    tracing::error!(
                        target_table = target.as_str(),
                        "cleanup sweep failed for target: {e:#}"
                    );
                    report.failed.push(target.as_str());
                }
            }
        }

        report
    }

    /// Spawn the periodic sweep loop
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup isn't
            // spent sweeping an empty database
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let report = self.run_sweep().await;
                tracing::debug!(
                    targets = report.deleted.len(),
                    failed = report.failed.len(),
                    "cleanup sweep finished"
                );
            }
        })
    }
}
