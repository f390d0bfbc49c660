// ABOUTME: Sliding-window rate limiting for credential verification attempts
// ABOUTME: Fixed-size windows partitioned by key behind a per-key lock; subject and IP windows are independent
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Attempt admitted and recorded
    Allowed,
    /// Window full; retry after the embedded number of seconds
    Limited {
        /// Seconds until the oldest recorded attempt leaves the window
        retry_after_secs: u64,
    },
}

/// A sliding-window limiter partitioned by string key
///
/// Each key owns a small bounded deque of attempt instants; the dashmap
/// shard lock doubles as the per-key lock and is never held across awaits.
pub struct SlidingWindowLimiter {
    max_attempts: u32,
    window: Duration,
    windows: DashMap<String, VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    /// Create a limiter admitting `max_attempts` per `window` per key
    #[must_use]
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            windows: DashMap::new(),
        }
    }

    /// Check and record one attempt for `key`
    ///
    /// Pruning is lazy: expired instants are dropped on the next check for
    /// the same key.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_owned()).or_default();

        while let Some(front) = entry.front() {
            if now.duration_since(*front) >= self.window {
                entry.pop_front();
            } else {
                break;
            }
        }

        if entry.len() >= self.max_attempts as usize {
            let retry_after = entry
                .front()
                .map_or(self.window, |oldest| {
                    self.window.saturating_sub(now.duration_since(*oldest))
                })
                .as_secs()
                .max(1);
            return RateLimitDecision::Limited {
                retry_after_secs: retry_after,
            };
        }

        entry.push_back(now);
        RateLimitDecision::Allowed
    }

    /// Drop every window; test hook and operator reset
    pub fn clear(&self) {
        self.windows.clear();
    }
}
