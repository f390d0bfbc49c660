// ABOUTME: Logging configuration and structured logging setup for observability
// ABOUTME: Configures tracing-subscriber with env-filter and json/pretty output
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

//! Structured logging configuration

use std::env;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for log records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Machine-readable JSON lines
    Json,
    /// Human-readable output for development
    Pretty,
}

impl LogFormat {
    /// Parse from configuration with a development-friendly fallback
    #[must_use]
    pub fn from_env() -> Self {
        match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Initialize the global tracing subscriber
///
/// `RUST_LOG` controls filtering; the default keeps the crate at `info`
/// and quiets noisy dependencies. Safe to call once per process; later
/// calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,hyper=warn,reqwest=warn"));

    let registry = tracing_subscriber::registry().with(filter);

    match LogFormat::from_env() {
        LogFormat::Json => {
            let _ = registry
                .with(tracing_subscriber::fmt::layer().json().with_target(true))
                .try_init();
        }
        LogFormat::Pretty => {
            let _ = registry
                .with(tracing_subscriber::fmt::layer().compact().with_target(true))
                .try_init();
        }
    }
}
