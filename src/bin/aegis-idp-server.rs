// ABOUTME: Server binary - wires configuration, storage, and subsystems, then serves HTTP
// ABOUTME: Spawns the cleanup scheduler alongside the listener and shuts down on SIGTERM/ctrl-c
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

#![allow(clippy::expect_used)]

use aegis_idp::cleanup::CleanupScheduler;
use aegis_idp::config::ServerConfig;
use aegis_idp::context::ServerResources;
use aegis_idp::delivery::LogDeliveryProvider;
use aegis_idp::{logging, routes};
use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use std::sync::Arc;

/// Resolve the externally-managed TOTP data key
///
/// Production deployments set `TOTP_MASTER_KEY` (base64, 32 bytes); without
/// it an ephemeral key is generated and enrollments will not survive a
/// restart.
fn totp_master_key() -> Result<Vec<u8>> {
    if let Ok(raw) = std::env::var("TOTP_MASTER_KEY") {
        let key = general_purpose::STANDARD
            .decode(raw.trim())
            .context("TOTP_MASTER_KEY is not valid base64")?;
        anyhow::ensure!(key.len() == 32, "TOTP_MASTER_KEY must decode to 32 bytes");
        return Ok(key);
    }

    tracing::warn!("TOTP_MASTER_KEY not set; using an ephemeral key (enrollments will not survive restart)");
    let mut key = vec![0u8; 32];
    use ring::rand::SecureRandom;
    ring::rand::SystemRandom::new()
        .fill(&mut key)
        .map_err(|_| anyhow::anyhow!("system RNG failure"))?;
    Ok(key)
}

/// Load mTLS trust anchors from the PEM bundle named by
/// `MTLS_TRUST_ANCHORS_FILE`, if configured
fn trust_anchors() -> Result<Vec<Vec<u8>>> {
    let Ok(path) = std::env::var("MTLS_TRUST_ANCHORS_FILE") else {
        return Ok(Vec::new());
    };
    let pem_bundle = std::fs::read(&path)
        .with_context(|| format!("cannot read trust anchor bundle {path}"))?;

    let mut anchors = Vec::new();
    for pem in x509_parser::pem::Pem::iter_from_buffer(&pem_bundle) {
        let pem = pem.context("malformed PEM in trust anchor bundle")?;
        anchors.push(pem.contents);
    }
    tracing::info!(count = anchors.len(), "loaded mTLS trust anchors");
    Ok(anchors)
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let config = ServerConfig::from_env().context("configuration failed to load")?;
    let http_port = config.http_port;
    let cleanup_interval = std::time::Duration::from_secs(config.cleanup.sweep_interval_secs);
    let cleanup_grace = chrono::Duration::seconds(config.cleanup.grace_secs);

    let resources = ServerResources::initialize(
        config,
        Arc::new(LogDeliveryProvider),
        &totp_master_key()?,
        trust_anchors()?,
    )
    .await
    .context("server initialization failed")?;

    let scheduler = CleanupScheduler::new(
        resources.database.clone(),
        cleanup_interval,
        cleanup_grace,
    );
    let cleanup_handle = scheduler.spawn();

    let app = routes::build_router(Arc::clone(&resources));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", http_port))
        .await
        .with_context(|| format!("cannot bind port {http_port}"))?;

    tracing::info!(
        port = http_port,
        issuer = %resources.config.issuer_url,
        "aegis-idp-server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    cleanup_handle.abort();
    Ok(())
}
