// ABOUTME: Delivery provider implementations for OTP codes and magic links
// ABOUTME: The default provider logs masked destinations; real gateways plug in behind the same trait
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use crate::audit;
use crate::errors::AppResult;
use crate::mfa::otp::DeliveryProvider;
use async_trait::async_trait;

/// Development/staging provider: records that a delivery happened without
/// sending anything
///
/// Message bodies are never logged; only masked destinations are.
pub struct LogDeliveryProvider;

#[async_trait]
impl DeliveryProvider for LogDeliveryProvider {
    async fn send_sms(&self, to: &str, _body: &str) -> AppResult<()> {
        tracing::info!(to = %audit::mask_phone(to), "SMS dispatched (log provider)");
        Ok(())
    }

    async fn send_email(&self, to: &str, subject: &str, _body: &str) -> AppResult<()> {
        tracing::info!(
            to = %audit::mask_email(to),
            subject = %subject,
            "email dispatched (log provider)"
        );
        Ok(())
    }

    async fn healthy(&self) -> bool {
        true
    }
}
