// ABOUTME: Multi-factor authentication subsystem
// ABOUTME: OTP/magic-link, TOTP, WebAuthn verifiers, and the adaptive orchestrator that chains them
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

/// Adaptive risk-scored authentication orchestration
pub mod orchestrator;
/// OTP and magic-link challenge generation and verification
pub mod otp;
/// RFC 6238 TOTP validation and enrollment
pub mod totp;
/// WebAuthn registration and assertion ceremonies
pub mod webauthn;

pub use orchestrator::{Orchestrator, PolicyStore, RiskContext};
pub use otp::{DeliveryProvider, OtpAuthenticator};
pub use totp::{TotpSecretStore, TotpValidator};
pub use webauthn::WebAuthnAuthenticator;
