// ABOUTME: Configuration management for the identity platform
// ABOUTME: Environment-driven server configuration with typed sub-structs
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

/// Environment-based configuration management
pub mod environment;

pub use environment::ServerConfig;
