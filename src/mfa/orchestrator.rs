// ABOUTME: Adaptive authentication orchestrator - risk scoring, policy mapping, and MFA chain execution
// ABOUTME: Policy snapshots hot-reload via atomic pointer swap; required assurance may grow mid-chain, never shrink
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

//! Adaptive authentication
//!
//! Risk is a weighted sum over pluggable feature extractors, clamped to
//! [0, 1]. Policy maps the score to a required [`AssuranceLevel`]
//! (thresholds 0.33 / 0.66 by default, per-client overridable). The chain
//! executor drives factors in order with per-factor timeouts, raising the
//! session's achieved assurance monotonically and re-evaluating risk
//! between factors.

use crate::errors::{AppError, AppResult, ErrorCode};
use crate::models::AssuranceLevel;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Risk thresholds mapping score to required assurance
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Thresholds {
    /// Scores at or above this require one additional factor
    pub basic_mfa: f64,
    /// Scores at or above this require a strong factor
    pub strong_mfa: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            basic_mfa: 0.33,
            strong_mfa: 0.66,
        }
    }
}

/// Orchestrator policy, loaded from YAML and swapped atomically on reload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorPolicy {
    /// Weight per feature extractor name; unlisted extractors weigh 1.0
    #[serde(default)]
    pub weights: HashMap<String, f64>,
    /// Default thresholds
    #[serde(default)]
    pub thresholds: Thresholds,
    /// Per-client threshold overrides, keyed by public client id
    #[serde(default)]
    pub client_overrides: HashMap<String, Thresholds>,
}

impl Default for OrchestratorPolicy {
    fn default() -> Self {
        // A single cold signal (new device on a clean account in daytime)
        // stays below the basic-MFA threshold; repeated failures dominate
        let mut weights = HashMap::new();
        weights.insert("unknown_device".to_owned(), 0.5);
        weights.insert("off_hours".to_owned(), 0.5);
        weights.insert("failure_history".to_owned(), 2.0);

        Self {
            weights,
            thresholds: Thresholds::default(),
            client_overrides: HashMap::new(),
        }
    }
}

impl OrchestratorPolicy {
    fn thresholds_for(&self, client_id: &str) -> Thresholds {
        self.client_overrides
            .get(client_id)
            .copied()
            .unwrap_or(self.thresholds)
    }
}

/// Policy holder with hot reload
///
/// Readers capture the pointer once per request; a reload mid-request is
/// invisible to that request.
pub struct PolicyStore {
    current: ArcSwap<OrchestratorPolicy>,
    path: Option<PathBuf>,
}

impl PolicyStore {
    /// Create a store around an in-memory policy
    #[must_use]
    pub fn new(policy: OrchestratorPolicy) -> Self {
        Self {
            current: ArcSwap::from_pointee(policy),
            path: None,
        }
    }

    /// Load the initial policy from a YAML file
    ///
    /// # Errors
    /// Returns an error if the file is unreadable or not valid policy YAML.
    pub fn from_file(path: PathBuf) -> AppResult<Self> {
        let policy = Self::read_policy(&path)?;
        Ok(Self {
            current: ArcSwap::from_pointee(policy),
            path: Some(path),
        })
    }

    fn read_policy(path: &PathBuf) -> AppResult<OrchestratorPolicy> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AppError::config(format!("cannot read policy file: {e}")))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| AppError::config(format!("policy file is not valid YAML: {e}")))
    }

    /// Re-read the policy file and swap it in atomically
    ///
    /// A parse failure leaves the previous snapshot untouched; there is no
    /// partially observed mid-reload state.
    ///
    /// # Errors
    /// Returns an error if the store has no file or the file is invalid.
    pub fn reload(&self) -> AppResult<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| AppError::config("policy store has no backing file"))?;
        let policy = Self::read_policy(path)?;
        self.current.store(Arc::new(policy));
        tracing::info!("orchestrator policy reloaded");
        Ok(())
    }

    /// Capture the current snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<OrchestratorPolicy> {
        self.current.load_full()
    }

    /// Swap in a new policy directly (tests and admin tooling)
    pub fn store(&self, policy: OrchestratorPolicy) {
        self.current.store(Arc::new(policy));
    }
}

/// Request context the extractors score over
#[derive(Debug, Clone)]
pub struct RiskContext {
    /// Subject, once known
    pub user_id: Option<Uuid>,
    /// Public client id
    pub client_id: String,
    /// Client IP
    pub ip: Option<String>,
    /// Digest of the user agent string
    pub user_agent_digest: Option<String>,
    /// Local hour of day, 0-23
    pub hour_of_day: u32,
    /// Whether the device/user-agent pair has been seen for this subject
    pub known_device: bool,
    /// Recent failed authentication attempts for this subject
    pub recent_failures: u32,
}

/// One pluggable risk feature
pub trait FeatureExtractor: Send + Sync {
    /// Stable name, used for weight lookup and reporting
    fn name(&self) -> &'static str;
    /// Raw feature score in [0, 1]
    fn score(&self, ctx: &RiskContext) -> f64;
}

/// Unrecognized device or user agent
struct UnknownDevice;

impl FeatureExtractor for UnknownDevice {
    fn name(&self) -> &'static str {
        "unknown_device"
    }

    fn score(&self, ctx: &RiskContext) -> f64 {
        if ctx.known_device {
            0.0
        } else {
            1.0
        }
    }
}

/// Sign-in outside usual hours
struct OffHours;

impl FeatureExtractor for OffHours {
    fn name(&self) -> &'static str {
        "off_hours"
    }

    fn score(&self, ctx: &RiskContext) -> f64 {
        if (6..22).contains(&ctx.hour_of_day) {
            0.0
        } else {
            1.0
        }
    }
}

/// Recent failed attempts against the subject
struct FailureHistory;

impl FeatureExtractor for FailureHistory {
    fn name(&self) -> &'static str {
        "failure_history"
    }

    fn score(&self, ctx: &RiskContext) -> f64 {
        (f64::from(ctx.recent_failures) / 3.0).min(1.0)
    }
}

/// One scored feature in an assessment
#[derive(Debug, Clone, Serialize)]
pub struct RiskFactor {
    /// Extractor name
    pub name: String,
    /// Raw score in [0, 1]
    pub raw: f64,
    /// Weight applied
    pub weight: f64,
}

/// Result of a risk evaluation
#[derive(Debug, Clone)]
pub struct RiskAssessment {
    /// Weighted score in [0, 1]
    pub score: f64,
    /// Contributing factors
    pub factors: Vec<RiskFactor>,
    /// Assurance the policy requires at this score
    pub required: AssuranceLevel,
}

/// One executable authentication factor in a chain
#[async_trait]
pub trait ChainFactor: Send + Sync {
    /// Factor name for errors and logging
    fn name(&self) -> &'static str;
    /// Whether a human is in the loop (longer timeout)
    fn interactive(&self) -> bool;
    /// Assurance granted on success
    fn grants(&self) -> AssuranceLevel;
    /// Run the factor to completion
    async fn execute(&self, ctx: &RiskContext) -> AppResult<()>;
}

/// Adaptive authentication orchestrator
pub struct Orchestrator {
    policy: Arc<PolicyStore>,
    extractors: Vec<Box<dyn FeatureExtractor>>,
    interactive_timeout: Duration,
    non_interactive_timeout: Duration,
}

impl Orchestrator {
    /// Create an orchestrator with the built-in extractors
    #[must_use]
    pub fn new(
        policy: Arc<PolicyStore>,
        interactive_timeout: Duration,
        non_interactive_timeout: Duration,
    ) -> Self {
        Self {
            policy,
            extractors: vec![
                Box::new(UnknownDevice),
                Box::new(OffHours),
                Box::new(FailureHistory),
            ],
            interactive_timeout,
            non_interactive_timeout,
        }
    }

    /// Register an additional feature extractor
    pub fn register_extractor(&mut self, extractor: Box<dyn FeatureExtractor>) {
        self.extractors.push(extractor);
    }

    /// Evaluate risk for a context against the current policy snapshot
    #[must_use]
    pub fn evaluate(&self, ctx: &RiskContext) -> RiskAssessment {
        let policy = self.policy.snapshot();

        let mut factors = Vec::with_capacity(self.extractors.len());
        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;

        for extractor in &self.extractors {
            let raw = extractor.score(ctx).clamp(0.0, 1.0);
            let weight = policy
                .weights
                .get(extractor.name())
                .copied()
                .unwrap_or(1.0)
                .max(0.0);
            weighted_sum += raw * weight;
            total_weight += weight;
            factors.push(RiskFactor {
                name: extractor.name().to_owned(),
                raw,
                weight,
            });
        }

        let score = if total_weight > 0.0 {
            (weighted_sum / total_weight).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let thresholds = policy.thresholds_for(&ctx.client_id);
        let required = if score < thresholds.basic_mfa {
            AssuranceLevel::Password
        } else if score < thresholds.strong_mfa {
            AssuranceLevel::BasicMfa
        } else {
            AssuranceLevel::StrongMfa
        };

        RiskAssessment {
            score,
            factors,
            required,
        }
    }

    /// Execute a factor chain until the required assurance is met
    ///
    /// Factors run in order with per-factor timeouts. A success raises
    /// `achieved` monotonically; risk is re-evaluated between factors and
    /// the requirement may grow mid-chain but never shrink. A timeout
    /// cancels the chain, leaving partial state for the cleanup scheduler.
    ///
    /// # Errors
    /// The failing factor's error, `Cancelled` on timeout, or
    /// `AccessDenied` when the chain ends below the requirement.
    pub async fn run_chain(
        &self,
        ctx: &RiskContext,
        mut achieved: AssuranceLevel,
        factors: &[Box<dyn ChainFactor>],
    ) -> AppResult<AssuranceLevel> {
        let mut required = self.evaluate(ctx).required;
        if achieved >= required {
            return Ok(achieved);
        }

        for factor in factors {
            let timeout = if factor.interactive() {
                self.interactive_timeout
            } else {
                self.non_interactive_timeout
            };

            match tokio::time::timeout(timeout, factor.execute(ctx)).await {
                Ok(Ok(())) => {
                    achieved = achieved.max(factor.grants());
                }
                Ok(Err(error)) => return Err(error),
                Err(_) => {
                    return Err(AppError::new(
                        ErrorCode::Cancelled,
                        format!("factor '{}' timed out", factor.name()),
                    ));
                }
            }

            // The session is now partially bound; the requirement may grow
            required = required.max(self.evaluate(ctx).required);
            if achieved >= required {
                return Ok(achieved);
            }
        }

        if achieved >= required {
            Ok(achieved)
        } else {
            Err(AppError::new(
                ErrorCode::AccessDenied,
                "authentication chain exhausted below required assurance",
            ))
        }
    }
}
