//! Engine configuration types.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};

/// Main engine configuration.
///
/// Every transaction created from an [`crate::engine::Engine`] carries a copy
/// of this configuration, so changing it never affects transactions already
/// in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum request body size to buffer (bytes).
    #[serde(default = "default_request_body_limit")]
    pub request_body_limit: usize,

    /// Maximum response body size to buffer (bytes).
    #[serde(default = "default_response_body_limit")]
    pub response_body_limit: usize,

    /// What to do when a body buffer cap is hit.
    #[serde(default)]
    pub body_limit_action: BodyLimitAction,

    /// Upper bound on rule evaluation steps per phase, guarding against
    /// pathological `skip-to` loops.
    #[serde(default = "default_evaluation_step_cap")]
    pub evaluation_step_cap: usize,

    /// Whether to dispatch an audit event at the logging phase.
    #[serde(default = "default_true")]
    pub audit_enabled: bool,
}

fn default_request_body_limit() -> usize {
    1024 * 1024 // 1MB
}

fn default_response_body_limit() -> usize {
    512 * 1024
}

fn default_evaluation_step_cap() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_body_limit: default_request_body_limit(),
            response_body_limit: default_response_body_limit(),
            body_limit_action: BodyLimitAction::default(),
            evaluation_step_cap: default_evaluation_step_cap(),
            audit_enabled: true,
        }
    }
}

impl EngineConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(raw: &str) -> EngineResult<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field constraints.
    pub fn validate(&self) -> EngineResult<()> {
        if self.evaluation_step_cap == 0 {
            return Err(EngineError::Config(
                "evaluation_step_cap must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Policy applied when a body buffer cap is hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyLimitAction {
    /// Keep the bytes accumulated so far and report the overflow to the caller.
    #[default]
    Reject,
    /// Keep the bytes accumulated so far and silently drop the rest, leaving
    /// the truncated buffer available for processing.
    ProcessPartial,
}
