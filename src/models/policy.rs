//! Request policies — the constraints that gate eligibility and ranking.

use serde::{Deserialize, Serialize};

use crate::{GatewayError, Result};

pub const MAX_BUDGET_USD: f64 = 100.0;
pub const MAX_LATENCY_MS: u64 = 300_000;
pub const MAX_WEIGHT: f64 = 10.0;

/// Routing mode for a single request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RouteMode {
    /// Mode left unset; ranked as [`RouteMode::Normal`].
    #[default]
    #[serde(rename = "")]
    Unspecified,
    Cheap,
    Normal,
    HighConfidence,
    Planning,
    Adversarial,
    Thompson,
}

impl RouteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteMode::Unspecified => "",
            RouteMode::Cheap => "cheap",
            RouteMode::Normal => "normal",
            RouteMode::HighConfidence => "high_confidence",
            RouteMode::Planning => "planning",
            RouteMode::Adversarial => "adversarial",
            RouteMode::Thompson => "thompson",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "" => Ok(RouteMode::Unspecified),
            "cheap" => Ok(RouteMode::Cheap),
            "normal" => Ok(RouteMode::Normal),
            "high_confidence" => Ok(RouteMode::HighConfidence),
            "planning" => Ok(RouteMode::Planning),
            "adversarial" => Ok(RouteMode::Adversarial),
            "thompson" => Ok(RouteMode::Thompson),
            other => Err(GatewayError::InvalidRequest(format!(
                "unknown routing mode: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for RouteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully resolved per-request policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    pub mode: RouteMode,
    /// 0.0 means no budget constraint.
    pub max_budget_usd: f64,
    /// 0 means no deadline.
    pub max_latency_ms: u64,
    pub min_weight: f64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            mode: RouteMode::Unspecified,
            max_budget_usd: 0.0,
            max_latency_ms: 0,
            min_weight: 0.0,
        }
    }
}

impl Policy {
    /// The mode actually used for ranking: `Unspecified` ranks as `Normal`.
    pub fn effective_mode(&self) -> RouteMode {
        match self.mode {
            RouteMode::Unspecified => RouteMode::Normal,
            m => m,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=MAX_BUDGET_USD).contains(&self.max_budget_usd) {
            return Err(GatewayError::InvalidRequest(format!(
                "max_budget_usd {} outside [0, {}]",
                self.max_budget_usd, MAX_BUDGET_USD
            )));
        }
        if self.max_latency_ms > MAX_LATENCY_MS {
            return Err(GatewayError::InvalidRequest(format!(
                "max_latency_ms {} outside [0, {}]",
                self.max_latency_ms, MAX_LATENCY_MS
            )));
        }
        if !(0.0..=MAX_WEIGHT).contains(&self.min_weight) {
            return Err(GatewayError::InvalidRequest(format!(
                "min_weight {} outside [0, {}]",
                self.min_weight, MAX_WEIGHT
            )));
        }
        Ok(())
    }
}

/// Side-channel policy hint from the request envelope. Every field is
/// optional; present fields override configured defaults and are in turn
/// overridden by in-band directives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyHint {
    pub mode: Option<RouteMode>,
    pub max_budget_usd: Option<f64>,
    pub max_latency_ms: Option<u64>,
    pub min_weight: Option<f64>,
}

impl PolicyHint {
    pub fn apply(&self, policy: &mut Policy) {
        if let Some(mode) = self.mode {
            policy.mode = mode;
        }
        if let Some(budget) = self.max_budget_usd {
            policy.max_budget_usd = budget;
        }
        if let Some(latency) = self.max_latency_ms {
            policy.max_latency_ms = latency;
        }
        if let Some(weight) = self.min_weight {
            policy.min_weight = weight;
        }
    }
}
