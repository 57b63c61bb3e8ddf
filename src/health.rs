//! Health prober — per-provider probe state feeding model eligibility.
//!
//! Each registered provider is a target with a small state machine:
//! `unknown → healthy ⇄ degraded → unhealthy → removed`. Transitions are
//! driven by periodic adapter probes and by real-request outcomes.
//! `unhealthy` targets are excluded from selection until one probe
//! succeeds (→ `degraded`) and a second succeeds (→ `healthy`). Deleting
//! a provider moves its target to `removed`, terminally.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::llm::registry::AdapterRegistry;
use crate::llm::traits::ProbeOutcome;

/// Consecutive failures in `degraded` before demotion to `unhealthy`.
const UNHEALTHY_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeState {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
    Removed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetHealth {
    pub state: ProbeState,
    pub consecutive_failures: u32,
    pub last_transition: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl TargetHealth {
    fn new() -> Self {
        Self {
            state: ProbeState::Unknown,
            consecutive_failures: 0,
            last_transition: Utc::now(),
            last_error: None,
        }
    }
}

/// Tracks one target per provider id.
#[derive(Default)]
pub struct HealthProber {
    targets: RwLock<HashMap<String, TargetHealth>>,
}

impl HealthProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a provider (idempotent; an existing target keeps
    /// its state, except a removed one which stays removed).
    pub fn track(&self, provider_id: &str) {
        let mut targets = self.targets.write().unwrap();
        targets
            .entry(provider_id.to_string())
            .or_insert_with(TargetHealth::new);
    }

    /// Forget a target entirely (provider unregistered).
    pub fn drop_target(&self, provider_id: &str) {
        self.targets.write().unwrap().remove(provider_id);
    }

    /// Terminal transition for a deleted provider.
    pub fn mark_removed(&self, provider_id: &str) {
        let mut targets = self.targets.write().unwrap();
        let target = targets
            .entry(provider_id.to_string())
            .or_insert_with(TargetHealth::new);
        if target.state != ProbeState::Removed {
            info!(provider_id, "health target removed");
            target.state = ProbeState::Removed;
            target.last_transition = Utc::now();
        }
    }

    /// A successful probe or real request.
    pub fn observe_success(&self, provider_id: &str) {
        let mut targets = self.targets.write().unwrap();
        let target = targets
            .entry(provider_id.to_string())
            .or_insert_with(TargetHealth::new);
        let next = match target.state {
            ProbeState::Removed => return,
            ProbeState::Unknown => ProbeState::Healthy,
            ProbeState::Healthy => ProbeState::Healthy,
            // Second consecutive success completes recovery.
            ProbeState::Degraded => ProbeState::Healthy,
            // First success after being down only earns degraded.
            ProbeState::Unhealthy => ProbeState::Degraded,
        };
        if next != target.state {
            debug!(provider_id, from = ?target.state, to = ?next, "health transition");
            target.last_transition = Utc::now();
        }
        target.state = next;
        target.consecutive_failures = 0;
        target.last_error = None;
    }

    /// A failed probe or real request.
    pub fn observe_failure(&self, provider_id: &str, error: Option<String>) {
        let mut targets = self.targets.write().unwrap();
        let target = targets
            .entry(provider_id.to_string())
            .or_insert_with(TargetHealth::new);
        if target.state == ProbeState::Removed {
            return;
        }
        target.consecutive_failures += 1;
        target.last_error = error;

        let next = match target.state {
            ProbeState::Unknown | ProbeState::Healthy => ProbeState::Degraded,
            ProbeState::Degraded if target.consecutive_failures >= UNHEALTHY_THRESHOLD => {
                ProbeState::Unhealthy
            }
            state => state,
        };
        if next != target.state {
            warn!(
                provider_id,
                from = ?target.state,
                to = ?next,
                failures = target.consecutive_failures,
                "health transition"
            );
            target.last_transition = Utc::now();
        }
        target.state = next;
    }

    /// Whether the selector must exclude this provider's models.
    pub fn is_down(&self, provider_id: &str) -> bool {
        let targets = self.targets.read().unwrap();
        matches!(
            targets.get(provider_id).map(|t| t.state),
            Some(ProbeState::Unhealthy) | Some(ProbeState::Removed)
        )
    }

    pub fn state(&self, provider_id: &str) -> Option<ProbeState> {
        self.targets
            .read()
            .unwrap()
            .get(provider_id)
            .map(|t| t.state)
    }

    pub fn snapshot(&self) -> HashMap<String, TargetHealth> {
        self.targets.read().unwrap().clone()
    }

    /// One probe pass over every registered adapter.
    pub async fn run_probe_cycle(&self, registry: &AdapterRegistry) {
        for id in registry.list() {
            let Some(sender) = registry.get(&id) else {
                continue;
            };
            match sender.probe().await {
                ProbeOutcome::Up => self.observe_success(&id),
                ProbeOutcome::Down(reason) => self.observe_failure(&id, Some(reason)),
                // No probe endpoint; only real requests move the state.
                ProbeOutcome::Unsupported => {}
            }
        }
    }

    /// Background probe loop on an independent schedule.
    pub fn spawn_probe_loop(
        prober: Arc<Self>,
        registry: Arc<AdapterRegistry>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                prober.run_probe_cycle(&registry).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_to_healthy_on_success() {
        let prober = HealthProber::new();
        prober.track("p");
        assert_eq!(prober.state("p"), Some(ProbeState::Unknown));
        prober.observe_success("p");
        assert_eq!(prober.state("p"), Some(ProbeState::Healthy));
        assert!(!prober.is_down("p"));
    }

    #[test]
    fn demotion_path_to_unhealthy() {
        let prober = HealthProber::new();
        prober.track("p");
        prober.observe_success("p");

        prober.observe_failure("p", Some("timeout".into()));
        assert_eq!(prober.state("p"), Some(ProbeState::Degraded));
        assert!(!prober.is_down("p"));

        prober.observe_failure("p", None);
        assert_eq!(prober.state("p"), Some(ProbeState::Degraded));
        prober.observe_failure("p", None);
        assert_eq!(prober.state("p"), Some(ProbeState::Unhealthy));
        assert!(prober.is_down("p"));
    }

    #[test]
    fn recovery_needs_two_successes() {
        let prober = HealthProber::new();
        prober.track("p");
        prober.observe_success("p");
        for _ in 0..3 {
            prober.observe_failure("p", None);
        }
        assert!(prober.is_down("p"));

        prober.observe_success("p");
        assert_eq!(prober.state("p"), Some(ProbeState::Degraded));
        assert!(!prober.is_down("p"));

        prober.observe_success("p");
        assert_eq!(prober.state("p"), Some(ProbeState::Healthy));
    }

    #[test]
    fn a_failure_mid_recovery_restarts_the_count() {
        let prober = HealthProber::new();
        prober.track("p");
        for _ in 0..4 {
            prober.observe_failure("p", None);
        }
        assert!(prober.is_down("p"));

        prober.observe_success("p");
        assert_eq!(prober.state("p"), Some(ProbeState::Degraded));
        prober.observe_failure("p", None);
        prober.observe_failure("p", None);
        prober.observe_failure("p", None);
        assert_eq!(prober.state("p"), Some(ProbeState::Unhealthy));
    }

    #[test]
    fn removed_is_terminal() {
        let prober = HealthProber::new();
        prober.track("p");
        prober.mark_removed("p");
        assert!(prober.is_down("p"));

        prober.observe_success("p");
        prober.observe_failure("p", None);
        assert_eq!(prober.state("p"), Some(ProbeState::Removed));
    }

    #[test]
    fn untracked_provider_is_not_down() {
        let prober = HealthProber::new();
        assert!(!prober.is_down("missing"));
    }
}
