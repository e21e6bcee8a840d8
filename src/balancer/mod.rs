//! Upstream selection.
//!
//! Candidates are the enabled upstreams, filtered by probe health when
//! health checking is on (an unprobed upstream counts as healthy). If the
//! filter empties the set and failover is enabled, selection falls back to
//! every enabled upstream; otherwise the request fails with `no_upstream`.

pub mod health;

use std::collections::HashMap;

use rand::Rng;
use serde::Serialize;

use crate::config::{Config, Upstream};
use crate::error::ProxyError;

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// Selection strategy. Built from the config's strategy string; unknown
/// names (including the documented-but-unimplemented `least_connections`)
/// alias to weighted round-robin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    WeightedRoundRobin,
    Random,
}

impl Strategy {
    pub fn resolve(name: &str) -> Self {
        match name {
            "round_robin" => Self::RoundRobin,
            "weighted_round_robin" => Self::WeightedRoundRobin,
            "random" => Self::Random,
            "weighted_random" | "least_connections" => {
                tracing::warn!(
                    strategy = %name,
                    "Strategy is aliased to weighted_round_robin"
                );
                Self::WeightedRoundRobin
            }
            other => {
                tracing::warn!(
                    strategy = %other,
                    "Unknown load-balancer strategy; falling back to weighted_round_robin"
                );
                Self::WeightedRoundRobin
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Health state
// ---------------------------------------------------------------------------

/// Probe result for one upstream. `Unknown` (never probed) is treated as
/// healthy by selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Admin-facing view of one upstream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamStatus {
    pub id: String,
    pub name: String,
    pub weight: u32,
    pub enabled: bool,
    pub health: HealthState,
}

// ---------------------------------------------------------------------------
// LoadBalancer
// ---------------------------------------------------------------------------

pub struct LoadBalancer {
    upstreams: Vec<Upstream>,
    strategy: Strategy,
    health_check_enabled: bool,
    failover_enabled: bool,
    /// Global round-robin counter.
    rr_index: usize,
    /// Smooth-WRR current weights, keyed by upstream id.
    current_weight: HashMap<String, i64>,
    health: HashMap<String, HealthState>,
}

impl LoadBalancer {
    /// Build a balancer from a config snapshot. Counters start fresh, so a
    /// reload resets both the round-robin index and the WRR state.
    pub fn from_config(config: &Config) -> Self {
        Self {
            upstreams: config.upstreams.clone(),
            strategy: Strategy::resolve(&config.load_balancer.strategy),
            health_check_enabled: config.load_balancer.health_check_enabled,
            failover_enabled: config.load_balancer.failover_enabled,
            rr_index: 0,
            current_weight: HashMap::new(),
            health: HashMap::new(),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Pick an upstream for one request.
    pub fn select(&mut self) -> Result<Upstream, ProxyError> {
        let candidates = self.candidate_indices();
        if candidates.is_empty() {
            return Err(ProxyError::NoUpstream);
        }

        let chosen = match self.strategy {
            Strategy::RoundRobin => {
                let index = candidates[self.rr_index % candidates.len()];
                self.rr_index = self.rr_index.wrapping_add(1);
                index
            }
            Strategy::WeightedRoundRobin => self.select_weighted(&candidates),
            Strategy::Random => candidates[rand::rng().random_range(0..candidates.len())],
        };

        Ok(self.upstreams[chosen].clone())
    }

    /// Indices (into `upstreams`, preserving config order) eligible for
    /// selection.
    fn candidate_indices(&self) -> Vec<usize> {
        let enabled: Vec<usize> = self
            .upstreams
            .iter()
            .enumerate()
            .filter(|(_, u)| u.enabled)
            .map(|(i, _)| i)
            .collect();

        if !self.health_check_enabled {
            return enabled;
        }

        let healthy: Vec<usize> = enabled
            .iter()
            .copied()
            .filter(|&i| self.health_of(&self.upstreams[i].id) != HealthState::Unhealthy)
            .collect();

        if healthy.is_empty() && self.failover_enabled && !enabled.is_empty() {
            tracing::warn!("No healthy upstream; failover falls back to all enabled upstreams");
            return enabled;
        }
        healthy
    }

    /// Smooth weighted round-robin: bump every candidate's current weight by
    /// its configured weight, pick the maximum (first occurrence wins ties),
    /// then subtract the total weight from the winner.
    fn select_weighted(&mut self, candidates: &[usize]) -> usize {
        let mut total: i64 = 0;
        let mut best: Option<(usize, i64)> = None;

        for &index in candidates {
            let upstream = &self.upstreams[index];
            let weight = i64::from(upstream.weight);
            total += weight;
            let cw = self
                .current_weight
                .entry(upstream.id.clone())
                .or_insert(0);
            *cw += weight;
            match best {
                Some((_, best_cw)) if *cw <= best_cw => {}
                _ => best = Some((index, *cw)),
            }
        }

        // candidates is non-empty, so best is always set.
        let (winner, _) = best.unwrap_or((candidates[0], 0));
        if let Some(cw) = self.current_weight.get_mut(&self.upstreams[winner].id) {
            *cw -= total;
        }
        winner
    }

    // -- health --------------------------------------------------------------

    pub fn health_of(&self, id: &str) -> HealthState {
        self.health.get(id).copied().unwrap_or_default()
    }

    /// Record a probe result; transitions log at INFO.
    pub fn mark_health(&mut self, id: &str, healthy: bool) {
        let new = if healthy {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        };
        let old = self.health.insert(id.to_string(), new).unwrap_or_default();
        if old != new {
            tracing::info!(upstream_id = %id, from = ?old, to = ?new, "Upstream health changed");
        }
    }

    /// Admin view of all upstreams and their probe state.
    pub fn status(&self) -> Vec<UpstreamStatus> {
        self.upstreams
            .iter()
            .map(|u| UpstreamStatus {
                id: u.id.clone(),
                name: u.name.clone(),
                weight: u.weight,
                enabled: u.enabled,
                health: self.health_of(&u.id),
            })
            .collect()
    }

    /// Enabled upstreams, for the probe loop.
    pub fn probe_targets(&self) -> Vec<Upstream> {
        self.upstreams.iter().filter(|u| u.enabled).cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BalancerConfig;

    fn upstream(id: &str, weight: u32, enabled: bool) -> Upstream {
        Upstream {
            id: id.to_string(),
            name: id.to_uppercase(),
            url: format!("https://{id}.example.com"),
            key: None,
            weight,
            enabled,
            health_check: None,
        }
    }

    fn config(strategy: &str, upstreams: Vec<Upstream>) -> Config {
        Config {
            upstreams,
            load_balancer: BalancerConfig {
                strategy: strategy.to_string(),
                health_check_enabled: false,
                failover_enabled: true,
            },
            ..Config::default()
        }
    }

    #[test]
    fn test_strategy_resolution() {
        assert_eq!(Strategy::resolve("round_robin"), Strategy::RoundRobin);
        assert_eq!(
            Strategy::resolve("weighted_round_robin"),
            Strategy::WeightedRoundRobin
        );
        assert_eq!(Strategy::resolve("random"), Strategy::Random);
        // Documented aliases and unknown names all land on weighted RR.
        assert_eq!(
            Strategy::resolve("least_connections"),
            Strategy::WeightedRoundRobin
        );
        assert_eq!(
            Strategy::resolve("weighted_random"),
            Strategy::WeightedRoundRobin
        );
        assert_eq!(Strategy::resolve("bogus"), Strategy::WeightedRoundRobin);
    }

    #[test]
    fn test_round_robin_cycles() {
        let cfg = config(
            "round_robin",
            vec![upstream("a", 1, true), upstream("b", 1, true), upstream("c", 1, true)],
        );
        let mut lb = LoadBalancer::from_config(&cfg);

        let picks: Vec<String> = (0..6).map(|_| lb.select().unwrap().id).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_smooth_wrr_sequence() {
        // A weight 3, B weight 1: smooth WRR spreads selections as
        // A A B A repeating (no bursts of a single upstream beyond its share).
        let cfg = config(
            "weighted_round_robin",
            vec![upstream("a", 3, true), upstream("b", 1, true)],
        );
        let mut lb = LoadBalancer::from_config(&cfg);

        let picks: Vec<String> = (0..8).map(|_| lb.select().unwrap().id).collect();
        assert_eq!(picks, vec!["a", "a", "b", "a", "a", "a", "b", "a"]);
    }

    #[test]
    fn test_wrr_window_share() {
        // Over any window of sum-of-weights selections, each upstream is
        // chosen exactly weight-many times.
        let cfg = config(
            "weighted_round_robin",
            vec![
                upstream("a", 5, true),
                upstream("b", 2, true),
                upstream("c", 1, true),
            ],
        );
        let mut lb = LoadBalancer::from_config(&cfg);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..8 {
            *counts.entry(lb.select().unwrap().id).or_default() += 1;
        }
        assert_eq!(counts["a"], 5);
        assert_eq!(counts["b"], 2);
        assert_eq!(counts["c"], 1);
    }

    #[test]
    fn test_disabled_upstreams_invisible() {
        let cfg = config(
            "round_robin",
            vec![upstream("a", 1, false), upstream("b", 1, true)],
        );
        let mut lb = LoadBalancer::from_config(&cfg);

        for _ in 0..4 {
            assert_eq!(lb.select().unwrap().id, "b");
        }
    }

    #[test]
    fn test_all_disabled_is_no_upstream() {
        let cfg = config("round_robin", vec![upstream("a", 1, false)]);
        let mut lb = LoadBalancer::from_config(&cfg);
        assert!(matches!(lb.select(), Err(ProxyError::NoUpstream)));
    }

    #[test]
    fn test_unhealthy_filtered_when_health_checks_on() {
        let mut cfg = config(
            "round_robin",
            vec![upstream("a", 1, true), upstream("b", 1, true)],
        );
        cfg.load_balancer.health_check_enabled = true;
        let mut lb = LoadBalancer::from_config(&cfg);

        lb.mark_health("a", false);
        for _ in 0..3 {
            assert_eq!(lb.select().unwrap().id, "b");
        }
    }

    #[test]
    fn test_unknown_health_counts_as_healthy() {
        let mut cfg = config("round_robin", vec![upstream("a", 1, true)]);
        cfg.load_balancer.health_check_enabled = true;
        let mut lb = LoadBalancer::from_config(&cfg);

        // Never probed: still selectable.
        assert_eq!(lb.select().unwrap().id, "a");
        assert_eq!(lb.health_of("a"), HealthState::Unknown);
    }

    #[test]
    fn test_failover_falls_back_to_all_enabled() {
        let mut cfg = config(
            "round_robin",
            vec![upstream("a", 1, true), upstream("b", 1, true)],
        );
        cfg.load_balancer.health_check_enabled = true;
        cfg.load_balancer.failover_enabled = true;
        let mut lb = LoadBalancer::from_config(&cfg);

        lb.mark_health("a", false);
        lb.mark_health("b", false);
        // Everything unhealthy, but failover still returns one.
        assert!(lb.select().is_ok());
    }

    #[test]
    fn test_no_failover_raises_no_upstream() {
        let mut cfg = config(
            "round_robin",
            vec![upstream("a", 1, true), upstream("b", 1, true)],
        );
        cfg.load_balancer.health_check_enabled = true;
        cfg.load_balancer.failover_enabled = false;
        let mut lb = LoadBalancer::from_config(&cfg);

        lb.mark_health("a", false);
        lb.mark_health("b", false);
        assert!(matches!(lb.select(), Err(ProxyError::NoUpstream)));
    }

    #[test]
    fn test_reload_resets_counters() {
        let cfg = config(
            "round_robin",
            vec![upstream("a", 1, true), upstream("b", 1, true)],
        );
        let mut lb = LoadBalancer::from_config(&cfg);
        assert_eq!(lb.select().unwrap().id, "a");
        assert_eq!(lb.select().unwrap().id, "b");

        // Rebuilding from config starts over at the first upstream.
        let mut lb = LoadBalancer::from_config(&cfg);
        assert_eq!(lb.select().unwrap().id, "a");
    }

    #[test]
    fn test_random_only_picks_candidates() {
        let cfg = config(
            "random",
            vec![upstream("a", 1, true), upstream("b", 1, false)],
        );
        let mut lb = LoadBalancer::from_config(&cfg);
        for _ in 0..20 {
            assert_eq!(lb.select().unwrap().id, "a");
        }
    }

    #[test]
    fn test_status_reflects_health() {
        let cfg = config(
            "round_robin",
            vec![upstream("a", 2, true), upstream("b", 1, false)],
        );
        let mut lb = LoadBalancer::from_config(&cfg);
        lb.mark_health("a", true);

        let status = lb.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].health, HealthState::Healthy);
        assert!(!status[1].enabled);
        assert_eq!(status[1].health, HealthState::Unknown);
    }

    #[test]
    fn test_wrr_tie_broken_by_first_occurrence() {
        let cfg = config(
            "weighted_round_robin",
            vec![upstream("a", 1, true), upstream("b", 1, true)],
        );
        let mut lb = LoadBalancer::from_config(&cfg);
        // Equal weights: strict alternation starting at the first upstream.
        let picks: Vec<String> = (0..4).map(|_| lb.select().unwrap().id).collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }
}
