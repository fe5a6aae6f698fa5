//! Cascade Correlator
//!
//! Turns a stream of per-service error events into cascading-failure chains
//! using two signals: time distance from the chain's root event and whether
//! a dependency path exists from the root's service to the event's service.
//!
//! A chain is opened by a "seed" event (by default an authentication or
//! authorization failure) and stays open until the next seed. While open,
//! each event joins if it lands within `long_window` of the root when it is
//! dependency-linked, or within `short_window` otherwise.

use std::collections::BTreeSet;
use std::time::Duration;

use config_rs::CorrelationConfig;
use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::events::{sort_chronologically, ErrorEvent};
use crate::graph::{CriticalityTier, DependencyGraph};
use crate::GraphError;

/// An event attached to a chain after its root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Propagation {
    pub event: ErrorEvent,
    /// Milliseconds after the root event.
    pub delay_ms: u64,
    pub dependency_linked: bool,
    /// Root service to this event's service; empty when not linked.
    pub dependency_path: Vec<String>,
}

/// A root failure plus the downstream failures attributed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeChain {
    pub root_cause: ErrorEvent,
    pub propagations: Vec<Propagation>,
    pub affected_services: BTreeSet<String>,
    /// Dependencies first, over `affected_services` only.
    #[serde(default)]
    pub restart_order: Vec<String>,
    /// Largest propagation delay, in milliseconds.
    pub duration_ms: u64,
    /// Sum of the affected services' criticality scores.
    pub criticality_score: f64,
    pub root_tier: CriticalityTier,
}

/// A dependency edge where a breaker would stop this cascade shape.
/// `from` is the failing upstream service, `to` the dependent calling it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CircuitBreakerPoint {
    pub from: String,
    pub to: String,
}

/// Everything one correlation pass produces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CascadeAnalysis {
    /// Ranked by criticality score, highest first.
    pub chains: Vec<CascadeChain>,
    /// Union of all chains' affected services.
    pub blast_radius: BTreeSet<String>,
    pub restart_order: Vec<String>,
    pub circuit_breakers: Vec<CircuitBreakerPoint>,
    pub highest_tier: Option<CriticalityTier>,
    pub events_analyzed: usize,
}

impl CascadeAnalysis {
    pub fn has_cascade(&self) -> bool {
        !self.chains.is_empty()
    }

    /// The top-ranked chain, if any.
    pub fn primary_chain(&self) -> Option<&CascadeChain> {
        self.chains.first()
    }
}

/// Chain under construction during a scan.
struct OpenChain {
    root: ErrorEvent,
    propagations: Vec<Propagation>,
}

/// Correlates events against a borrowed dependency graph.
pub struct CascadeCorrelator<'g> {
    graph: &'g DependencyGraph,
    seeds: RegexSet,
    short_window: Duration,
    long_window: Duration,
}

impl<'g> CascadeCorrelator<'g> {
    pub fn new(graph: &'g DependencyGraph, config: &CorrelationConfig) -> Result<Self, GraphError> {
        let seeds = RegexSetBuilder::new(&config.seed_patterns)
            .case_insensitive(true)
            .build()
            .map_err(|e| GraphError::InvalidSeedPattern(e.to_string()))?;

        Ok(Self {
            graph,
            seeds,
            short_window: Duration::from_millis(config.short_window_ms),
            long_window: Duration::from_millis(config.long_window_ms),
        })
    }

    /// Whether `event` opens a new chain.
    pub fn is_seed(&self, event: &ErrorEvent) -> bool {
        self.seeds.is_match(&event.error_type) || self.seeds.is_match(&event.message)
    }

    /// Detect cascade chains. Input order does not matter; the events are
    /// sorted by timestamp first. Chains come back ranked by criticality.
    pub fn correlate(&self, events: &[ErrorEvent]) -> Vec<CascadeChain> {
        let mut sorted = events.to_vec();
        sort_chronologically(&mut sorted);

        let mut finished = Vec::new();
        let mut open: Option<OpenChain> = None;

        for event in sorted {
            if self.is_seed(&event) {
                if let Some(chain) = open.take() {
                    finished.push(self.finish(chain));
                }
                debug!(service = %event.service, error_type = %event.error_type, "Seed event opens chain");
                open = Some(OpenChain {
                    root: event,
                    propagations: Vec::new(),
                });
                continue;
            }

            let Some(chain) = open.as_mut() else {
                continue;
            };

            let delay = event.millis_since(&chain.root);
            if delay < 0 {
                continue;
            }
            let delay_ms = delay as u64;

            let path = self
                .graph
                .propagation_path(&chain.root.service, &event.service);
            let linked = path.is_some();
            let window = if linked {
                self.long_window
            } else {
                self.short_window
            };

            if u128::from(delay_ms) <= window.as_millis() {
                chain.propagations.push(Propagation {
                    event,
                    delay_ms,
                    dependency_linked: linked,
                    dependency_path: path.unwrap_or_default(),
                });
            }
        }

        if let Some(chain) = open.take() {
            finished.push(self.finish(chain));
        }

        finished.sort_by(|a, b| {
            b.criticality_score
                .total_cmp(&a.criticality_score)
                .then_with(|| a.root_cause.timestamp.cmp(&b.root_cause.timestamp))
        });
        finished
    }

    fn finish(&self, chain: OpenChain) -> CascadeChain {
        let mut affected = BTreeSet::new();
        affected.insert(chain.root.service.clone());
        for p in &chain.propagations {
            affected.insert(p.event.service.clone());
        }

        let duration_ms = chain
            .propagations
            .iter()
            .map(|p| p.delay_ms)
            .max()
            .unwrap_or(0);
        let criticality_score = affected.iter().map(|s| self.graph.criticality(s)).sum();
        let root_tier = self.graph.tier(&chain.root.service);
        let restart_order = self.graph.restart_order(&affected);

        CascadeChain {
            root_cause: chain.root,
            propagations: chain.propagations,
            affected_services: affected,
            restart_order,
            duration_ms,
            criticality_score,
            root_tier,
        }
    }

    /// Full analysis: ranked chains, overall blast radius, restart order
    /// over that radius and circuit-breaker candidates.
    pub fn analyze(&self, events: &[ErrorEvent]) -> CascadeAnalysis {
        let chains = self.correlate(events);

        let blast_radius: BTreeSet<String> = chains
            .iter()
            .flat_map(|c| c.affected_services.iter().cloned())
            .collect();
        let restart_order = self.graph.restart_order(&blast_radius);
        let circuit_breakers = circuit_breaker_points(&chains);
        let highest_tier = chains.iter().map(|c| c.root_tier).max();

        info!(
            events = events.len(),
            chains = chains.len(),
            blast_radius = blast_radius.len(),
            breakers = circuit_breakers.len(),
            "Cascade correlation complete"
        );

        CascadeAnalysis {
            chains,
            blast_radius,
            restart_order,
            circuit_breakers,
            highest_tier,
            events_analyzed: events.len(),
        }
    }
}

/// Distinct last-hop edges of every dependency-linked propagation path.
pub fn circuit_breaker_points(chains: &[CascadeChain]) -> Vec<CircuitBreakerPoint> {
    let points: BTreeSet<CircuitBreakerPoint> = chains
        .iter()
        .flat_map(|c| c.propagations.iter())
        .filter(|p| p.dependency_linked)
        .filter_map(|p| match p.dependency_path.as_slice() {
            [.., from, to] => Some(CircuitBreakerPoint {
                from: from.clone(),
                to: to.clone(),
            }),
            _ => None,
        })
        .collect();
    points.into_iter().collect()
}
