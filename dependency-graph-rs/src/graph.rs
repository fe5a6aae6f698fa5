//! Dependency Graph Store
//!
//! Immutable service dependency graph with a derived reverse (dependents)
//! map and per-service criticality scores. Built once per process from the
//! static dependency configuration and shared read-only afterwards.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use config_rs::{CriticalityConfig, DependencyMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::GraphError;

/// A deployable service and the services it calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Bucketed blast-radius tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CriticalityTier {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for CriticalityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CriticalityTier::Low => write!(f, "low"),
            CriticalityTier::Medium => write!(f, "medium"),
            CriticalityTier::High => write!(f, "high"),
            CriticalityTier::Critical => write!(f, "critical"),
        }
    }
}

/// Blast radius of a single service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCriticality {
    /// Services that transitively depend on this one, each counted once.
    pub transitive_dependents: usize,
    pub score: f64,
    pub tier: CriticalityTier,
}

/// Forward/reverse dependency maps plus precomputed criticality.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// service -> services it depends on
    forward: BTreeMap<String, BTreeSet<String>>,
    /// service -> services that depend on it
    reverse: BTreeMap<String, BTreeSet<String>>,
    criticality: BTreeMap<String, ServiceCriticality>,
    config: CriticalityConfig,
}

impl DependencyGraph {
    /// Build from the raw `service -> [dependency]` configuration map.
    pub fn build(map: &DependencyMap, config: &CriticalityConfig) -> Result<Self, GraphError> {
        Self::from_nodes(
            map.iter().map(|(name, deps)| ServiceNode {
                name: name.clone(),
                dependencies: deps.clone(),
            }),
            config,
        )
    }

    /// Build from service nodes. Dependencies that are never declared as
    /// services become leaf nodes. Self-dependencies are dropped.
    pub fn from_nodes<I>(nodes: I, config: &CriticalityConfig) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = ServiceNode>,
    {
        let mut forward: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for node in nodes {
            let name = node.name.trim().to_string();
            if name.is_empty() {
                return Err(GraphError::EmptyServiceName);
            }
            let deps = forward.entry(name.clone()).or_default();
            for dep in node.dependencies {
                let dep = dep.trim().to_string();
                if dep.is_empty() {
                    return Err(GraphError::EmptyDependency(name.clone()));
                }
                if dep == name {
                    warn!(service = %name, "Ignoring self-dependency");
                    continue;
                }
                deps.insert(dep);
            }
        }

        let leaves: Vec<String> = forward
            .values()
            .flatten()
            .filter(|dep| !forward.contains_key(*dep))
            .cloned()
            .collect();
        for leaf in leaves {
            forward.entry(leaf).or_default();
        }

        // Single pass over the forward map.
        let mut reverse: BTreeMap<String, BTreeSet<String>> =
            forward.keys().map(|k| (k.clone(), BTreeSet::new())).collect();
        for (service, deps) in &forward {
            for dep in deps {
                reverse
                    .entry(dep.clone())
                    .or_default()
                    .insert(service.clone());
            }
        }

        let mut graph = Self {
            forward,
            reverse,
            criticality: BTreeMap::new(),
            config: config.clone(),
        };
        graph.criticality = graph.compute_criticality();

        debug!(
            services = graph.forward.len(),
            edges = graph.edge_count(),
            "Dependency graph built"
        );
        Ok(graph)
    }

    /// A new graph with `dependent -> dependency` added. The receiver is
    /// left untouched.
    pub fn with_edge(&self, dependent: &str, dependency: &str) -> Result<Self, GraphError> {
        let nodes = self.nodes().into_iter().chain(std::iter::once(ServiceNode {
            name: dependent.to_string(),
            dependencies: vec![dependency.to_string()],
        }));
        Self::from_nodes(nodes, &self.config)
    }

    /// Current graph as service nodes.
    pub fn nodes(&self) -> Vec<ServiceNode> {
        self.forward
            .iter()
            .map(|(name, deps)| ServiceNode {
                name: name.clone(),
                dependencies: deps.iter().cloned().collect(),
            })
            .collect()
    }

    pub fn contains(&self, service: &str) -> bool {
        self.forward.contains_key(service)
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.forward.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.forward.values().map(BTreeSet::len).sum()
    }

    /// Direct dependencies of `service`.
    pub fn dependencies_of(&self, service: &str) -> impl Iterator<Item = &str> {
        self.forward
            .get(service)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Direct dependents of `service`.
    pub fn dependents_of(&self, service: &str) -> impl Iterator<Item = &str> {
        self.reverse
            .get(service)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// `true` if `dependent` declares `dependency` directly.
    pub fn depends_on(&self, dependent: &str, dependency: &str) -> bool {
        self.forward
            .get(dependent)
            .map(|deps| deps.contains(dependency))
            .unwrap_or(false)
    }

    /// Every service that transitively depends on `service`, excluding
    /// `service` itself even when it sits on a cycle.
    pub fn transitive_dependents(&self, service: &str) -> BTreeSet<String> {
        let mut visited = BTreeSet::new();
        if self.contains(service) {
            visited.insert(service.to_string());
            self.collect_dependents(service, &mut visited);
            visited.remove(service);
        }
        visited
    }

    fn collect_dependents(&self, service: &str, visited: &mut BTreeSet<String>) {
        for dependent in self.dependents_of(service) {
            if visited.insert(dependent.to_string()) {
                self.collect_dependents(dependent, visited);
            }
        }
    }

    fn compute_criticality(&self) -> BTreeMap<String, ServiceCriticality> {
        self.forward
            .keys()
            .map(|service| {
                let count = self.transitive_dependents(service).len();
                let score = (count as f64 * self.config.weight).min(self.config.cap);
                let entry = ServiceCriticality {
                    transitive_dependents: count,
                    score,
                    tier: self.tier_for_score(score),
                };
                (service.clone(), entry)
            })
            .collect()
    }

    /// Bucket a score with the configured thresholds.
    pub fn tier_for_score(&self, score: f64) -> CriticalityTier {
        if score >= self.config.critical_threshold {
            CriticalityTier::Critical
        } else if score >= self.config.high_threshold {
            CriticalityTier::High
        } else if score >= self.config.medium_threshold {
            CriticalityTier::Medium
        } else {
            CriticalityTier::Low
        }
    }

    /// Criticality score; unknown services score zero.
    pub fn criticality(&self, service: &str) -> f64 {
        self.criticality
            .get(service)
            .map(|c| c.score)
            .unwrap_or(0.0)
    }

    pub fn tier(&self, service: &str) -> CriticalityTier {
        self.criticality
            .get(service)
            .map(|c| c.tier)
            .unwrap_or(CriticalityTier::Low)
    }

    pub fn criticality_of(&self, service: &str) -> Option<&ServiceCriticality> {
        self.criticality.get(service)
    }

    /// Shortest path along which a failure of `from` reaches `to`: a
    /// breadth-first walk over dependents. The path starts at `from` and
    /// ends at `to`; `None` when `to` is not reachable or equals `from`.
    pub fn propagation_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        if from == to || !self.contains(from) || !self.contains(to) {
            return None;
        }

        let mut parent: BTreeMap<&str, &str> = BTreeMap::new();
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut queue = VecDeque::new();
        visited.insert(from);
        queue.push_back(from);

        while let Some(current) = queue.pop_front() {
            for next in self.dependents_of(current) {
                if !visited.insert(next) {
                    continue;
                }
                parent.insert(next, current);
                if next == to {
                    let mut path = vec![to.to_string()];
                    let mut cursor = to;
                    while let Some(&prev) = parent.get(cursor) {
                        path.push(prev.to_string());
                        cursor = prev;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Dependency-safe restart order for `affected`: depth-first post-order
    /// over dependencies restricted to the set, so every service comes after
    /// the in-set services it depends on. Deterministic for a given input.
    pub fn restart_order(&self, affected: &BTreeSet<String>) -> Vec<String> {
        let mut order = Vec::with_capacity(affected.len());
        let mut visited = BTreeSet::new();
        for service in affected {
            self.visit_for_restart(service, affected, &mut visited, &mut order);
        }
        order
    }

    fn visit_for_restart(
        &self,
        service: &str,
        affected: &BTreeSet<String>,
        visited: &mut BTreeSet<String>,
        order: &mut Vec<String>,
    ) {
        if !visited.insert(service.to_string()) {
            return;
        }
        for dep in self.dependencies_of(service) {
            if affected.contains(dep) {
                self.visit_for_restart(dep, affected, visited, order);
            }
        }
        order.push(service.to_string());
    }
}
