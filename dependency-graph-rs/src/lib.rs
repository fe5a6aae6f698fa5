//! Dependency-aware cascade analysis.
//!
//! [`DependencyGraph`] holds the static service topology and its
//! criticality scores; [`CascadeCorrelator`] groups error events into
//! cascade chains over that topology.

pub mod correlator;
pub mod events;
pub mod graph;

use thiserror::Error;

pub use correlator::{
    circuit_breaker_points, CascadeAnalysis, CascadeChain, CascadeCorrelator, CircuitBreakerPoint,
    Propagation,
};
pub use events::{sort_chronologically, ErrorEvent};
pub use graph::{CriticalityTier, DependencyGraph, ServiceCriticality, ServiceNode};

/// Errors raised while building the graph or the correlator.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Service name must not be empty")]
    EmptyServiceName,

    #[error("Service '{0}' declares an empty dependency name")]
    EmptyDependency(String),

    #[error("Invalid seed pattern: {0}")]
    InvalidSeedPattern(String),

    #[error("Failed to load dependency map: {0}")]
    Config(#[from] config_rs::ConfigError),
}

/// Load the dependency map at `path` and build the graph from it.
pub fn load_graph(
    path: &std::path::Path,
    criticality: &config_rs::CriticalityConfig,
) -> Result<DependencyGraph, GraphError> {
    let map = config_rs::load_dependency_map(path)?;
    DependencyGraph::build(&map, criticality)
}
