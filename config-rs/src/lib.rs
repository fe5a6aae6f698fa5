//! config-rs/lib.rs
//! Shared configuration for the incident-response pipeline.
//! Provides environment helpers plus the `PipelineConfig` value that every
//! other crate receives at process start instead of copy-pasted constants.

use std::env;

mod graph_file;
mod pipeline;

pub use graph_file::{load_dependency_map, parse_dependency_map, DependencyMap};
pub use pipeline::{
    CorrelationConfig, CriticalityConfig, DedupConfig, LogConfig, PathsConfig, PipelineConfig,
    StageConfig,
};

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Load variables from a `.env` file if one exists. Missing files are fine.
pub fn load_dotenv() {
    if let Ok(path) = dotenv::dotenv() {
        log::debug!("Loaded environment from {}", path.display());
    }
}

/// Read an environment variable and parse it, falling back to `default`.
///
/// A present but unparsable value logs a warning and yields the default,
/// matching how service ports were resolved across the workspace.
pub fn env_or<T>(var_name: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display,
{
    match env::var(var_name) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            log::warn!("Invalid value in {}, using default {}", var_name, default);
            default
        }),
        Err(_) => default,
    }
}

/// Truthy env flag: "1", "true", "yes", "on" (case-insensitive).
pub fn env_flag(var_name: &str, default: bool) -> bool {
    match env::var(var_name) {
        Ok(val) => {
            let v = val.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "yes" | "on")
        }
        Err(_) => default,
    }
}

/// Optional string variable; empty values count as unset.
pub fn env_string(var_name: &str) -> Option<String> {
    env::var(var_name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Comma-separated list variable.
pub fn env_list(var_name: &str) -> Option<Vec<String>> {
    env_string(var_name).map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}
