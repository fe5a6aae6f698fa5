// config-rs/src/graph_file.rs
// Static service -> dependencies map, loaded once at process start.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::ConfigError;

/// Raw dependency declarations: service name -> services it depends on.
pub type DependencyMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Deserialize)]
struct DependencyFile {
    #[serde(default)]
    services: DependencyMap,
}

/// Parse a dependency map from TOML (`[services]` table) or JSON
/// (`{"services": {...}}` or a bare object).
pub fn parse_dependency_map(contents: &str) -> Result<DependencyMap, ConfigError> {
    let trimmed = contents.trim_start();
    if trimmed.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(trimmed)
            .map_err(|e| ConfigError::ParseError(format!("dependency graph json: {}", e)))?;
        let services = value.get("services").cloned().unwrap_or(value);
        return serde_json::from_value(services)
            .map_err(|e| ConfigError::ParseError(format!("dependency graph json: {}", e)));
    }

    let file: DependencyFile = toml::from_str(contents)
        .map_err(|e| ConfigError::ParseError(format!("dependency graph toml: {}", e)))?;
    Ok(file.services)
}

/// Read and parse a dependency map file.
pub fn load_dependency_map(path: &Path) -> Result<DependencyMap, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }
    let contents = fs::read_to_string(path)?;
    let map = parse_dependency_map(&contents)?;
    log::info!(
        "Loaded dependency graph with {} services from {}",
        map.len(),
        path.display()
    );
    Ok(map)
}
