// config-rs/src/pipeline.rs
// Pipeline configuration: one value loaded at process start and passed
// down to the graph, correlator, dedup engine and controller.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{env_flag, env_list, env_or, env_string, ConfigError};

/// Top-level configuration for an incident pipeline process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub correlation: CorrelationConfig,
    pub criticality: CriticalityConfig,
    pub stages: StageConfig,
    pub dedup: DedupConfig,
    pub paths: PathsConfig,
    pub logging: LogConfig,
    /// Namespaces handed to every stage as part of the request context.
    pub namespaces: Vec<String>,
}

/// Cascade correlation windows and seed signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Window for events with no dependency path from the chain root.
    pub short_window_ms: u64,
    /// Window for events on services reachable from the chain root.
    pub long_window_ms: u64,
    /// Case-insensitive regexes; an event matching any of them opens a chain.
    pub seed_patterns: Vec<String>,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            short_window_ms: 500,
            long_window_ms: 2000,
            seed_patterns: vec![
                r"\b401\b".to_string(),
                r"\b403\b".to_string(),
                r"unauthori[sz]ed".to_string(),
                r"forbidden".to_string(),
                r"invalid[_ ]client".to_string(),
                r"token (has )?expired".to_string(),
                r"authentication failed".to_string(),
            ],
        }
    }
}

/// Weighting and tier thresholds for blast-radius scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CriticalityConfig {
    pub weight: f64,
    pub cap: f64,
    pub medium_threshold: f64,
    pub high_threshold: f64,
    pub critical_threshold: f64,
}

impl Default for CriticalityConfig {
    fn default() -> Self {
        Self {
            weight: 10.0,
            cap: 100.0,
            medium_threshold: 20.0,
            high_threshold: 50.0,
            critical_threshold: 80.0,
        }
    }
}

/// Stage execution policy for inference calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub timeout_secs: u64,
    pub max_retries: usize,
    pub retry_base_backoff_ms: u64,
    pub anomaly_stage_enabled: bool,
    /// Below this `tools_executed` count a stage gets a non-critical warning.
    pub expected_tools_executed: u64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_retries: 2,
            retry_base_backoff_ms: 250,
            anomaly_stage_enabled: true,
            expected_tools_executed: 1,
        }
    }
}

/// Deduplication store behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Records older than this are treated as expired. `None` keeps them forever.
    pub retention_secs: Option<u64>,
}

/// File and endpoint locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub dependency_graph: PathBuf,
    pub dedup_store: PathBuf,
    pub ticket_log: PathBuf,
    pub inference_endpoint: Option<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            dependency_graph: PathBuf::from("config/dependencies.toml"),
            dedup_store: PathBuf::from("data/incidents/dedup.ndjson"),
            ticket_log: PathBuf::from("data/incidents/tickets.ndjson"),
            inference_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

impl PipelineConfig {
    /// Parse a TOML document. Missing sections fall back to defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Resolve the process configuration.
    ///
    /// Reads `INCIDENT_CONFIG_PATH` when set (a missing file is an error in
    /// that case), otherwise starts from defaults; `INCIDENT_*` variables
    /// are applied on top.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env_string("INCIDENT_CONFIG_PATH") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `INCIDENT_*` environment overrides in place.
    pub fn apply_env_overrides(&mut self) {
        let c = &mut self.correlation;
        c.short_window_ms = env_or("INCIDENT_SHORT_WINDOW_MS", c.short_window_ms);
        c.long_window_ms = env_or("INCIDENT_LONG_WINDOW_MS", c.long_window_ms);
        if let Some(patterns) = env_list("INCIDENT_SEED_PATTERNS") {
            c.seed_patterns = patterns;
        }

        let k = &mut self.criticality;
        k.weight = env_or("INCIDENT_CRITICALITY_WEIGHT", k.weight);
        k.cap = env_or("INCIDENT_CRITICALITY_CAP", k.cap);

        let s = &mut self.stages;
        s.timeout_secs = env_or("INCIDENT_STAGE_TIMEOUT_SECS", s.timeout_secs);
        s.max_retries = env_or("INCIDENT_STAGE_MAX_RETRIES", s.max_retries);
        s.retry_base_backoff_ms = env_or("INCIDENT_RETRY_BACKOFF_MS", s.retry_base_backoff_ms);
        s.anomaly_stage_enabled = env_flag("INCIDENT_ANOMALY_STAGE", s.anomaly_stage_enabled);

        if let Some(secs) = env_string("INCIDENT_DEDUP_RETENTION_SECS") {
            match secs.parse::<u64>() {
                Ok(v) => self.dedup.retention_secs = Some(v),
                Err(_) => log::warn!("Invalid value in INCIDENT_DEDUP_RETENTION_SECS, ignoring"),
            }
        }

        let p = &mut self.paths;
        if let Some(path) = env_string("INCIDENT_DEPENDENCY_GRAPH") {
            p.dependency_graph = PathBuf::from(path);
        }
        if let Some(path) = env_string("INCIDENT_DEDUP_STORE") {
            p.dedup_store = PathBuf::from(path);
        }
        if let Some(path) = env_string("INCIDENT_TICKET_LOG") {
            p.ticket_log = PathBuf::from(path);
        }
        if let Some(endpoint) = env_string("INCIDENT_INFERENCE_ENDPOINT") {
            p.inference_endpoint = Some(endpoint);
        }

        if let Some(level) = env_string("INCIDENT_LOG_LEVEL") {
            self.logging.level = level;
        }
        self.logging.json = env_flag("INCIDENT_LOG_JSON", self.logging.json);

        if let Some(namespaces) = env_list("INCIDENT_NAMESPACES") {
            self.namespaces = namespaces;
        }
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.correlation;
        if c.short_window_ms > c.long_window_ms {
            return Err(ConfigError::InvalidValue(format!(
                "short_window_ms ({}) must not exceed long_window_ms ({})",
                c.short_window_ms, c.long_window_ms
            )));
        }

        let k = &self.criticality;
        if k.weight < 0.0 || k.cap <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "criticality weight must be >= 0 and cap > 0".to_string(),
            ));
        }
        if !(k.medium_threshold <= k.high_threshold && k.high_threshold <= k.critical_threshold) {
            return Err(ConfigError::InvalidValue(
                "criticality thresholds must be ordered medium <= high <= critical".to_string(),
            ));
        }

        if self.stages.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "stages.timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
