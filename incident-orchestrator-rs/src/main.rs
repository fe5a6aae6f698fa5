// incident-orchestrator-rs/src/main.rs
// Command-line entry point: investigate one alert and print the report.
//
//   incident-orchestrator <alert.json> [events.json] [--force-deep-analysis]
//
// Configuration comes from INCIDENT_CONFIG_PATH and INCIDENT_* variables.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use config_rs::PipelineConfig;
use dependency_graph::{load_graph, ErrorEvent};
use error_handling::{cancel_pair, init_logging, LoggingConfig};
use fingerprint::{Alert, DedupEngine, FileDedupStore};
use incident_orchestrator::{
    HttpInferenceClient, IncidentService, NdjsonTicketSink, PipelineController, RunRequest,
};
use tracing::{info, warn};

struct Args {
    alert_path: PathBuf,
    events_path: Option<PathBuf>,
    force_deep_analysis: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut positional = Vec::new();
    let mut force_deep_analysis = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--force-deep-analysis" | "--force" => force_deep_analysis = true,
            flag if flag.starts_with("--") => bail!("unknown flag '{}'", flag),
            _ => positional.push(PathBuf::from(arg)),
        }
    }

    let mut positional = positional.into_iter();
    let Some(alert_path) = positional.next() else {
        bail!("usage: incident-orchestrator <alert.json> [events.json] [--force-deep-analysis]");
    };
    Ok(Args {
        alert_path,
        events_path: positional.next(),
        force_deep_analysis,
    })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config_rs::load_dotenv();
    let config = PipelineConfig::load().context("failed to load pipeline configuration")?;

    init_logging(Some(LoggingConfig {
        level: config.logging.level.clone(),
        service_name: "incident-orchestrator".to_string(),
        json_format: config.logging.json,
    }))?;

    let args = parse_args()?;
    let alert: Alert = read_json(&args.alert_path)?;
    let events: Vec<ErrorEvent> = match &args.events_path {
        Some(path) => read_json(path)?,
        None => Vec::new(),
    };

    let graph = load_graph(&config.paths.dependency_graph, &config.criticality)
        .with_context(|| {
            format!(
                "failed to load dependency graph from {}",
                config.paths.dependency_graph.display()
            )
        })?;
    info!(
        services = graph.len(),
        edges = graph.edge_count(),
        "Dependency graph loaded"
    );

    let Some(endpoint) = config.paths.inference_endpoint.clone() else {
        bail!("no inference endpoint configured (set INCIDENT_INFERENCE_ENDPOINT)");
    };
    let inference = HttpInferenceClient::new(
        endpoint,
        Duration::from_secs(config.stages.timeout_secs),
    )?;

    let controller = PipelineController::new(Arc::new(inference), Arc::new(graph), &config);
    let dedup = DedupEngine::new(
        Arc::new(FileDedupStore::new(&config.paths.dedup_store)),
        &config.dedup,
    );
    let tickets = Arc::new(NdjsonTicketSink::new(&config.paths.ticket_log));
    let service = IncidentService::new(dedup, controller, tickets);

    let (cancel_handle, cancel) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling investigation");
            cancel_handle.cancel();
        }
    });

    let request = RunRequest::new(alert)
        .with_events(events)
        .force_deep_analysis(args.force_deep_analysis);
    let report = service.handle_alert(request, &cancel).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
