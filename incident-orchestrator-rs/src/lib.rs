// incident-orchestrator-rs/src/lib.rs
// Library interface for the incident investigation pipeline.
//
// An alert goes through two independent paths that join at the end:
// - the dedup engine fingerprints it and classifies it new/existing;
// - the pipeline controller runs the staged investigation.
// The report assembler merges both into one report and decides the
// ticket action, which the ticket sink then records.

use std::sync::Arc;

use error_handling::{CancelSignal, Classify, ErrorKind};
use fingerprint::{DedupEngine, DedupError};
use tracing::{info, instrument, warn};

pub mod controller;
pub mod envelope;
pub mod inference;
pub mod placeholder;
pub mod prompts;
pub mod report;
pub mod stages;
pub mod ticketing;
pub mod validation;

pub use controller::{
    PipelineController, PipelineError, PipelineFailure, PipelineOutcome, RunRequest,
    TerminalState,
};
pub use envelope::{ContextEnvelope, Decision, DecisionKind, StageResult};
pub use inference::{HttpInferenceClient, InferenceClient, InferenceError, InferenceRequest};
pub use placeholder::{HeuristicPlaceholderDetector, PlaceholderDetector};
pub use report::{IncidentReport, ReportAssembler, RunStatus, TicketAction};
pub use stages::{StageId, StagePayload};
pub use ticketing::{NdjsonTicketSink, TicketError, TicketReceipt, TicketSink};
pub use validation::{ValidationError, ValidationGate};

/// Failures outside the investigation itself. A failed investigation is
/// not an error here: it comes back as a report with a failed status.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("deduplication failed: {0}")]
    Dedup(#[from] DedupError),

    #[error("ticket sink failed: {0}")]
    Ticket(#[from] TicketError),
}

impl Classify for ServiceError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Storage
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Handles alerts end to end.
pub struct IncidentService {
    dedup: DedupEngine,
    controller: PipelineController,
    assembler: ReportAssembler,
    tickets: Arc<dyn TicketSink>,
}

impl IncidentService {
    pub fn new(
        dedup: DedupEngine,
        controller: PipelineController,
        tickets: Arc<dyn TicketSink>,
    ) -> Self {
        let assembler = ReportAssembler::new(Arc::clone(controller.detector()));
        Self {
            dedup,
            controller,
            assembler,
            tickets,
        }
    }

    pub fn dedup(&self) -> &DedupEngine {
        &self.dedup
    }

    /// Deduplicate and investigate one alert, then submit the ticket
    /// action if the report carries one. A fresh ticket is written back to
    /// the incident record; if another run attached one first, this run's
    /// action becomes an update of that ticket.
    #[instrument(skip_all, fields(source = %request.alert.source))]
    pub async fn handle_alert(
        &self,
        request: RunRequest,
        cancel: &CancelSignal,
    ) -> Result<IncidentReport> {
        let alert = request.alert.clone();
        let (dedup, run) = tokio::join!(
            self.dedup.check(&alert),
            self.controller.run(request, cancel)
        );
        let dedup = dedup?;

        let mut report = match &run {
            Ok(outcome) => self.assembler.from_outcome(&alert, outcome, &dedup),
            Err(failure) => self.assembler.from_failure(&alert, failure, &dedup),
        };

        if let Some(action) = report.ticket_action.clone() {
            let receipt = self.tickets.submit(&action).await?;
            let mut ticket_ref = receipt.ticket_ref;
            if action.is_create() {
                let record = self
                    .dedup
                    .attach_ticket(&dedup.fingerprint, &ticket_ref)
                    .await?;
                if let Some(winner) = record.ticket_ref.filter(|winner| *winner != ticket_ref) {
                    warn!(
                        duplicate = %ticket_ref,
                        winner = %winner,
                        "Incident already has a ticket, updating it instead"
                    );
                    let update = action.fold_into(&winner, &ticket_ref, record.occurrence_count);
                    self.tickets.submit(&update).await?;
                    report.ticket_action = Some(update);
                    ticket_ref = winner;
                }
            }
            report.ticket_ref = Some(ticket_ref);
        }

        info!(
            context_id = %report.context_id,
            fingerprint = %report.fingerprint,
            classification = %report.classification,
            failed = report.status.is_failed(),
            ticket = report.ticket_ref.as_deref().unwrap_or("-"),
            "Alert handled"
        );
        Ok(report)
    }
}
