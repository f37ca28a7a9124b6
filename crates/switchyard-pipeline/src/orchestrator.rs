//! Multi-service front door for the pipeline.
//!
//! Holds one sequencer per registered service plus the shared approval
//! gate, and routes triggers, decisions, and queries to the right one.
//! Run-level concurrency control stays inside each sequencer; the
//! orchestrator itself is stateless beyond the registry.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use switchyard_state::{PipelineRun, RoutingState, StateStore};

use crate::approval::ApprovalGate;
use crate::error::{PipelineError, PipelineResult};
use crate::sequencer::PipelineSequencer;

pub struct Orchestrator {
    store: StateStore,
    approvals: ApprovalGate,
    sequencers: HashMap<String, Arc<PipelineSequencer>>,
}

impl Orchestrator {
    pub fn new(store: StateStore) -> Self {
        Self {
            approvals: ApprovalGate::new(store.clone()),
            store,
            sequencers: HashMap::new(),
        }
    }

    /// The gate sequencers must be constructed with, so decisions made
    /// through the orchestrator reach suspended runs.
    pub fn approval_gate(&self) -> &ApprovalGate {
        &self.approvals
    }

    pub fn register(&mut self, sequencer: PipelineSequencer) {
        let service = sequencer.service().to_string();
        info!(%service, "service registered");
        self.sequencers.insert(service, Arc::new(sequencer));
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sequencers.keys().cloned().collect();
        names.sort();
        names
    }

    fn sequencer(&self, service: &str) -> PipelineResult<&Arc<PipelineSequencer>> {
        self.sequencers
            .get(service)
            .ok_or_else(|| PipelineError::UnknownService(service.to_string()))
    }

    /// React to a new source revision: start a pipeline run in the
    /// background and return its id. Rejected if a run is in flight.
    pub fn trigger(&self, service: &str, source_revision: &str) -> PipelineResult<String> {
        self.sequencer(service)?.start(source_revision)
    }

    pub fn approve(&self, run_id: &str, decided_by: &str) -> PipelineResult<()> {
        self.approvals.decide(run_id, true, decided_by)
    }

    pub fn reject(&self, run_id: &str, decided_by: &str) -> PipelineResult<()> {
        self.approvals.decide(run_id, false, decided_by)
    }

    pub fn cancel(&self, run_id: &str) -> PipelineResult<()> {
        let run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| PipelineError::NoActiveRun(run_id.to_string()))?;
        self.sequencer(&run.service)?.cancel(run_id)
    }

    pub fn run(&self, run_id: &str) -> PipelineResult<Option<PipelineRun>> {
        Ok(self.store.get_run(run_id)?)
    }

    /// All recorded runs, newest first.
    pub fn runs(&self) -> PipelineResult<Vec<PipelineRun>> {
        let mut runs = self.store.list_runs()?;
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    pub fn routing(&self, service: &str) -> PipelineResult<RoutingState> {
        Ok(self.sequencer(service)?.switcher().routing()?)
    }

    /// Close out runs interrupted by a restart, across all services.
    /// Called once at startup before the API starts accepting triggers.
    pub async fn resume_incomplete(&self) -> PipelineResult<u32> {
        let mut closed = 0;
        for sequencer in self.sequencers.values() {
            closed += sequencer.resume_incomplete().await?;
        }
        if closed > 0 {
            info!(closed, "closed runs interrupted by restart");
        }
        Ok(closed)
    }
}
