//! The manual approval gate.
//!
//! Entering the gate persists a `Pending` decision and suspends the run
//! on a oneshot channel. An external caller resolves it through
//! `decide`; a lapsed deadline resolves it as `Rejected` with
//! `decided_by = "deadline"`. Decisions are terminal — deciding twice is
//! an error, and the decision record survives restarts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{info, warn};

use switchyard_state::{ApprovalDecision, Decision, StateStore, epoch_secs};

use crate::error::{PipelineError, PipelineResult};

/// A run suspended on the gate, waiting for a decision.
pub struct PendingApproval {
    run_id: String,
    rx: oneshot::Receiver<Decision>,
}

/// Suspends pipeline runs until an explicit external decision.
#[derive(Clone)]
pub struct ApprovalGate {
    store: StateStore,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Decision>>>>,
}

impl ApprovalGate {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Enter the gate for a run. Persists a `Pending` record and returns
    /// the handle the sequencer will block on.
    pub fn request(&self, run_id: &str) -> PipelineResult<PendingApproval> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(run_id.to_string(), tx);
        self.store.put_approval(&ApprovalDecision::pending(run_id))?;
        info!(%run_id, "awaiting manual approval");
        Ok(PendingApproval {
            run_id: run_id.to_string(),
            rx,
        })
    }

    /// Resolve a pending approval. `approved = false` records a rejection.
    pub fn decide(&self, run_id: &str, approved: bool, decided_by: &str) -> PipelineResult<()> {
        let sender = self.pending.lock().unwrap().remove(run_id);
        let Some(sender) = sender else {
            // Distinguish "never pending" from "already decided".
            return match self.store.get_approval(run_id)? {
                Some(approval) if approval.is_terminal() => {
                    Err(PipelineError::ApprovalAlreadyDecided(run_id.to_string()))
                }
                _ => Err(PipelineError::NoPendingApproval(run_id.to_string())),
            };
        };

        let decision = if approved {
            Decision::Approved
        } else {
            Decision::Rejected
        };
        self.store.put_approval(&ApprovalDecision {
            run_id: run_id.to_string(),
            decision,
            decided_at: Some(epoch_secs()),
            decided_by: Some(decided_by.to_string()),
        })?;
        // The waiter may have raced the deadline and gone away.
        let _ = sender.send(decision);
        info!(%run_id, ?decision, %decided_by, "approval decided");
        Ok(())
    }

    /// Block until the decision arrives or the deadline lapses.
    /// A lapsed deadline is recorded and treated as a rejection.
    pub async fn await_decision(
        &self,
        pending: PendingApproval,
        deadline: Duration,
    ) -> PipelineResult<Decision> {
        let run_id = pending.run_id;
        match tokio::time::timeout(deadline, pending.rx).await {
            Ok(Ok(decision)) => Ok(decision),
            // Sender dropped without a decision; treat like a timeout.
            Ok(Err(_)) | Err(_) => {
                self.pending.lock().unwrap().remove(&run_id);
                self.store.put_approval(&ApprovalDecision {
                    run_id: run_id.clone(),
                    decision: Decision::Rejected,
                    decided_at: Some(epoch_secs()),
                    decided_by: Some("deadline".to_string()),
                })?;
                warn!(%run_id, "approval deadline lapsed, treating as rejected");
                Ok(Decision::Rejected)
            }
        }
    }

    /// Whether a run currently has an undecided approval.
    pub fn is_pending(&self, run_id: &str) -> bool {
        self.pending.lock().unwrap().contains_key(run_id)
    }
}
