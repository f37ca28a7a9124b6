//! Error types for the pipeline sequencer.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors surfaced to pipeline callers.
///
/// Stage-local failures with a defined rollback edge never appear here;
/// they are recorded in the run log and the run terminates normally.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A second trigger arrived while a run was in flight.
    #[error("a pipeline run is already in progress for {0}")]
    RunInProgress(String),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("no active run: {0}")]
    NoActiveRun(String),

    /// Cancellation requested after cutover began; the run must reach a
    /// terminal state on its own.
    #[error("run {0} can no longer be cancelled")]
    CancelTooLate(String),

    #[error("no approval pending for run {0}")]
    NoPendingApproval(String),

    #[error("approval for run {0} already decided")]
    ApprovalAlreadyDecided(String),

    #[error("state store error: {0}")]
    State(#[from] switchyard_state::StateError),

    #[error("cutover error: {0}")]
    Cutover(#[from] switchyard_cutover::CutoverError),
}
