//! Error types for the cutover state machine.

use thiserror::Error;

use switchyard_state::RoutingPhase;

/// Result type alias for cutover operations.
pub type CutoverResult<T> = Result<T, CutoverError>;

/// Errors from traffic switcher transitions.
#[derive(Debug, Error)]
pub enum CutoverError {
    /// A transition was attempted from a phase that does not permit it.
    /// Under the routing lock this can only mean two runs raced, which
    /// the run-level lock is supposed to prevent.
    #[error("routing conflict for {service}: cannot {attempted} while {phase:?}")]
    RoutingConflict {
        service: String,
        phase: RoutingPhase,
        attempted: &'static str,
    },

    #[error("no candidate replica set for {0}")]
    NoCandidate(String),

    #[error("state store error: {0}")]
    State(#[from] switchyard_state::StateError),

    #[error("replica set error: {0}")]
    Controller(#[from] switchyard_platform::controller::ControllerError),

    #[error("platform error: {0}")]
    Platform(#[from] switchyard_platform::PlatformError),
}
