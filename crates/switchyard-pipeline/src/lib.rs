//! switchyard-pipeline — the pipeline-stage sequencer.
//!
//! Drives one artifact revision through the promotion pipeline:
//!
//! ```text
//! Source → Build → Deploy → PreCheck → Approval → Cutover → PostCheck → {Commit | Rollback}
//! ```
//!
//! Stages execute strictly in order; each appends a `StageResult` to the
//! persisted run log before the next begins. At most one run is active
//! per service — a second trigger is rejected, not queued. Failures with
//! a defined rollback edge (pre-check, approval, post-check) are handled
//! through the rollback manager and end the run as `RolledBack`; failures
//! without one abort the run as `Failed` with the prior live set untouched.
//!
//! # Components
//!
//! - **`approval`** — the manual gate: suspend until approve/reject or deadline
//! - **`build`** — the external build collaborator seam
//! - **`sequencer`** — stage ordering, cancellation, crash recovery
//! - **`orchestrator`** — one sequencer per service, trigger interface

pub mod approval;
pub mod build;
pub mod error;
pub mod orchestrator;
pub mod sequencer;

pub use approval::{ApprovalGate, PendingApproval};
pub use build::{BuildCollaborator, BuildError, BuiltImage, CommitTaggedBuilder};
pub use error::{PipelineError, PipelineResult};
pub use orchestrator::Orchestrator;
pub use sequencer::{PipelineSequencer, ServiceConfig};
