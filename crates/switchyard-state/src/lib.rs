//! switchyard-state — durable state for the Switchyard orchestrator.
//!
//! Everything the pipeline must remember across process restarts lives
//! here: registered build artifacts, replica sets, the per-service
//! routing singleton, pipeline run logs, and approval decisions. All
//! values are JSON-serialized into redb tables.
//!
//! # Components
//!
//! - **`types`** — persisted domain types (Artifact, ReplicaSet, RoutingState, PipelineRun, ...)
//! - **`store`** — typed CRUD over redb (on-disk or in-memory)
//! - **`registry`** — the artifact registry with insert-time deduplication

pub mod error;
pub mod registry;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use registry::ArtifactRegistry;
pub use store::StateStore;
pub use types::*;
