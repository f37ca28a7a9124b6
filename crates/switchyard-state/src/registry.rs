//! Artifact registry — immutable build artifacts keyed by revision.
//!
//! The build stage hands a `(revision_id, image_reference)` pair to the
//! registry after a successful build and push. A revision maps to exactly
//! one image forever; re-registering the same pair is a no-op.

use tracing::info;

use crate::error::{StateError, StateResult};
use crate::store::StateStore;
use crate::types::{Artifact, epoch_secs};

/// Registry of immutable build artifacts, backed by the state store.
#[derive(Clone)]
pub struct ArtifactRegistry {
    store: StateStore,
}

impl ArtifactRegistry {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Register a built artifact.
    ///
    /// Idempotent for an identical `(revision_id, image_reference)` pair;
    /// fails with `DuplicateRevision` when the revision is already bound
    /// to a different image.
    pub fn register(&self, revision_id: &str, image_reference: &str) -> StateResult<Artifact> {
        let artifact = Artifact {
            revision_id: revision_id.to_string(),
            image_reference: image_reference.to_string(),
            created_at: epoch_secs(),
        };
        let stored = self.store.insert_artifact(&artifact)?;
        info!(revision = %revision_id, image = %image_reference, "artifact registered");
        Ok(stored)
    }

    /// Look up an artifact by revision id.
    pub fn get(&self, revision_id: &str) -> StateResult<Artifact> {
        self.store
            .get_artifact(revision_id)?
            .ok_or_else(|| StateError::NotFound(format!("artifact {revision_id}")))
    }
}
