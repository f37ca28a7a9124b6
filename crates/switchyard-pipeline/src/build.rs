//! The external build collaborator seam.
//!
//! The build stage itself (container build and push) is someone else's
//! machinery; the pipeline only needs the resulting
//! `(revision_id, image_reference)` pair, or a failure that aborts the
//! run before any replica set is touched.

use std::pin::Pin;

use thiserror::Error;

/// Boxed future type for build collaborators.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Errors from the external build step.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("build failed for {revision}: {detail}")]
    Failed { revision: String, detail: String },
}

/// A successfully built and pushed image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    pub revision_id: String,
    pub image_reference: String,
}

/// External build+push collaborator.
pub trait BuildCollaborator: Send + Sync {
    fn build(&self, source_revision: &str) -> BoxFuture<Result<BuiltImage, BuildError>>;
}

/// Builder that derives the image reference from a repository prefix and
/// the source revision, mirroring a registry that tags pushes by commit.
pub struct CommitTaggedBuilder {
    repository: String,
}

impl CommitTaggedBuilder {
    pub fn new(repository: &str) -> Self {
        Self {
            repository: repository.to_string(),
        }
    }
}

impl BuildCollaborator for CommitTaggedBuilder {
    fn build(&self, source_revision: &str) -> BoxFuture<Result<BuiltImage, BuildError>> {
        let image = BuiltImage {
            revision_id: source_revision.to_string(),
            image_reference: format!("{}:{}", self.repository, source_revision),
        };
        Box::pin(async move { Ok(image) })
    }
}
