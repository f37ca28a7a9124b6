//! The `ComputePlatform` trait — what Switchyard asks of the platform.
//!
//! Methods return boxed futures so the platform can live behind
//! `Arc<dyn ComputePlatform>` and be shared across the switcher, the
//! controller, and background retirement tasks.

use std::pin::Pin;

use thiserror::Error;

use switchyard_state::{InstanceRef, ReplicaSetId};

/// Boxed future type for trait methods.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Result type alias for platform operations.
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Errors surfaced by the compute platform.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Transient capacity or scheduling failure; safe to retry.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("unknown replica set: {0}")]
    UnknownReplicaSet(String),

    /// Entry-point reassignment failed.
    #[error("routing error: {0}")]
    Routing(String),
}

impl PlatformError {
    /// Whether the caller may retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlatformError::Provisioning(_))
    }
}

/// What to launch for a new replica set.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub set_id: ReplicaSetId,
    pub service: String,
    pub image_reference: String,
    pub instance_count: u32,
    /// Port the instances listen on; doubles as the internal test route.
    pub port: u16,
}

/// Capability interface over whatever compute platform is available.
///
/// Launching does not route any traffic to the new set; traffic moves
/// only through `assign_entry_point`, which must be atomic from the
/// perspective of external connections.
pub trait ComputePlatform: Send + Sync {
    /// Launch the instances of a new replica set. Returns the running
    /// (not necessarily healthy) instances.
    fn launch(&self, spec: LaunchSpec) -> BoxFuture<PlatformResult<Vec<InstanceRef>>>;

    /// Drain and remove a replica set's instances. Idempotent; removing
    /// an unknown or already-terminated set is a no-op.
    fn terminate(&self, set_id: ReplicaSetId) -> BoxFuture<PlatformResult<()>>;

    /// Enumerate the running instances of a replica set.
    fn instances(&self, set_id: ReplicaSetId) -> BoxFuture<PlatformResult<Vec<InstanceRef>>>;

    /// Point the service's public entry point at the given replica set.
    /// All new connections land on that set once this returns.
    fn assign_entry_point(
        &self,
        service: String,
        set_id: ReplicaSetId,
    ) -> BoxFuture<PlatformResult<()>>;

    /// Which replica set the entry point currently targets, if any.
    fn entry_point_target(&self, service: String) -> BoxFuture<Option<ReplicaSetId>>;
}
