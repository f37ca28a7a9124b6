//! Replica set lifecycle on top of the platform seam.
//!
//! The controller persists every set it creates, retries transient
//! provisioning failures with a bounded backoff, and keeps retirement
//! idempotent. Role transitions are not its business; those belong to
//! the traffic switcher.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use switchyard_state::{
    Artifact, InstanceRef, ReplicaSet, ReplicaSetRole, StateError, StateStore, epoch_secs,
};

use crate::platform::{ComputePlatform, LaunchSpec, PlatformError};

/// Result type alias for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors from replica set lifecycle operations.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Provisioning still failing after all retry attempts.
    #[error("provisioning failed after {attempts} attempts: {last}")]
    ProvisioningExhausted { attempts: u32, last: String },

    #[error("replica set not found: {0}")]
    NotFound(String),

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

/// Creates, inspects, and retires replica sets.
#[derive(Clone)]
pub struct ReplicaSetController {
    platform: Arc<dyn ComputePlatform>,
    store: StateStore,
    max_launch_attempts: u32,
    retry_backoff: Duration,
    sequence: Arc<AtomicU64>,
}

impl ReplicaSetController {
    pub fn new(platform: Arc<dyn ComputePlatform>, store: StateStore) -> Self {
        Self {
            platform,
            store,
            max_launch_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Override the provisioning retry policy (tests use a zero backoff).
    pub fn with_retry_policy(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_launch_attempts = max_attempts.max(1);
        self.retry_backoff = backoff;
        self
    }

    /// Create a new candidate replica set for an artifact.
    ///
    /// Launches the instances on the platform, retrying transient
    /// provisioning errors, and persists the set with role `Green`.
    /// No traffic is routed to the new set.
    pub async fn create(
        &self,
        service: &str,
        artifact: &Artifact,
        instance_count: u32,
        port: u16,
    ) -> ControllerResult<ReplicaSet> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let set_id = format!("{service}:{}:{}-{seq}", artifact.revision_id, epoch_secs());
        let spec = LaunchSpec {
            set_id: set_id.clone(),
            service: service.to_string(),
            image_reference: artifact.image_reference.clone(),
            instance_count,
            port,
        };

        let mut last_error = String::new();
        for attempt in 1..=self.max_launch_attempts {
            match self.platform.launch(spec.clone()).await {
                Ok(instances) => {
                    let set = ReplicaSet {
                        id: set_id,
                        service: service.to_string(),
                        artifact: artifact.clone(),
                        role: ReplicaSetRole::Green,
                        instance_count: instances.len() as u32,
                        desired_port: port,
                        created_at: epoch_secs(),
                    };
                    self.store.put_replica_set(&set)?;
                    info!(set = %set.id, revision = %artifact.revision_id, "replica set created");
                    return Ok(set);
                }
                Err(e) if e.is_retryable() && attempt < self.max_launch_attempts => {
                    warn!(
                        set = %set_id,
                        attempt,
                        error = %e,
                        "provisioning failed, retrying"
                    );
                    last_error = e.to_string();
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(e) if e.is_retryable() => {
                    last_error = e.to_string();
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ControllerError::ProvisioningExhausted {
            attempts: self.max_launch_attempts,
            last: last_error,
        })
    }

    /// Drain and remove a replica set. Idempotent; a set that is already
    /// retired (or whose record is gone) is a no-op.
    pub async fn retire(&self, set_id: &str) -> ControllerResult<()> {
        let Some(mut set) = self.store.get_replica_set(set_id)? else {
            return Ok(());
        };
        if set.role == ReplicaSetRole::Retired {
            return Ok(());
        }
        self.platform.terminate(set_id.to_string()).await?;
        set.role = ReplicaSetRole::Retired;
        self.store.put_replica_set(&set)?;
        info!(set = %set_id, "replica set retired");
        Ok(())
    }

    /// Running instances of a replica set (used by the health gate).
    pub async fn list_instances(&self, set_id: &str) -> ControllerResult<Vec<InstanceRef>> {
        match self.platform.instances(set_id.to_string()).await {
            Ok(instances) => Ok(instances),
            Err(PlatformError::UnknownReplicaSet(id)) => Err(ControllerError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch the persisted record for a set.
    pub fn get(&self, set_id: &str) -> ControllerResult<ReplicaSet> {
        self.store
            .get_replica_set(set_id)?
            .ok_or_else(|| ControllerError::NotFound(set_id.to_string()))
    }
}
