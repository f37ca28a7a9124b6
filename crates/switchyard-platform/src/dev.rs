//! In-process compute platform for dev mode and tests.
//!
//! `DevPlatform` keeps replica sets and the entry-point table in a
//! mutex-guarded map. It launches nothing real; instances get loopback
//! addresses derived from the requested port. Failure-injection knobs
//! let tests exercise the provisioning retry path.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, info};

use switchyard_state::{InstanceRef, ReplicaSetId};

use crate::platform::{BoxFuture, ComputePlatform, LaunchSpec, PlatformError, PlatformResult};

#[derive(Default)]
struct DevState {
    /// set_id → running instances.
    sets: HashMap<ReplicaSetId, Vec<InstanceRef>>,
    /// service → set_id currently wired to the entry point.
    entry_points: HashMap<String, ReplicaSetId>,
    /// Number of upcoming launches that should fail with a
    /// provisioning error.
    launch_failures: u32,
}

/// In-memory platform implementation.
#[derive(Default)]
pub struct DevPlatform {
    state: Mutex<DevState>,
}

impl DevPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` launches fail with a retryable provisioning error.
    pub fn inject_provisioning_failures(&self, n: u32) {
        self.state.lock().unwrap().launch_failures = n;
    }

    /// Current entry-point target for a service (test assertion helper).
    pub fn current_target(&self, service: &str) -> Option<ReplicaSetId> {
        self.state.lock().unwrap().entry_points.get(service).cloned()
    }

    /// Number of live (not terminated) replica sets.
    pub fn live_set_count(&self) -> usize {
        self.state.lock().unwrap().sets.len()
    }

    /// Whether a replica set still has running instances.
    pub fn is_running(&self, set_id: &str) -> bool {
        self.state.lock().unwrap().sets.contains_key(set_id)
    }
}

impl ComputePlatform for DevPlatform {
    fn launch(&self, spec: LaunchSpec) -> BoxFuture<PlatformResult<Vec<InstanceRef>>> {
        let result = {
            let mut state = self.state.lock().unwrap();
            if state.launch_failures > 0 {
                state.launch_failures -= 1;
                Err(PlatformError::Provisioning(format!(
                    "no capacity for {} instances of {}",
                    spec.instance_count, spec.service
                )))
            } else {
                let instances: Vec<InstanceRef> = (0..spec.instance_count)
                    .map(|i| InstanceRef {
                        id: format!("{}/inst-{i}", spec.set_id),
                        address: format!("127.0.0.1:{}", spec.port),
                        port: spec.port,
                    })
                    .collect();
                state.sets.insert(spec.set_id.clone(), instances.clone());
                info!(set = %spec.set_id, count = spec.instance_count, "dev platform launched replica set");
                Ok(instances)
            }
        };
        Box::pin(async move { result })
    }

    fn terminate(&self, set_id: ReplicaSetId) -> BoxFuture<PlatformResult<()>> {
        let removed = self.state.lock().unwrap().sets.remove(&set_id).is_some();
        debug!(set = %set_id, removed, "dev platform terminate");
        Box::pin(async move { Ok(()) })
    }

    fn instances(&self, set_id: ReplicaSetId) -> BoxFuture<PlatformResult<Vec<InstanceRef>>> {
        let result = self
            .state
            .lock()
            .unwrap()
            .sets
            .get(&set_id)
            .cloned()
            .ok_or(PlatformError::UnknownReplicaSet(set_id));
        Box::pin(async move { result })
    }

    fn assign_entry_point(
        &self,
        service: String,
        set_id: ReplicaSetId,
    ) -> BoxFuture<PlatformResult<()>> {
        let result = {
            let mut state = self.state.lock().unwrap();
            if !state.sets.contains_key(&set_id) {
                Err(PlatformError::Routing(format!(
                    "cannot route {service} to unknown set {set_id}"
                )))
            } else {
                state.entry_points.insert(service.clone(), set_id.clone());
                info!(%service, set = %set_id, "entry point reassigned");
                Ok(())
            }
        };
        Box::pin(async move { result })
    }

    fn entry_point_target(&self, service: String) -> BoxFuture<Option<ReplicaSetId>> {
        let target = self.state.lock().unwrap().entry_points.get(&service).cloned();
        Box::pin(async move { target })
    }
}
