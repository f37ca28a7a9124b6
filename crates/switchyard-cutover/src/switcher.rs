//! The traffic switcher — role transitions and the entry-point flip.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use switchyard_health::Verdict;
use switchyard_platform::{ComputePlatform, ReplicaSetController};
use switchyard_state::{
    Artifact, ReplicaSet, ReplicaSetRole, RoutingPhase, RoutingState, StateStore, epoch_secs,
};

use crate::error::{CutoverError, CutoverResult};

/// What the sequencer should do after recording a gate result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Proceed,
    RollBack,
}

/// Owns the live/candidate assignment of one service's replica sets.
///
/// All `RoutingState` mutation funnels through this type under its
/// routing lock. Clones share the lock and the underlying stores.
#[derive(Clone)]
pub struct TrafficSwitcher {
    service: String,
    store: StateStore,
    controller: ReplicaSetController,
    platform: Arc<dyn ComputePlatform>,
    routing_lock: Arc<Mutex<()>>,
}

impl TrafficSwitcher {
    pub fn new(
        service: &str,
        store: StateStore,
        controller: ReplicaSetController,
        platform: Arc<dyn ComputePlatform>,
    ) -> Self {
        Self {
            service: service.to_string(),
            store,
            controller,
            platform,
            routing_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn controller(&self) -> &ReplicaSetController {
        &self.controller
    }

    /// Current routing state, bootstrapping a fresh one for a service
    /// that has never deployed.
    pub fn routing(&self) -> CutoverResult<RoutingState> {
        Ok(self
            .store
            .get_routing(&self.service)?
            .unwrap_or_else(|| RoutingState::bootstrap(&self.service)))
    }

    fn persist(&self, routing: &mut RoutingState) -> CutoverResult<()> {
        routing.updated_at = epoch_secs();
        self.store.put_routing(routing)?;
        Ok(())
    }

    fn conflict(&self, phase: RoutingPhase, attempted: &'static str) -> CutoverError {
        CutoverError::RoutingConflict {
            service: self.service.clone(),
            phase,
            attempted,
        }
    }

    /// `Idle → Deploying`: create the candidate replica set.
    ///
    /// Any leftover retiring set from the previous promotion is cleared
    /// first. No traffic is directed at the candidate. If provisioning
    /// fails the phase is restored so the prior live set is untouched.
    pub async fn begin_deploy(
        &self,
        artifact: &Artifact,
        instance_count: u32,
        port: u16,
    ) -> CutoverResult<ReplicaSet> {
        let _guard = self.routing_lock.lock().await;
        let mut routing = self.routing()?;

        if !matches!(routing.phase, RoutingPhase::Idle | RoutingPhase::Committed) {
            return Err(self.conflict(routing.phase, "begin deploy"));
        }
        if routing.candidate_set_id.is_some() {
            return Err(self.conflict(routing.phase, "begin deploy with existing candidate"));
        }

        // The old live set of the previous run is destroyed by the next
        // pipeline run once its grace period is over; sweep it here in
        // case the grace timer never fired (process restart).
        for set in self.store.list_replica_sets_for_service(&self.service)? {
            if set.role == ReplicaSetRole::Retiring {
                self.controller.retire(&set.id).await?;
            }
        }

        routing.phase = RoutingPhase::Deploying;
        self.persist(&mut routing)?;

        match self
            .controller
            .create(&self.service, artifact, instance_count, port)
            .await
        {
            Ok(set) => {
                routing.candidate_set_id = Some(set.id.clone());
                self.persist(&mut routing)?;
                info!(service = %self.service, candidate = %set.id, "deploy started");
                Ok(set)
            }
            Err(e) => {
                // Prior live set untouched; the run aborts as Failed.
                routing.phase = RoutingPhase::Idle;
                routing.candidate_set_id = None;
                self.persist(&mut routing)?;
                Err(e.into())
            }
        }
    }

    /// `Deploying → PreCheck`: the candidate's instances are running.
    pub async fn mark_deployed(&self) -> CutoverResult<()> {
        let _guard = self.routing_lock.lock().await;
        let mut routing = self.routing()?;
        if routing.phase != RoutingPhase::Deploying {
            return Err(self.conflict(routing.phase, "enter pre-check"));
        }
        routing.phase = RoutingPhase::PreCheck;
        self.persist(&mut routing)
    }

    /// `PreCheck → AwaitingApproval` on a healthy verdict; anything else
    /// is a deploy defect and goes straight to `RollingBack` without
    /// ever reaching a human.
    pub async fn record_precheck(&self, verdict: Verdict) -> CutoverResult<GateOutcome> {
        let _guard = self.routing_lock.lock().await;
        let mut routing = self.routing()?;
        if routing.phase != RoutingPhase::PreCheck {
            return Err(self.conflict(routing.phase, "record pre-check"));
        }
        if verdict == Verdict::Healthy {
            routing.phase = RoutingPhase::AwaitingApproval;
            self.persist(&mut routing)?;
            Ok(GateOutcome::Proceed)
        } else {
            warn!(service = %self.service, ?verdict, "pre-check failed, rolling back");
            routing.phase = RoutingPhase::RollingBack;
            self.persist(&mut routing)?;
            Ok(GateOutcome::RollBack)
        }
    }

    /// `AwaitingApproval → Cutover` on approval; rejection or a lapsed
    /// deadline goes to `RollingBack`.
    pub async fn record_approval(&self, approved: bool) -> CutoverResult<GateOutcome> {
        let _guard = self.routing_lock.lock().await;
        let mut routing = self.routing()?;
        if routing.phase != RoutingPhase::AwaitingApproval {
            return Err(self.conflict(routing.phase, "record approval"));
        }
        if approved {
            routing.phase = RoutingPhase::Cutover;
            self.persist(&mut routing)?;
            Ok(GateOutcome::Proceed)
        } else {
            routing.phase = RoutingPhase::RollingBack;
            self.persist(&mut routing)?;
            Ok(GateOutcome::RollBack)
        }
    }

    /// The cutover itself: atomically reassign the public entry point to
    /// the candidate. The former live set keeps running as `Retiring` so
    /// in-flight requests drain and instant rollback stays possible.
    pub async fn cut_over(&self) -> CutoverResult<()> {
        let _guard = self.routing_lock.lock().await;
        let mut routing = self.routing()?;
        if routing.phase != RoutingPhase::Cutover {
            return Err(self.conflict(routing.phase, "cut over"));
        }
        let candidate_id = routing
            .candidate_set_id
            .clone()
            .ok_or_else(|| CutoverError::NoCandidate(self.service.clone()))?;

        self.platform
            .assign_entry_point(self.service.clone(), candidate_id.clone())
            .await?;

        // Traffic is on the candidate from here on. Demote the former
        // live set and persist the pointer swap before anything else, so
        // that a crash mid-cutover leaves recovery a trail back to the
        // previous live set (rollback consults the platform target when
        // the persisted pointer disagrees with reality).
        if let Some(old_live_id) = routing.live_set_id.clone() {
            let mut old = self.controller.get(&old_live_id)?;
            old.role = ReplicaSetRole::Retiring;
            self.store.put_replica_set(&old)?;
        }
        routing.live_set_id = Some(candidate_id.clone());
        self.persist(&mut routing)?;

        let mut candidate = self.controller.get(&candidate_id)?;
        candidate.role = ReplicaSetRole::Blue;
        self.store.put_replica_set(&candidate)?;
        info!(service = %self.service, live = %candidate_id, "entry point cut over to candidate");
        Ok(())
    }

    /// `Cutover → PostCheck`: verify the new live set on the public route.
    pub async fn begin_postcheck(&self) -> CutoverResult<()> {
        let _guard = self.routing_lock.lock().await;
        let mut routing = self.routing()?;
        if routing.phase != RoutingPhase::Cutover {
            return Err(self.conflict(routing.phase, "enter post-check"));
        }
        routing.phase = RoutingPhase::PostCheck;
        self.persist(&mut routing)
    }

    /// `PostCheck → Committed` on a healthy verdict; a failed post-check
    /// is the highest-severity path (production saw the bad version) and
    /// moves to `RollingBack` for a synchronous revert.
    pub async fn record_postcheck(&self, verdict: Verdict) -> CutoverResult<GateOutcome> {
        let _guard = self.routing_lock.lock().await;
        let mut routing = self.routing()?;
        if routing.phase != RoutingPhase::PostCheck {
            return Err(self.conflict(routing.phase, "record post-check"));
        }
        if verdict == Verdict::Healthy {
            Ok(GateOutcome::Proceed)
        } else {
            warn!(service = %self.service, ?verdict, "post-check failed after cutover, rolling back");
            routing.phase = RoutingPhase::RollingBack;
            self.persist(&mut routing)?;
            Ok(GateOutcome::RollBack)
        }
    }

    /// `PostCheck → Committed`: clear the candidate pointer and retire
    /// the old set once the termination grace period allows in-flight
    /// requests on it to drain.
    pub async fn commit(&self, termination_wait: Duration) -> CutoverResult<()> {
        let _guard = self.routing_lock.lock().await;
        let mut routing = self.routing()?;
        if routing.phase != RoutingPhase::PostCheck {
            return Err(self.conflict(routing.phase, "commit"));
        }

        routing.candidate_set_id = None;
        routing.phase = RoutingPhase::Committed;
        self.persist(&mut routing)?;

        let retiring: Vec<ReplicaSet> = self
            .store
            .list_replica_sets_for_service(&self.service)?
            .into_iter()
            .filter(|set| set.role == ReplicaSetRole::Retiring)
            .collect();
        for set in retiring {
            let controller = self.controller.clone();
            let set_id = set.id.clone();
            if termination_wait.is_zero() {
                controller.retire(&set_id).await?;
            } else {
                info!(set = %set_id, wait = ?termination_wait, "old live set retiring after grace period");
                tokio::spawn(async move {
                    tokio::time::sleep(termination_wait).await;
                    if let Err(e) = controller.retire(&set_id).await {
                        warn!(set = %set_id, error = %e, "deferred retirement failed");
                    }
                });
            }
        }

        info!(service = %self.service, live = ?routing.live_set_id, "promotion committed");
        Ok(())
    }

    /// Mark the state machine as rolling back. Used by the sequencer for
    /// cancellation and crash recovery; gate failures set the phase
    /// through their `record_*` methods.
    pub async fn mark_rolling_back(&self) -> CutoverResult<()> {
        let _guard = self.routing_lock.lock().await;
        let mut routing = self.routing()?;
        match routing.phase {
            RoutingPhase::Idle | RoutingPhase::Committed => {
                Err(self.conflict(routing.phase, "roll back"))
            }
            _ => {
                routing.phase = RoutingPhase::RollingBack;
                self.persist(&mut routing)
            }
        }
    }

    /// Revert to the previous stable assignment. See [`crate::RollbackManager`]
    /// for the public entry point; this runs under the routing lock.
    ///
    /// Idempotent: a state that is already `Idle` or `Committed` is
    /// returned unchanged.
    pub(crate) async fn execute_rollback(&self) -> CutoverResult<RoutingState> {
        let _guard = self.routing_lock.lock().await;
        let mut routing = self.routing()?;

        if matches!(routing.phase, RoutingPhase::Idle | RoutingPhase::Committed) {
            return Ok(routing);
        }

        let candidate_id = routing.candidate_set_id.clone();

        // If traffic already moved to the candidate, re-assert the
        // previous live set (still running as Retiring) first. The
        // platform's routing table is the authority here, not the
        // persisted pointer: a crash between the entry-point flip and
        // the state write leaves the two disagreeing.
        let target = self.platform.entry_point_target(self.service.clone()).await;
        let traffic_on_candidate = match (&target, &candidate_id) {
            (Some(target), Some(candidate)) => target == candidate,
            _ => false,
        };
        if traffic_on_candidate {
            let mut previous = self
                .store
                .list_replica_sets_for_service(&self.service)?
                .into_iter()
                .find(|set| set.role == ReplicaSetRole::Retiring);
            // The demotion write may not have landed either; in that
            // window the persisted pointer still names the previous
            // live set.
            if previous.is_none() {
                if let Some(live_id) = routing.live_set_id.clone() {
                    if Some(&live_id) != candidate_id.as_ref() {
                        previous = self.store.get_replica_set(&live_id)?;
                    }
                }
            }
            match previous {
                Some(mut prev) => {
                    self.platform
                        .assign_entry_point(self.service.clone(), prev.id.clone())
                        .await?;
                    prev.role = ReplicaSetRole::Blue;
                    self.store.put_replica_set(&prev)?;
                    routing.live_set_id = Some(prev.id.clone());
                    info!(service = %self.service, live = %prev.id, "traffic reverted to previous live set");
                }
                None => {
                    // Bootstrap promotion gone bad: there is no previous
                    // set to fall back to.
                    routing.live_set_id = None;
                    warn!(service = %self.service, "rollback with no previous live set");
                }
            }
        }

        if let Some(candidate_id) = candidate_id {
            self.controller.retire(&candidate_id).await?;
        }

        routing.candidate_set_id = None;
        routing.phase = RoutingPhase::Idle;
        self.persist(&mut routing)?;
        info!(service = %self.service, live = ?routing.live_set_id, "rollback complete");
        Ok(routing)
    }
}
