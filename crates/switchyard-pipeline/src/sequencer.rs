//! The pipeline sequencer — strict stage ordering for one service.
//!
//! One sequencer exists per service. It owns the run-level exclusive
//! lock (one active run at a time, later triggers rejected) and drives
//! the traffic switcher through its transitions, recording a
//! `StageResult` per stage into the persisted run log before the next
//! stage starts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info, warn};

use switchyard_cutover::{GateOutcome, RollbackManager, TrafficSwitcher};
use switchyard_health::{HealthGate, ProbeConfig, ProbeRoute};
use switchyard_state::{
    ArtifactRegistry, Decision, PipelineRun, RoutingPhase, RunOutcome, StageName, StageOutcome,
    StageResult, StateStore, epoch_secs,
};

use crate::approval::ApprovalGate;
use crate::build::BuildCollaborator;
use crate::error::{PipelineError, PipelineResult};

/// Per-service pipeline configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    /// Instances per replica set.
    pub instance_count: u32,
    /// Port the instances listen on (the internal test route).
    pub port: u16,
    /// Public entry-point address, probed during post-check.
    pub entry_point: String,
    /// Health gate parameters, shared by pre- and post-check.
    pub probe: ProbeConfig,
    /// How long the approval gate waits before treating silence as a
    /// rejection.
    pub approval_deadline: Duration,
    /// Grace period before the old live set is torn down after a
    /// committed cutover.
    pub termination_wait: Duration,
}

impl ServiceConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            instance_count: 2,
            port: 8080,
            entry_point: "127.0.0.1:80".to_string(),
            probe: ProbeConfig::default(),
            approval_deadline: Duration::from_secs(3600),
            termination_wait: Duration::from_secs(60),
        }
    }
}

/// Executes pipeline runs for one service, strictly one at a time.
pub struct PipelineSequencer {
    config: ServiceConfig,
    store: StateStore,
    registry: ArtifactRegistry,
    switcher: TrafficSwitcher,
    rollback: RollbackManager,
    gate: HealthGate,
    approvals: ApprovalGate,
    builder: Arc<dyn BuildCollaborator>,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
    run_seq: AtomicU64,
}

impl PipelineSequencer {
    pub fn new(
        config: ServiceConfig,
        store: StateStore,
        switcher: TrafficSwitcher,
        gate: HealthGate,
        approvals: ApprovalGate,
        builder: Arc<dyn BuildCollaborator>,
    ) -> Self {
        Self {
            config,
            registry: ArtifactRegistry::new(store.clone()),
            store,
            rollback: RollbackManager::new(switcher.clone()),
            switcher,
            gate,
            approvals,
            builder,
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
            cancel_flags: Mutex::new(HashMap::new()),
            run_seq: AtomicU64::new(0),
        }
    }

    pub fn service(&self) -> &str {
        &self.config.name
    }

    pub fn switcher(&self) -> &TrafficSwitcher {
        &self.switcher
    }

    fn next_run_id(&self) -> String {
        let seq = self.run_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{seq}", self.config.name, epoch_secs())
    }

    /// Execute a full pipeline run to completion.
    ///
    /// Returns the terminal run record. Stage failures are reported
    /// through `PipelineRun.outcome` and the per-stage detail strings,
    /// not as errors; only trigger-time rejections (a run already in
    /// flight) and invariant violations surface as `Err`.
    pub async fn run(&self, source_revision: &str) -> PipelineResult<PipelineRun> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            return Err(PipelineError::RunInProgress(self.config.name.clone()));
        };

        let run_id = self.next_run_id();
        let mut run = PipelineRun::new(&run_id, &self.config.name, source_revision);
        self.store.put_run(&run)?;

        let cancel = Arc::new(AtomicBool::new(false));
        self.cancel_flags
            .lock()
            .unwrap()
            .insert(run_id.clone(), cancel.clone());

        info!(%run_id, service = %self.config.name, revision = %source_revision, "pipeline run started");
        let result = self.execute(&mut run, &cancel).await;
        self.cancel_flags.lock().unwrap().remove(&run_id);
        result?;
        info!(%run_id, outcome = ?run.outcome, "pipeline run finished");
        Ok(run)
    }

    /// Trigger a run in the background, returning its id immediately.
    /// This is the `onNewRevision` entry point.
    pub fn start(self: &Arc<Self>, source_revision: &str) -> PipelineResult<String> {
        let Ok(guard) = self.run_lock.clone().try_lock_owned() else {
            return Err(PipelineError::RunInProgress(self.config.name.clone()));
        };

        let run_id = self.next_run_id();
        let mut run = PipelineRun::new(&run_id, &self.config.name, source_revision);
        self.store.put_run(&run)?;

        let cancel = Arc::new(AtomicBool::new(false));
        self.cancel_flags
            .lock()
            .unwrap()
            .insert(run_id.clone(), cancel.clone());

        let this = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            info!(run_id = %run.run_id, service = %this.config.name, "pipeline run started");
            if let Err(e) = this.execute(&mut run, &cancel).await {
                error!(run_id = %run.run_id, error = %e, "pipeline run aborted on internal error");
            }
            this.cancel_flags.lock().unwrap().remove(&run.run_id);
        });
        Ok(run_id)
    }

    /// Request cancellation of an active run.
    ///
    /// Only honored while the routing phase is still Idle, Deploying, or
    /// PreCheck; once cutover preparation begins the run must reach a
    /// terminal state on its own.
    pub fn cancel(&self, run_id: &str) -> PipelineResult<()> {
        let flags = self.cancel_flags.lock().unwrap();
        let Some(flag) = flags.get(run_id) else {
            return Err(PipelineError::NoActiveRun(run_id.to_string()));
        };
        let routing = self.switcher.routing()?;
        match routing.phase {
            RoutingPhase::Idle | RoutingPhase::Deploying | RoutingPhase::PreCheck => {
                flag.store(true, Ordering::SeqCst);
                info!(%run_id, "cancellation requested");
                Ok(())
            }
            _ => Err(PipelineError::CancelTooLate(run_id.to_string())),
        }
    }

    /// Close out runs interrupted by a process restart.
    ///
    /// The stage a run died in is re-derived from its persisted stage
    /// log and the routing phase. Runs that died at or past cutover are
    /// rolled back; earlier ones only need their candidate cleaned up.
    pub async fn resume_incomplete(&self) -> PipelineResult<u32> {
        let mut closed = 0;
        for mut run in self.store.list_incomplete_runs()? {
            if run.service != self.config.name {
                continue;
            }
            let routing = self.switcher.routing()?;
            warn!(
                run_id = %run.run_id,
                phase = ?routing.phase,
                stages = run.stages.len(),
                "closing run interrupted by restart"
            );
            let now = epoch_secs();
            let (outcome, stage, stage_outcome) = match routing.phase {
                RoutingPhase::Cutover | RoutingPhase::PostCheck | RoutingPhase::RollingBack => {
                    self.rollback.rollback().await?;
                    (RunOutcome::RolledBack, StageName::Rollback, StageOutcome::RolledBack)
                }
                RoutingPhase::Deploying
                | RoutingPhase::PreCheck
                | RoutingPhase::AwaitingApproval => {
                    self.rollback.rollback().await?;
                    (RunOutcome::Failed, StageName::Rollback, StageOutcome::RolledBack)
                }
                // Routing was never touched (or already settled), so
                // nothing is rolled back; close the stage the run died in.
                RoutingPhase::Idle | RoutingPhase::Committed => {
                    (RunOutcome::Failed, next_stage(&run), StageOutcome::Failed)
                }
            };
            run.stages.push(StageResult {
                name: stage,
                outcome: stage_outcome,
                started_at: now,
                finished_at: now,
                detail: "interrupted by restart".to_string(),
            });
            run.outcome = outcome;
            run.finished_at = Some(now);
            self.store.put_run(&run)?;
            closed += 1;
        }
        Ok(closed)
    }

    // ── Stage machinery ────────────────────────────────────────────

    fn record(
        &self,
        run: &mut PipelineRun,
        name: StageName,
        outcome: StageOutcome,
        started_at: u64,
        detail: &str,
    ) -> PipelineResult<()> {
        run.stages.push(StageResult {
            name,
            outcome,
            started_at,
            finished_at: epoch_secs(),
            detail: detail.to_string(),
        });
        self.store.put_run(run)?;
        Ok(())
    }

    /// Abort the run with no rollback edge: outcome `Failed`.
    fn fail(
        &self,
        run: &mut PipelineRun,
        name: StageName,
        started_at: u64,
        detail: &str,
    ) -> PipelineResult<()> {
        warn!(run_id = %run.run_id, stage = %name, %detail, "stage failed, aborting run");
        self.record(run, name, StageOutcome::Failed, started_at, detail)?;
        run.outcome = RunOutcome::Failed;
        run.finished_at = Some(epoch_secs());
        self.store.put_run(run)?;
        Ok(())
    }

    /// Take the rollback edge and terminate the run.
    async fn roll_back(
        &self,
        run: &mut PipelineRun,
        detail: &str,
        outcome: RunOutcome,
    ) -> PipelineResult<()> {
        let started = epoch_secs();
        self.rollback.rollback().await?;
        self.record(run, StageName::Rollback, StageOutcome::RolledBack, started, detail)?;
        run.outcome = outcome;
        run.finished_at = Some(epoch_secs());
        self.store.put_run(run)?;
        Ok(())
    }

    fn cancel_requested(&self, cancel: &AtomicBool) -> bool {
        cancel.load(Ordering::SeqCst)
    }

    async fn execute(&self, run: &mut PipelineRun, cancel: &AtomicBool) -> PipelineResult<()> {
        // Source: the revision arrives from the trigger; reject the
        // degenerate case before anything is built.
        let started = epoch_secs();
        if run.source_revision.trim().is_empty() {
            return self.fail(run, StageName::Source, started, "empty source revision");
        }
        self.record(
            run,
            StageName::Source,
            StageOutcome::Succeeded,
            started,
            &format!("revision {}", run.source_revision),
        )?;

        // Build: external collaborator, then artifact registration.
        // Failure here aborts before any replica set is touched.
        let started = epoch_secs();
        let image = match self.builder.build(&run.source_revision).await {
            Ok(image) => image,
            Err(e) => return self.fail(run, StageName::Build, started, &e.to_string()),
        };
        let artifact = match self.registry.register(&image.revision_id, &image.image_reference) {
            Ok(artifact) => artifact,
            Err(e) => return self.fail(run, StageName::Build, started, &e.to_string()),
        };
        self.record(
            run,
            StageName::Build,
            StageOutcome::Succeeded,
            started,
            &artifact.image_reference,
        )?;

        if self.cancel_requested(cancel) {
            return self.fail(run, StageName::Deploy, epoch_secs(), "cancelled before deploy");
        }

        // Deploy: create the candidate replica set.
        let started = epoch_secs();
        let candidate = match self
            .switcher
            .begin_deploy(&artifact, self.config.instance_count, self.config.port)
            .await
        {
            Ok(set) => set,
            // Provisioning exhaustion and friends: no rollback edge, the
            // prior live set was never touched.
            Err(e) => return self.fail(run, StageName::Deploy, started, &e.to_string()),
        };
        self.switcher.mark_deployed().await?;
        self.record(
            run,
            StageName::Deploy,
            StageOutcome::Succeeded,
            started,
            &format!("candidate {}", candidate.id),
        )?;

        if self.cancel_requested(cancel) {
            self.record(
                run,
                StageName::PreCheck,
                StageOutcome::Failed,
                epoch_secs(),
                "cancelled",
            )?;
            self.switcher.mark_rolling_back().await?;
            return self.roll_back(run, "cancelled during deploy", RunOutcome::Failed).await;
        }

        // PreCheck: candidate health on the internal test route. No
        // production traffic is at risk yet, so a failure is a deploy
        // defect handled without human escalation.
        let started = epoch_secs();
        let instances = match self.switcher.controller().list_instances(&candidate.id).await {
            Ok(instances) => instances,
            Err(e) => {
                self.record(run, StageName::PreCheck, StageOutcome::Failed, started, &e.to_string())?;
                self.switcher.mark_rolling_back().await?;
                return self.roll_back(run, "instance discovery failed", RunOutcome::Failed).await;
            }
        };
        let verdict = self
            .gate
            .check(&instances, &ProbeRoute::Internal, &self.config.probe)
            .await;

        if self.cancel_requested(cancel) {
            self.record(run, StageName::PreCheck, StageOutcome::Failed, started, "cancelled")?;
            self.switcher.mark_rolling_back().await?;
            return self.roll_back(run, "cancelled during pre-check", RunOutcome::Failed).await;
        }

        match self.switcher.record_precheck(verdict).await? {
            GateOutcome::Proceed => {
                self.record(run, StageName::PreCheck, StageOutcome::Succeeded, started, "healthy")?;
                // Last window where a cancellation accepted during
                // PreCheck can still land.
                if self.cancel_requested(cancel) {
                    self.switcher.mark_rolling_back().await?;
                    return self
                        .roll_back(run, "cancelled during pre-check", RunOutcome::Failed)
                        .await;
                }
            }
            GateOutcome::RollBack => {
                self.record(
                    run,
                    StageName::PreCheck,
                    StageOutcome::Failed,
                    started,
                    &format!("{verdict:?}"),
                )?;
                return self
                    .roll_back(run, "pre-check failed", RunOutcome::RolledBack)
                    .await;
            }
        }

        // Approval: suspend until a decision or the deadline.
        let started = epoch_secs();
        let pending = self.approvals.request(&run.run_id)?;
        let decision = self
            .approvals
            .await_decision(pending, self.config.approval_deadline)
            .await?;
        match self
            .switcher
            .record_approval(decision == Decision::Approved)
            .await?
        {
            GateOutcome::Proceed => {
                self.record(run, StageName::Approval, StageOutcome::Succeeded, started, "approved")?;
            }
            GateOutcome::RollBack => {
                self.record(
                    run,
                    StageName::Approval,
                    StageOutcome::Failed,
                    started,
                    "rejected or deadline lapsed",
                )?;
                return self
                    .roll_back(run, "approval not granted", RunOutcome::RolledBack)
                    .await;
            }
        }

        // Cutover: the atomic entry-point flip.
        let started = epoch_secs();
        if let Err(e) = self.switcher.cut_over().await {
            // Traffic never moved; clean up the candidate and abort.
            self.record(run, StageName::Cutover, StageOutcome::Failed, started, &e.to_string())?;
            self.switcher.mark_rolling_back().await?;
            return self.roll_back(run, "cutover failed", RunOutcome::Failed).await;
        }
        self.record(
            run,
            StageName::Cutover,
            StageOutcome::Succeeded,
            started,
            "entry point reassigned to candidate",
        )?;

        // PostCheck: the new live set on the public route. Production is
        // exposed now, so a failure reverts synchronously before the run
        // returns.
        let started = epoch_secs();
        self.switcher.begin_postcheck().await?;
        let live_instances = match self.switcher.controller().list_instances(&candidate.id).await {
            Ok(instances) => instances,
            Err(_) => Vec::new(), // An unreachable live set must fail the gate.
        };
        let route = ProbeRoute::Public {
            entry_point: self.config.entry_point.clone(),
        };
        let verdict = self.gate.check(&live_instances, &route, &self.config.probe).await;
        match self.switcher.record_postcheck(verdict).await? {
            GateOutcome::Proceed => {
                self.record(run, StageName::PostCheck, StageOutcome::Succeeded, started, "healthy")?;
            }
            GateOutcome::RollBack => {
                self.record(
                    run,
                    StageName::PostCheck,
                    StageOutcome::Failed,
                    started,
                    &format!("{verdict:?}"),
                )?;
                return self
                    .roll_back(run, "post-check failed after cutover", RunOutcome::RolledBack)
                    .await;
            }
        }

        // Commit: clear the candidate pointer; the old set drains out.
        let started = epoch_secs();
        self.switcher.commit(self.config.termination_wait).await?;
        self.record(
            run,
            StageName::Commit,
            StageOutcome::Succeeded,
            started,
            &format!("live set {}", candidate.id),
        )?;
        run.outcome = RunOutcome::Succeeded;
        run.finished_at = Some(epoch_secs());
        self.store.put_run(run)?;
        Ok(())
    }
}

/// Pipeline stages in execution order.
const STAGE_ORDER: [StageName; 8] = [
    StageName::Source,
    StageName::Build,
    StageName::Deploy,
    StageName::PreCheck,
    StageName::Approval,
    StageName::Cutover,
    StageName::PostCheck,
    StageName::Commit,
];

/// The stage an interrupted run died in, derived from how many stages
/// it recorded before the process went away.
fn next_stage(run: &PipelineRun) -> StageName {
    STAGE_ORDER
        .get(run.stages.len())
        .copied()
        .unwrap_or(StageName::Commit)
}

#[cfg(test)]
mod tests {
    use super::*;

    use switchyard_health::probe::BoxFuture;
    use switchyard_health::{ProbeResult, Prober, Verdict};
    use switchyard_platform::{DevPlatform, ReplicaSetController};
    use switchyard_state::{InstanceRef, RoutingState};

    use crate::build::CommitTaggedBuilder;

    /// Prober that answers by route, so pre-check and post-check can be
    /// steered independently.
    struct RouteProber {
        internal: Mutex<ProbeResult>,
        public: Mutex<ProbeResult>,
    }

    impl RouteProber {
        fn new(internal: ProbeResult, public: ProbeResult) -> Self {
            Self {
                internal: Mutex::new(internal),
                public: Mutex::new(public),
            }
        }

        fn set_public(&self, result: ProbeResult) {
            *self.public.lock().unwrap() = result;
        }
    }

    impl Prober for RouteProber {
        fn probe(
            &self,
            _instance: &InstanceRef,
            route: &ProbeRoute,
            _path: &str,
            _timeout: Duration,
        ) -> BoxFuture<ProbeResult> {
            let result = match route {
                ProbeRoute::Internal => *self.internal.lock().unwrap(),
                ProbeRoute::Public { .. } => *self.public.lock().unwrap(),
            };
            Box::pin(async move { result })
        }
    }

    struct Harness {
        store: StateStore,
        platform: Arc<DevPlatform>,
        prober: Arc<RouteProber>,
        approvals: ApprovalGate,
        sequencer: Arc<PipelineSequencer>,
    }

    fn fast_probe() -> ProbeConfig {
        ProbeConfig {
            path: "/healthz".to_string(),
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(250),
            required_consecutive_passes: 1,
            failure_threshold: 1,
            probe_timeout: Duration::from_millis(10),
        }
    }

    fn harness(internal: ProbeResult, public: ProbeResult) -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let platform = Arc::new(DevPlatform::new());
        let controller = ReplicaSetController::new(platform.clone(), store.clone())
            .with_retry_policy(3, Duration::ZERO);
        let switcher = TrafficSwitcher::new("shop", store.clone(), controller, platform.clone());
        let prober = Arc::new(RouteProber::new(internal, public));
        let gate = HealthGate::new(prober.clone());
        let approvals = ApprovalGate::new(store.clone());

        let mut config = ServiceConfig::new("shop");
        config.probe = fast_probe();
        config.approval_deadline = Duration::from_millis(200);
        config.termination_wait = Duration::ZERO;

        let sequencer = Arc::new(PipelineSequencer::new(
            config,
            store.clone(),
            switcher,
            gate,
            approvals.clone(),
            Arc::new(CommitTaggedBuilder::new("registry.local/shop")),
        ));
        Harness {
            store,
            platform,
            prober,
            approvals,
            sequencer,
        }
    }

    /// Approve (or reject) the first run that reaches the gate.
    fn decide_when_pending(h: &Harness, approved: bool) {
        let approvals = h.approvals.clone();
        let store = h.store.clone();
        tokio::spawn(async move {
            loop {
                let runs = store.list_incomplete_runs().unwrap();
                if let Some(run) = runs.first() {
                    if approvals.is_pending(&run.run_id) {
                        approvals.decide(&run.run_id, approved, "tester").unwrap();
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
    }

    fn stage_names(run: &PipelineRun) -> Vec<StageName> {
        run.stages.iter().map(|s| s.name).collect()
    }

    async fn wait_terminal(store: &StateStore, run_id: &str) -> PipelineRun {
        for _ in 0..400 {
            if let Some(run) = store.get_run(run_id).unwrap() {
                if run.is_terminal() {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run {run_id} never reached a terminal state");
    }

    fn routing(h: &Harness) -> RoutingState {
        h.sequencer.switcher().routing().unwrap()
    }

    #[tokio::test]
    async fn healthy_approved_run_commits() {
        let h = harness(ProbeResult::Pass, ProbeResult::Pass);
        decide_when_pending(&h, true);

        let run = h.sequencer.run("rev-1").await.unwrap();
        assert_eq!(run.outcome, RunOutcome::Succeeded);
        assert_eq!(
            stage_names(&run),
            vec![
                StageName::Source,
                StageName::Build,
                StageName::Deploy,
                StageName::PreCheck,
                StageName::Approval,
                StageName::Cutover,
                StageName::PostCheck,
                StageName::Commit,
            ]
        );
        assert!(run.finished_at.is_some());

        let routing = routing(&h);
        assert_eq!(routing.phase, RoutingPhase::Committed);
        assert!(routing.candidate_set_id.is_none());
        let live = routing.live_set_id.expect("live set after commit");
        assert_eq!(h.platform.current_target("shop").as_deref(), Some(live.as_str()));

        let approval = h.store.get_approval(&run.run_id).unwrap().unwrap();
        assert_eq!(approval.decision, Decision::Approved);
        assert_eq!(approval.decided_by.as_deref(), Some("tester"));
    }

    #[tokio::test]
    async fn second_promotion_replaces_live_set() {
        let h = harness(ProbeResult::Pass, ProbeResult::Pass);

        decide_when_pending(&h, true);
        let first = h.sequencer.run("rev-1").await.unwrap();
        assert_eq!(first.outcome, RunOutcome::Succeeded);
        let old_live = routing(&h).live_set_id.unwrap();

        decide_when_pending(&h, true);
        let second = h.sequencer.run("rev-2").await.unwrap();
        assert_eq!(second.outcome, RunOutcome::Succeeded);

        let new_live = routing(&h).live_set_id.unwrap();
        assert_ne!(old_live, new_live);
        assert_eq!(h.platform.current_target("shop").as_deref(), Some(new_live.as_str()));
        // Zero grace period: the old set is already gone.
        assert!(!h.platform.is_running(&old_live));
        assert_eq!(h.platform.live_set_count(), 1);
    }

    #[tokio::test]
    async fn precheck_failure_rolls_back_without_approval() {
        let h = harness(ProbeResult::Fail, ProbeResult::Pass);

        let run = h.sequencer.run("rev-1").await.unwrap();
        assert_eq!(run.outcome, RunOutcome::RolledBack);
        let names = stage_names(&run);
        assert!(names.contains(&StageName::PreCheck));
        assert!(names.contains(&StageName::Rollback));
        // The approval gate was never reached.
        assert!(!names.contains(&StageName::Approval));
        assert!(h.store.get_approval(&run.run_id).unwrap().is_none());

        let routing = routing(&h);
        assert_eq!(routing.phase, RoutingPhase::Idle);
        assert!(routing.candidate_set_id.is_none());
        assert_eq!(h.platform.live_set_count(), 0);
    }

    #[tokio::test]
    async fn approval_rejection_rolls_back() {
        let h = harness(ProbeResult::Pass, ProbeResult::Pass);
        decide_when_pending(&h, false);

        let run = h.sequencer.run("rev-1").await.unwrap();
        assert_eq!(run.outcome, RunOutcome::RolledBack);
        let approval_stage = run
            .stages
            .iter()
            .find(|s| s.name == StageName::Approval)
            .unwrap();
        assert_eq!(approval_stage.outcome, StageOutcome::Failed);
        assert_eq!(routing(&h).phase, RoutingPhase::Idle);
    }

    #[tokio::test]
    async fn approval_deadline_lapse_rolls_back() {
        let h = harness(ProbeResult::Pass, ProbeResult::Pass);
        // Nobody decides.
        let run = h.sequencer.run("rev-1").await.unwrap();
        assert_eq!(run.outcome, RunOutcome::RolledBack);

        let approval = h.store.get_approval(&run.run_id).unwrap().unwrap();
        assert_eq!(approval.decision, Decision::Rejected);
        assert_eq!(approval.decided_by.as_deref(), Some("deadline"));
        assert_eq!(routing(&h).phase, RoutingPhase::Idle);
    }

    #[tokio::test]
    async fn postcheck_failure_reverts_traffic_to_previous_live() {
        let h = harness(ProbeResult::Pass, ProbeResult::Pass);

        decide_when_pending(&h, true);
        let first = h.sequencer.run("rev-1").await.unwrap();
        assert_eq!(first.outcome, RunOutcome::Succeeded);
        let old_live = routing(&h).live_set_id.unwrap();

        h.prober.set_public(ProbeResult::Fail);
        decide_when_pending(&h, true);
        let second = h.sequencer.run("rev-2").await.unwrap();
        assert_eq!(second.outcome, RunOutcome::RolledBack);

        // Traffic is back on the previous live set; the candidate is gone.
        let routing = routing(&h);
        assert_eq!(routing.phase, RoutingPhase::Idle);
        assert_eq!(routing.live_set_id.as_deref(), Some(old_live.as_str()));
        assert_eq!(h.platform.current_target("shop").as_deref(), Some(old_live.as_str()));
        assert_eq!(h.platform.live_set_count(), 1);
    }

    #[tokio::test]
    async fn bootstrap_postcheck_failure_leaves_no_live_set() {
        let h = harness(ProbeResult::Pass, ProbeResult::Fail);
        decide_when_pending(&h, true);

        let run = h.sequencer.run("rev-1").await.unwrap();
        assert_eq!(run.outcome, RunOutcome::RolledBack);

        let routing = routing(&h);
        assert_eq!(routing.phase, RoutingPhase::Idle);
        assert!(routing.live_set_id.is_none());
        assert_eq!(h.platform.live_set_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_trigger_is_rejected_not_queued() {
        let h = harness(ProbeResult::Pass, ProbeResult::Pass);

        let run_id = h.sequencer.start("rev-1").unwrap();

        // The first run parks at the approval gate.
        for _ in 0..400 {
            if h.approvals.is_pending(&run_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.approvals.is_pending(&run_id));

        let err = h.sequencer.run("rev-2").await.unwrap_err();
        assert!(matches!(err, PipelineError::RunInProgress(_)));
        let err = h.sequencer.start("rev-2").unwrap_err();
        assert!(matches!(err, PipelineError::RunInProgress(_)));

        h.approvals.decide(&run_id, true, "tester").unwrap();
        let run = wait_terminal(&h.store, &run_id).await;
        assert_eq!(run.outcome, RunOutcome::Succeeded);

        // The lock is released; a new trigger is accepted.
        decide_when_pending(&h, true);
        let next = h.sequencer.run("rev-2").await.unwrap();
        assert_eq!(next.outcome, RunOutcome::Succeeded);
    }

    #[tokio::test]
    async fn cancel_before_deploy_fails_run_cleanly() {
        let h = harness(ProbeResult::Pass, ProbeResult::Pass);

        let run_id = h.sequencer.start("rev-1").unwrap();
        // Phase is still Idle at this point, so the request is honored
        // even if the run has not reached its first checkpoint yet.
        match h.sequencer.cancel(&run_id) {
            Ok(()) => {}
            // The run may already be terminal on a slow machine.
            Err(PipelineError::NoActiveRun(_)) => {}
            Err(e) => panic!("unexpected cancel error: {e}"),
        }

        let run = wait_terminal(&h.store, &run_id).await;
        // Either the cancel landed (Failed) or the run finished first.
        if run.outcome == RunOutcome::Failed {
            assert_eq!(routing(&h).phase, RoutingPhase::Idle);
            assert!(routing(&h).candidate_set_id.is_none());
        }
    }

    #[tokio::test]
    async fn cancel_after_precheck_is_too_late() {
        let h = harness(ProbeResult::Pass, ProbeResult::Pass);

        let run_id = h.sequencer.start("rev-1").unwrap();
        for _ in 0..400 {
            if h.approvals.is_pending(&run_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.approvals.is_pending(&run_id));

        let err = h.sequencer.cancel(&run_id).unwrap_err();
        assert!(matches!(err, PipelineError::CancelTooLate(_)));

        h.approvals.decide(&run_id, true, "tester").unwrap();
        let run = wait_terminal(&h.store, &run_id).await;
        assert_eq!(run.outcome, RunOutcome::Succeeded);
    }

    /// Prober whose probes take a while, holding the run in PreCheck.
    struct SlowPassProber {
        delay: Duration,
    }

    impl Prober for SlowPassProber {
        fn probe(
            &self,
            _instance: &InstanceRef,
            _route: &ProbeRoute,
            _path: &str,
            _timeout: Duration,
        ) -> BoxFuture<ProbeResult> {
            let delay = self.delay;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                ProbeResult::Pass
            })
        }
    }

    #[tokio::test]
    async fn cancel_accepted_during_precheck_lands_before_approval() {
        let store = StateStore::open_in_memory().unwrap();
        let platform = Arc::new(DevPlatform::new());
        let controller = ReplicaSetController::new(platform.clone(), store.clone())
            .with_retry_policy(3, Duration::ZERO);
        let switcher = TrafficSwitcher::new("shop", store.clone(), controller, platform);
        let approvals = ApprovalGate::new(store.clone());

        let mut config = ServiceConfig::new("shop");
        config.probe = ProbeConfig {
            path: "/healthz".to_string(),
            interval: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
            required_consecutive_passes: 1,
            failure_threshold: 1,
            probe_timeout: Duration::from_secs(1),
        };
        config.termination_wait = Duration::ZERO;

        let sequencer = Arc::new(PipelineSequencer::new(
            config,
            store.clone(),
            switcher,
            HealthGate::new(Arc::new(SlowPassProber {
                delay: Duration::from_millis(300),
            })),
            approvals,
            Arc::new(CommitTaggedBuilder::new("registry.local/shop")),
        ));

        let run_id = sequencer.start("rev-1").unwrap();
        for _ in 0..400 {
            if sequencer.switcher().routing().unwrap().phase == RoutingPhase::PreCheck {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(
            sequencer.switcher().routing().unwrap().phase,
            RoutingPhase::PreCheck
        );
        // Accepted while the gate is still probing; the run must honor
        // it even though the health verdict will come back healthy.
        sequencer.cancel(&run_id).unwrap();

        let run = wait_terminal(&store, &run_id).await;
        assert_eq!(run.outcome, RunOutcome::Failed);
        assert!(!stage_names(&run).contains(&StageName::Approval));
        assert!(store.get_approval(&run_id).unwrap().is_none());

        let routing = sequencer.switcher().routing().unwrap();
        assert_eq!(routing.phase, RoutingPhase::Idle);
        assert!(routing.candidate_set_id.is_none());
    }

    #[tokio::test]
    async fn restart_recovery_closes_run_that_never_touched_routing() {
        let h = harness(ProbeResult::Pass, ProbeResult::Pass);

        // Died during Build: routing still Idle, one stage recorded.
        let mut run = PipelineRun::new("shop-stale-1", "shop", "rev-1");
        run.stages.push(StageResult {
            name: StageName::Source,
            outcome: StageOutcome::Succeeded,
            started_at: 1,
            finished_at: 1,
            detail: "revision rev-1".to_string(),
        });
        h.store.put_run(&run).unwrap();

        let closed = h.sequencer.resume_incomplete().await.unwrap();
        assert_eq!(closed, 1);

        let run = h.store.get_run("shop-stale-1").unwrap().unwrap();
        assert_eq!(run.outcome, RunOutcome::Failed);
        // No rollback ran, and none is claimed.
        assert!(!stage_names(&run).contains(&StageName::Rollback));
        let last = run.stages.last().unwrap();
        assert_eq!(last.name, StageName::Build);
        assert_eq!(last.outcome, StageOutcome::Failed);
        assert_eq!(last.detail, "interrupted by restart");
    }

    #[tokio::test]
    async fn provisioning_exhaustion_fails_run_and_restores_idle() {
        let h = harness(ProbeResult::Pass, ProbeResult::Pass);
        h.platform.inject_provisioning_failures(3);

        let run = h.sequencer.run("rev-1").await.unwrap();
        assert_eq!(run.outcome, RunOutcome::Failed);
        let deploy = run
            .stages
            .iter()
            .find(|s| s.name == StageName::Deploy)
            .unwrap();
        assert_eq!(deploy.outcome, StageOutcome::Failed);
        assert!(!stage_names(&run).contains(&StageName::Rollback));

        let routing = routing(&h);
        assert_eq!(routing.phase, RoutingPhase::Idle);
        assert!(routing.candidate_set_id.is_none());
    }

    #[tokio::test]
    async fn empty_revision_fails_at_source() {
        let h = harness(ProbeResult::Pass, ProbeResult::Pass);
        let run = h.sequencer.run("  ").await.unwrap();
        assert_eq!(run.outcome, RunOutcome::Failed);
        assert_eq!(stage_names(&run), vec![StageName::Source]);
    }

    #[tokio::test]
    async fn restart_recovery_rolls_back_run_interrupted_after_cutover() {
        let h = harness(ProbeResult::Pass, ProbeResult::Pass);

        // Drive routing to PostCheck by hand, as if the process died
        // mid-run: candidate live, run record still in progress.
        let registry = ArtifactRegistry::new(h.store.clone());
        let artifact = registry.register("rev-1", "registry.local/shop:rev-1").unwrap();
        let switcher = h.sequencer.switcher().clone();
        switcher.begin_deploy(&artifact, 2, 8080).await.unwrap();
        switcher.mark_deployed().await.unwrap();
        switcher.record_precheck(Verdict::Healthy).await.unwrap();
        switcher.record_approval(true).await.unwrap();
        switcher.cut_over().await.unwrap();
        switcher.begin_postcheck().await.unwrap();

        let run = PipelineRun::new("shop-stale-0", "shop", "rev-1");
        h.store.put_run(&run).unwrap();

        let closed = h.sequencer.resume_incomplete().await.unwrap();
        assert_eq!(closed, 1);

        let run = h.store.get_run("shop-stale-0").unwrap().unwrap();
        assert_eq!(run.outcome, RunOutcome::RolledBack);
        assert!(run.stages.iter().any(|s| s.detail == "interrupted by restart"));

        let routing = routing(&h);
        assert_eq!(routing.phase, RoutingPhase::Idle);
        assert!(routing.candidate_set_id.is_none());
        assert_eq!(h.platform.live_set_count(), 0);

        // A fresh trigger works after recovery.
        decide_when_pending(&h, true);
        let next = h.sequencer.run("rev-2").await.unwrap();
        assert_eq!(next.outcome, RunOutcome::Succeeded);
    }

    #[tokio::test]
    async fn restart_recovery_closes_run_interrupted_before_cutover() {
        let h = harness(ProbeResult::Pass, ProbeResult::Pass);

        let registry = ArtifactRegistry::new(h.store.clone());
        let artifact = registry.register("rev-1", "registry.local/shop:rev-1").unwrap();
        let switcher = h.sequencer.switcher().clone();
        switcher.begin_deploy(&artifact, 2, 8080).await.unwrap();
        switcher.mark_deployed().await.unwrap();

        let run = PipelineRun::new("shop-stale-0", "shop", "rev-1");
        h.store.put_run(&run).unwrap();

        let closed = h.sequencer.resume_incomplete().await.unwrap();
        assert_eq!(closed, 1);

        let run = h.store.get_run("shop-stale-0").unwrap().unwrap();
        assert_eq!(run.outcome, RunOutcome::Failed);
        assert_eq!(routing(&h).phase, RoutingPhase::Idle);
        assert_eq!(h.platform.live_set_count(), 0);
    }
}
