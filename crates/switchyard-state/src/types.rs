//! Domain types for the Switchyard state store.
//!
//! These types represent the persisted state of a blue/green deployment
//! pipeline: immutable build artifacts, replica sets, the per-service
//! routing singleton, approval decisions, and pipeline run logs. All
//! types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

/// Unique identifier for a replica set.
pub type ReplicaSetId = String;

/// Unique identifier for a pipeline run.
pub type RunId = String;

/// Current Unix timestamp in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Artifact ───────────────────────────────────────────────────────

/// An immutable build artifact: a pushed container image identified by
/// its source revision. Registered once per successful build and never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    /// Source revision (commit id or content hash).
    pub revision_id: String,
    /// Full image reference (`registry/repo:tag`).
    pub image_reference: String,
    /// Unix timestamp (seconds) when the artifact was registered.
    pub created_at: u64,
}

// ── Replica set ────────────────────────────────────────────────────

/// A running instance of a replica set, addressable for health probes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceRef {
    pub id: String,
    /// Instance address as `ip:port`.
    pub address: String,
    pub port: u16,
}

/// Role of a replica set relative to the entry point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplicaSetRole {
    /// Serving production traffic.
    Blue,
    /// Candidate; reachable only on its internal test route.
    Green,
    /// Former live set, draining until its grace period expires.
    Retiring,
    /// Drained and removed from the platform.
    Retired,
}

/// A versioned group of running instances of one artifact behind one
/// internal routing target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaSet {
    pub id: ReplicaSetId,
    pub service: String,
    pub artifact: Artifact,
    pub role: ReplicaSetRole,
    pub instance_count: u32,
    /// Port the instances listen on (the internal test route).
    pub desired_port: u16,
    pub created_at: u64,
}

// ── Routing ────────────────────────────────────────────────────────

/// Phase of the blue/green cutover state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RoutingPhase {
    Idle,
    Deploying,
    PreCheck,
    AwaitingApproval,
    Cutover,
    PostCheck,
    Committed,
    RollingBack,
}

/// Singleton routing state per service. Survives individual pipeline
/// runs; mutated only by the traffic switcher under its routing lock.
///
/// At most one candidate exists at a time. `live_set_id` is `None` only
/// before the very first deploy of a service (bootstrap).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutingState {
    pub service: String,
    pub live_set_id: Option<ReplicaSetId>,
    pub candidate_set_id: Option<ReplicaSetId>,
    pub phase: RoutingPhase,
    pub updated_at: u64,
}

impl RoutingState {
    /// Fresh routing state for a service that has never deployed.
    pub fn bootstrap(service: &str) -> Self {
        Self {
            service: service.to_string(),
            live_set_id: None,
            candidate_set_id: None,
            phase: RoutingPhase::Idle,
            updated_at: epoch_secs(),
        }
    }
}

// ── Approval ───────────────────────────────────────────────────────

/// Outcome of a manual approval gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Decision {
    Pending,
    Approved,
    Rejected,
}

/// A recorded approval decision for one pipeline run. Terminal once
/// decided or timed out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalDecision {
    pub run_id: RunId,
    pub decision: Decision,
    pub decided_at: Option<u64>,
    pub decided_by: Option<String>,
}

impl ApprovalDecision {
    pub fn pending(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            decision: Decision::Pending,
            decided_at: None,
            decided_by: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.decision != Decision::Pending
    }
}

// ── Pipeline run ───────────────────────────────────────────────────

/// Pipeline stage names, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StageName {
    Source,
    Build,
    Deploy,
    PreCheck,
    Approval,
    Cutover,
    PostCheck,
    Commit,
    Rollback,
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageName::Source => "source",
            StageName::Build => "build",
            StageName::Deploy => "deploy",
            StageName::PreCheck => "pre-check",
            StageName::Approval => "approval",
            StageName::Cutover => "cutover",
            StageName::PostCheck => "post-check",
            StageName::Commit => "commit",
            StageName::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// Terminal result of a single pipeline stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StageOutcome {
    Succeeded,
    Failed,
    RolledBack,
}

/// One entry in a run's append-only stage log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageResult {
    pub name: StageName,
    pub outcome: StageOutcome,
    pub started_at: u64,
    pub finished_at: u64,
    pub detail: String,
}

/// Overall outcome of a pipeline run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunOutcome {
    InProgress,
    Succeeded,
    RolledBack,
    Failed,
}

/// One triggered pipeline execution. The stage log is append-only and
/// the record is immutable once the outcome is terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineRun {
    pub run_id: RunId,
    pub service: String,
    pub source_revision: String,
    pub stages: Vec<StageResult>,
    pub outcome: RunOutcome,
    pub started_at: u64,
    pub finished_at: Option<u64>,
}

impl PipelineRun {
    pub fn new(run_id: &str, service: &str, source_revision: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            service: service.to_string(),
            source_revision: source_revision.to_string(),
            stages: Vec::new(),
            outcome: RunOutcome::InProgress,
            started_at: epoch_secs(),
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome != RunOutcome::InProgress
    }
}
