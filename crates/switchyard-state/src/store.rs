//! StateStore — redb-backed persistence for the Switchyard orchestrator.
//!
//! Provides typed CRUD operations over artifacts, replica sets, routing
//! state, pipeline runs, and approval decisions. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ARTIFACTS).map_err(map_err!(Table))?;
        txn.open_table(REPLICA_SETS).map_err(map_err!(Table))?;
        txn.open_table(ROUTING).map_err(map_err!(Table))?;
        txn.open_table(RUNS).map_err(map_err!(Table))?;
        txn.open_table(APPROVALS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Artifacts ──────────────────────────────────────────────────

    /// Insert an artifact, enforcing revision immutability.
    ///
    /// Idempotent when the same `(revision_id, image_reference)` pair is
    /// registered twice; fails with `DuplicateRevision` when the revision
    /// already maps to a different image. The check and insert happen in
    /// one write transaction.
    pub fn insert_artifact(&self, artifact: &Artifact) -> StateResult<Artifact> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored = {
            let mut table = txn.open_table(ARTIFACTS).map_err(map_err!(Table))?;
            let existing = match table
                .get(artifact.revision_id.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => Some(
                    serde_json::from_slice::<Artifact>(guard.value())
                        .map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            match existing {
                Some(prev) if prev.image_reference == artifact.image_reference => prev,
                Some(prev) => {
                    return Err(StateError::DuplicateRevision {
                        revision_id: artifact.revision_id.clone(),
                        existing: prev.image_reference,
                    });
                }
                None => {
                    let value = serde_json::to_vec(artifact).map_err(map_err!(Serialize))?;
                    table
                        .insert(artifact.revision_id.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                    artifact.clone()
                }
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(stored)
    }

    /// Get an artifact by revision id.
    pub fn get_artifact(&self, revision_id: &str) -> StateResult<Option<Artifact>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ARTIFACTS).map_err(map_err!(Table))?;
        match table.get(revision_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let artifact: Artifact =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(artifact))
            }
            None => Ok(None),
        }
    }

    /// List all registered artifacts.
    pub fn list_artifacts(&self) -> StateResult<Vec<Artifact>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ARTIFACTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let artifact: Artifact =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(artifact);
        }
        Ok(results)
    }

    // ── Replica sets ───────────────────────────────────────────────

    /// Insert or update a replica set.
    pub fn put_replica_set(&self, set: &ReplicaSet) -> StateResult<()> {
        let value = serde_json::to_vec(set).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REPLICA_SETS).map_err(map_err!(Table))?;
            table
                .insert(set.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a replica set by id.
    pub fn get_replica_set(&self, set_id: &str) -> StateResult<Option<ReplicaSet>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REPLICA_SETS).map_err(map_err!(Table))?;
        match table.get(set_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let set: ReplicaSet =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(set))
            }
            None => Ok(None),
        }
    }

    /// List all replica sets for a service (set ids embed the service as
    /// a `{service}:` prefix).
    pub fn list_replica_sets_for_service(&self, service: &str) -> StateResult<Vec<ReplicaSet>> {
        let prefix = format!("{service}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REPLICA_SETS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let set: ReplicaSet =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(set);
            }
        }
        Ok(results)
    }

    /// Delete a replica set record. Returns true if it existed.
    pub fn delete_replica_set(&self, set_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(REPLICA_SETS).map_err(map_err!(Table))?;
            existed = table.remove(set_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Routing ────────────────────────────────────────────────────

    /// Insert or update a service's routing singleton.
    pub fn put_routing(&self, routing: &RoutingState) -> StateResult<()> {
        let value = serde_json::to_vec(routing).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROUTING).map_err(map_err!(Table))?;
            table
                .insert(routing.service.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(service = %routing.service, phase = ?routing.phase, "routing state stored");
        Ok(())
    }

    /// Get a service's routing state.
    pub fn get_routing(&self, service: &str) -> StateResult<Option<RoutingState>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROUTING).map_err(map_err!(Table))?;
        match table.get(service).map_err(map_err!(Read))? {
            Some(guard) => {
                let routing: RoutingState =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(routing))
            }
            None => Ok(None),
        }
    }

    // ── Pipeline runs ──────────────────────────────────────────────

    /// Insert or update a pipeline run.
    pub fn put_run(&self, run: &PipelineRun) -> StateResult<()> {
        let value = serde_json::to_vec(run).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RUNS).map_err(map_err!(Table))?;
            table
                .insert(run.run_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a pipeline run by id.
    pub fn get_run(&self, run_id: &str) -> StateResult<Option<PipelineRun>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUNS).map_err(map_err!(Table))?;
        match table.get(run_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let run: PipelineRun =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    /// List all pipeline runs.
    pub fn list_runs(&self) -> StateResult<Vec<PipelineRun>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUNS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let run: PipelineRun =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(run);
        }
        Ok(results)
    }

    /// List runs that never reached a terminal outcome (crash recovery).
    pub fn list_incomplete_runs(&self) -> StateResult<Vec<PipelineRun>> {
        Ok(self
            .list_runs()?
            .into_iter()
            .filter(|run| !run.is_terminal())
            .collect())
    }

    // ── Approvals ──────────────────────────────────────────────────

    /// Insert or update an approval decision.
    pub fn put_approval(&self, approval: &ApprovalDecision) -> StateResult<()> {
        let value = serde_json::to_vec(approval).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(APPROVALS).map_err(map_err!(Table))?;
            table
                .insert(approval.run_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get the approval decision for a run.
    pub fn get_approval(&self, run_id: &str) -> StateResult<Option<ApprovalDecision>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPROVALS).map_err(map_err!(Table))?;
        match table.get(run_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let approval: ApprovalDecision =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(approval))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_artifact(revision: &str) -> Artifact {
        Artifact {
            revision_id: revision.to_string(),
            image_reference: format!("registry.local/shop:{revision}"),
            created_at: 1000,
        }
    }

    fn test_replica_set(service: &str, revision: &str) -> ReplicaSet {
        ReplicaSet {
            id: format!("{service}:{revision}:1000"),
            service: service.to_string(),
            artifact: test_artifact(revision),
            role: ReplicaSetRole::Green,
            instance_count: 2,
            desired_port: 8080,
            created_at: 1000,
        }
    }

    // ── Artifacts ──────────────────────────────────────────────────

    #[test]
    fn artifact_insert_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let artifact = test_artifact("abc123");

        store.insert_artifact(&artifact).unwrap();
        let retrieved = store.get_artifact("abc123").unwrap();

        assert_eq!(retrieved, Some(artifact));
    }

    #[test]
    fn artifact_reregister_identical_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        let artifact = test_artifact("abc123");

        store.insert_artifact(&artifact).unwrap();
        store.insert_artifact(&artifact).unwrap();

        assert_eq!(store.list_artifacts().unwrap().len(), 1);
    }

    #[test]
    fn artifact_reregister_different_image_fails() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_artifact(&test_artifact("abc123")).unwrap();

        let conflicting = Artifact {
            image_reference: "registry.local/shop:other".to_string(),
            ..test_artifact("abc123")
        };
        let err = store.insert_artifact(&conflicting).unwrap_err();
        assert!(matches!(err, StateError::DuplicateRevision { .. }));

        // The original mapping is untouched.
        let stored = store.get_artifact("abc123").unwrap().unwrap();
        assert_eq!(stored.image_reference, "registry.local/shop:abc123");
    }

    // ── Replica sets ───────────────────────────────────────────────

    #[test]
    fn replica_set_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let set = test_replica_set("shop", "v1");

        store.put_replica_set(&set).unwrap();
        let retrieved = store.get_replica_set(&set.id).unwrap();

        assert_eq!(retrieved, Some(set));
    }

    #[test]
    fn replica_set_list_for_service() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_replica_set(&test_replica_set("shop", "v1")).unwrap();
        store.put_replica_set(&test_replica_set("shop", "v2")).unwrap();
        store.put_replica_set(&test_replica_set("billing", "v1")).unwrap();

        let shop = store.list_replica_sets_for_service("shop").unwrap();
        assert_eq!(shop.len(), 2);

        let billing = store.list_replica_sets_for_service("billing").unwrap();
        assert_eq!(billing.len(), 1);
    }

    #[test]
    fn replica_set_delete() {
        let store = StateStore::open_in_memory().unwrap();
        let set = test_replica_set("shop", "v1");
        store.put_replica_set(&set).unwrap();

        assert!(store.delete_replica_set(&set.id).unwrap());
        assert!(!store.delete_replica_set(&set.id).unwrap());
    }

    // ── Routing ────────────────────────────────────────────────────

    #[test]
    fn routing_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let routing = RoutingState::bootstrap("shop");

        store.put_routing(&routing).unwrap();
        let retrieved = store.get_routing("shop").unwrap();

        assert_eq!(retrieved, Some(routing));
    }

    #[test]
    fn routing_update_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        let mut routing = RoutingState::bootstrap("shop");
        store.put_routing(&routing).unwrap();

        routing.phase = RoutingPhase::Deploying;
        routing.candidate_set_id = Some("shop:v2:2000".to_string());
        store.put_routing(&routing).unwrap();

        let retrieved = store.get_routing("shop").unwrap().unwrap();
        assert_eq!(retrieved.phase, RoutingPhase::Deploying);
        assert_eq!(retrieved.candidate_set_id.as_deref(), Some("shop:v2:2000"));
    }

    // ── Runs ───────────────────────────────────────────────────────

    #[test]
    fn run_put_get_and_incomplete_listing() {
        let store = StateStore::open_in_memory().unwrap();
        let mut run = PipelineRun::new("run-1", "shop", "abc123");
        store.put_run(&run).unwrap();

        let incomplete = store.list_incomplete_runs().unwrap();
        assert_eq!(incomplete.len(), 1);

        run.outcome = RunOutcome::Succeeded;
        run.finished_at = Some(2000);
        store.put_run(&run).unwrap();

        assert!(store.list_incomplete_runs().unwrap().is_empty());
        assert_eq!(store.list_runs().unwrap().len(), 1);
    }

    // ── Approvals ──────────────────────────────────────────────────

    #[test]
    fn approval_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let approval = ApprovalDecision::pending("run-1");

        store.put_approval(&approval).unwrap();
        let retrieved = store.get_approval("run-1").unwrap();
        assert_eq!(retrieved, Some(approval));

        assert!(store.get_approval("run-2").unwrap().is_none());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.insert_artifact(&test_artifact("abc123")).unwrap();
            store.put_routing(&RoutingState::bootstrap("shop")).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_artifact("abc123").unwrap().is_some());
        assert!(store.get_routing("shop").unwrap().is_some());
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_artifacts().unwrap().is_empty());
        assert!(store.list_runs().unwrap().is_empty());
        assert!(store.list_replica_sets_for_service("any").unwrap().is_empty());
        assert!(store.get_routing("any").unwrap().is_none());
        assert!(!store.delete_replica_set("nope").unwrap());
    }
}
