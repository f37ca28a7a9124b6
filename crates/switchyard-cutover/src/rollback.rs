//! Rollback — revert to the previous stable assignment.

use tracing::info;

use switchyard_state::RoutingState;

use crate::error::CutoverResult;
use crate::switcher::TrafficSwitcher;

/// Reverts the traffic switcher to the previous stable assignment and
/// tears down the failed candidate.
///
/// Safe to invoke from any switcher state reachable after `Deploying`,
/// and idempotent: rolling back an already-rolled-back state is a no-op.
/// Runs synchronously under the switcher's routing lock, so a rollback
/// can never interleave with a concurrent cutover.
#[derive(Clone)]
pub struct RollbackManager {
    switcher: TrafficSwitcher,
}

impl RollbackManager {
    pub fn new(switcher: TrafficSwitcher) -> Self {
        Self { switcher }
    }

    /// Re-assert the previous live set as the sole traffic target and
    /// retire the candidate. Returns the settled routing state.
    pub async fn rollback(&self) -> CutoverResult<RoutingState> {
        let routing = self.switcher.execute_rollback().await?;
        info!(
            service = %self.switcher.service(),
            live = ?routing.live_set_id,
            "rollback manager finished"
        );
        Ok(routing)
    }
}
