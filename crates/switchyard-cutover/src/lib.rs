//! switchyard-cutover — the blue/green cutover state machine.
//!
//! The [`TrafficSwitcher`] owns the live/standby assignment of the two
//! replica sets of a service and is the only writer of the persisted
//! `RoutingState`. Every transition happens under a per-service routing
//! lock; an out-of-order transition is a `RoutingConflict`, which is a
//! correctness bug rather than a recoverable condition.
//!
//! ```text
//! Idle → Deploying → PreCheck → AwaitingApproval → Cutover → PostCheck → Committed
//!              \         \            \               \          \
//!               └─────────┴────────────┴───────────────┴──────────┴──→ RollingBack → Idle
//! ```
//!
//! The [`RollbackManager`] executes the escape edge: it re-asserts the
//! previous live set as the sole entry-point target and tears down the
//! failed candidate. It is idempotent and safe from any state reachable
//! after `Deploying`.

pub mod error;
pub mod rollback;
pub mod switcher;

pub use error::{CutoverError, CutoverResult};
pub use rollback::RollbackManager;
pub use switcher::{GateOutcome, TrafficSwitcher};
