//! switchyard-health — health probes and the replica-set health gate.
//!
//! The gate answers one question: is every instance of a replica set
//! ready to take traffic? It polls all instances in parallel against a
//! shared deadline and aggregates per-instance verdicts into a single
//! set-level verdict. The verdict is a barrier: it is not available
//! until every instance has reported or timed out.
//!
//! Probes run over two routes: the candidate's internal test route
//! (pre-cutover, so an unhealthy candidate never sees production
//! traffic) and the public entry point (post-cutover, to catch
//! integration issues invisible to the internal route).

pub mod gate;
pub mod probe;

pub use gate::{HealthGate, ProbeConfig, Verdict};
pub use probe::{HttpProber, ProbeResult, ProbeRoute, Prober};
