//! The replica-set health gate.
//!
//! Polls every instance of a set in parallel under one shared deadline.
//! An instance is ready once it accumulates the required number of
//! consecutive passing probes; a flapping instance does not abort the
//! others early, but no verdict is issued until all instances have
//! reported or the deadline has expired.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use switchyard_state::InstanceRef;

use crate::probe::{ProbeResult, ProbeRoute, Prober};

/// Set-level health verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Every instance reached its pass threshold.
    Healthy,
    /// At least one instance failed definitively.
    Unhealthy,
    /// The deadline expired before every instance was ready.
    TimedOut,
}

/// Gate parameters.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// HTTP path to probe (e.g. "/healthz").
    pub path: String,
    /// Delay between successive probes of one instance.
    pub interval: Duration,
    /// Overall deadline shared by all instances.
    pub timeout: Duration,
    /// Consecutive passes before an instance counts as ready.
    pub required_consecutive_passes: u32,
    /// Consecutive definitive (non-2xx) failures before the whole set
    /// is declared unhealthy.
    pub failure_threshold: u32,
    /// Timeout for a single probe request.
    pub probe_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(120),
            required_consecutive_passes: 3,
            failure_threshold: 3,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-instance terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstanceVerdict {
    Ready,
    Failed,
    TimedOut,
}

/// Polls replica-set instances and produces readiness verdicts.
#[derive(Clone)]
pub struct HealthGate {
    prober: Arc<dyn Prober>,
}

impl HealthGate {
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self { prober }
    }

    /// Check a replica set's instances over the given route.
    ///
    /// Purely observational; the only side effects are the probes
    /// themselves. Never blocks past `config.timeout`.
    pub async fn check(
        &self,
        instances: &[InstanceRef],
        route: &ProbeRoute,
        config: &ProbeConfig,
    ) -> Verdict {
        // A deadline too short to fit even one probe cycle is a
        // misconfiguration answered without touching the network.
        if config.timeout < config.interval {
            warn!(
                timeout = ?config.timeout,
                interval = ?config.interval,
                "health gate timeout shorter than probe interval"
            );
            return Verdict::TimedOut;
        }

        if instances.is_empty() {
            warn!("health gate invoked on a replica set with no instances");
            return Verdict::Unhealthy;
        }

        let deadline = Instant::now() + config.timeout;
        let mut tasks = JoinSet::new();
        for instance in instances {
            let prober = self.prober.clone();
            let instance = instance.clone();
            let route = route.clone();
            let config = config.clone();
            tasks.spawn(async move {
                match tokio::time::timeout_at(
                    deadline,
                    watch_instance(prober, &instance, &route, &config),
                )
                .await
                {
                    Ok(verdict) => (instance.id, verdict),
                    Err(_) => (instance.id, InstanceVerdict::TimedOut),
                }
            });
        }

        // Barrier: the set verdict needs every instance's report.
        let mut any_timed_out = false;
        let mut any_failed = false;
        while let Some(joined) = tasks.join_next().await {
            let Ok((instance_id, verdict)) = joined else {
                any_failed = true;
                continue;
            };
            debug!(instance = %instance_id, ?verdict, "instance verdict");
            match verdict {
                InstanceVerdict::Ready => {}
                InstanceVerdict::Failed => any_failed = true,
                InstanceVerdict::TimedOut => any_timed_out = true,
            }
        }

        let verdict = if any_failed {
            Verdict::Unhealthy
        } else if any_timed_out {
            Verdict::TimedOut
        } else {
            Verdict::Healthy
        };
        info!(?verdict, instances = instances.len(), "health gate verdict");
        verdict
    }
}

/// Poll one instance until it is ready or definitively failed. The
/// caller bounds this with the shared deadline.
async fn watch_instance(
    prober: Arc<dyn Prober>,
    instance: &InstanceRef,
    route: &ProbeRoute,
    config: &ProbeConfig,
) -> InstanceVerdict {
    let mut consecutive_passes = 0u32;
    let mut consecutive_failures = 0u32;

    loop {
        match prober
            .probe(instance, route, &config.path, config.probe_timeout)
            .await
        {
            ProbeResult::Pass => {
                consecutive_passes += 1;
                consecutive_failures = 0;
                if consecutive_passes >= config.required_consecutive_passes {
                    return InstanceVerdict::Ready;
                }
            }
            ProbeResult::Fail => {
                consecutive_passes = 0;
                consecutive_failures += 1;
                if consecutive_failures >= config.failure_threshold {
                    return InstanceVerdict::Failed;
                }
            }
            // Connection errors reset the pass streak but are not
            // definitive; a slow starter ends in TimedOut, not Failed.
            ProbeResult::Error => {
                consecutive_passes = 0;
                consecutive_failures = 0;
            }
        }
        tokio::time::sleep(config.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::BoxFuture;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Prober that replays a scripted result sequence per instance and
    /// then repeats the final entry.
    struct ScriptedProber {
        scripts: Mutex<HashMap<String, Vec<ProbeResult>>>,
        probes_issued: AtomicU32,
    }

    impl ScriptedProber {
        fn new(scripts: &[(&str, &[ProbeResult])]) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(
                    scripts
                        .iter()
                        .map(|(id, seq)| (id.to_string(), seq.to_vec()))
                        .collect(),
                ),
                probes_issued: AtomicU32::new(0),
            })
        }

        fn issued(&self) -> u32 {
            self.probes_issued.load(Ordering::SeqCst)
        }
    }

    impl Prober for ScriptedProber {
        fn probe(
            &self,
            instance: &InstanceRef,
            _route: &ProbeRoute,
            _path: &str,
            _timeout: Duration,
        ) -> BoxFuture<ProbeResult> {
            self.probes_issued.fetch_add(1, Ordering::SeqCst);
            let mut scripts = self.scripts.lock().unwrap();
            let seq = scripts.get_mut(&instance.id).expect("unscripted instance");
            let result = if seq.len() > 1 {
                seq.remove(0)
            } else {
                seq[0]
            };
            Box::pin(async move { result })
        }
    }

    fn instance(id: &str) -> InstanceRef {
        InstanceRef {
            id: id.to_string(),
            address: "127.0.0.1:8080".to_string(),
            port: 8080,
        }
    }

    fn fast_config(passes: u32) -> ProbeConfig {
        ProbeConfig {
            path: "/healthz".to_string(),
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(500),
            required_consecutive_passes: passes,
            failure_threshold: 3,
            probe_timeout: Duration::from_millis(50),
        }
    }

    use ProbeResult::{Error, Fail, Pass};

    #[tokio::test]
    async fn all_instances_passing_is_healthy() {
        let prober = ScriptedProber::new(&[("a", &[Pass]), ("b", &[Pass])]);
        let gate = HealthGate::new(prober);

        let verdict = gate
            .check(
                &[instance("a"), instance("b")],
                &ProbeRoute::Internal,
                &fast_config(2),
            )
            .await;
        assert_eq!(verdict, Verdict::Healthy);
    }

    #[tokio::test]
    async fn failure_resets_pass_streak() {
        // Needs 2 consecutive passes; the Fail in the middle forces a
        // restart of the streak before readiness.
        let prober = ScriptedProber::new(&[("a", &[Pass, Fail, Pass, Pass])]);
        let gate = HealthGate::new(prober.clone());

        let verdict = gate
            .check(&[instance("a")], &ProbeRoute::Internal, &fast_config(2))
            .await;
        assert_eq!(verdict, Verdict::Healthy);
        assert!(prober.issued() >= 4);
    }

    #[tokio::test]
    async fn definitive_failures_are_unhealthy() {
        let prober = ScriptedProber::new(&[("a", &[Fail])]);
        let gate = HealthGate::new(prober);

        let verdict = gate
            .check(&[instance("a")], &ProbeRoute::Internal, &fast_config(1))
            .await;
        assert_eq!(verdict, Verdict::Unhealthy);
    }

    #[tokio::test]
    async fn one_bad_instance_fails_the_set() {
        let prober = ScriptedProber::new(&[("a", &[Pass]), ("b", &[Fail])]);
        let gate = HealthGate::new(prober);

        let verdict = gate
            .check(
                &[instance("a"), instance("b")],
                &ProbeRoute::Internal,
                &fast_config(1),
            )
            .await;
        assert_eq!(verdict, Verdict::Unhealthy);
    }

    #[tokio::test]
    async fn connection_errors_run_out_the_clock() {
        let prober = ScriptedProber::new(&[("a", &[Error])]);
        let gate = HealthGate::new(prober);

        let config = ProbeConfig {
            timeout: Duration::from_millis(20),
            ..fast_config(1)
        };
        let verdict = gate
            .check(&[instance("a")], &ProbeRoute::Internal, &config)
            .await;
        assert_eq!(verdict, Verdict::TimedOut);
    }

    #[tokio::test]
    async fn timeout_shorter_than_interval_skips_probing() {
        let prober = ScriptedProber::new(&[("a", &[Pass])]);
        let gate = HealthGate::new(prober.clone());

        let config = ProbeConfig {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(1),
            ..fast_config(1)
        };
        let verdict = gate
            .check(&[instance("a")], &ProbeRoute::Internal, &config)
            .await;
        assert_eq!(verdict, Verdict::TimedOut);
        assert_eq!(prober.issued(), 0);
    }

    #[tokio::test]
    async fn empty_replica_set_is_unhealthy() {
        let prober = ScriptedProber::new(&[]);
        let gate = HealthGate::new(prober);

        let verdict = gate
            .check(&[], &ProbeRoute::Internal, &fast_config(1))
            .await;
        assert_eq!(verdict, Verdict::Unhealthy);
    }

    #[tokio::test]
    async fn slow_starter_becomes_healthy_within_deadline() {
        // Errors while booting, then stable passes.
        let prober = ScriptedProber::new(&[("a", &[Error, Error, Pass, Pass, Pass])]);
        let gate = HealthGate::new(prober);

        let verdict = gate
            .check(&[instance("a")], &ProbeRoute::Internal, &fast_config(3))
            .await;
        assert_eq!(verdict, Verdict::Healthy);
    }
}
