//! Health probe plumbing.
//!
//! A probe is one HTTP GET against an instance's readiness endpoint,
//! either on the instance's own address (internal test route) or through
//! the public entry point.

use std::pin::Pin;
use std::time::Duration;

use tracing::debug;

use switchyard_state::InstanceRef;

/// Boxed future type for prober implementations.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The endpoint returned 2xx.
    Pass,
    /// The endpoint answered with non-2xx: a definitive failure.
    Fail,
    /// The probe could not be executed (connection error or timeout).
    Error,
}

/// Which route a probe travels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeRoute {
    /// The instance's own listen address, bypassing the entry point.
    Internal,
    /// Through the service's public entry point.
    Public { entry_point: String },
}

/// Probe seam, so the gate can be exercised without a network.
pub trait Prober: Send + Sync {
    fn probe(
        &self,
        instance: &InstanceRef,
        route: &ProbeRoute,
        path: &str,
        timeout: Duration,
    ) -> BoxFuture<ProbeResult>;
}

/// HTTP prober over a raw hyper http1 connection.
pub struct HttpProber;

impl Prober for HttpProber {
    fn probe(
        &self,
        instance: &InstanceRef,
        route: &ProbeRoute,
        path: &str,
        timeout: Duration,
    ) -> BoxFuture<ProbeResult> {
        let address = match route {
            ProbeRoute::Internal => instance.address.clone(),
            ProbeRoute::Public { entry_point } => entry_point.clone(),
        };
        let path = path.to_string();
        Box::pin(async move { http_probe(&address, &path, timeout).await })
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Pass` if the response is 2xx, `Fail` for non-2xx, or
/// `Error` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Error;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Error;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "switchyard-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .unwrap();

        match sender.send_request(req).await {
            Ok(resp) => {
                if resp.status().is_success() {
                    ProbeResult::Pass
                } else {
                    debug!(status = %resp.status(), %uri, "health probe non-2xx");
                    ProbeResult::Fail
                }
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Error
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeResult::Error
        }
    }
}
