//! Readiness probe
//!
//! Sends HEAD requests to the worker until one gets a response or the
//! attempt budget runs out. Running out is not fatal; the worker dying
//! while we wait is.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::process::Child;

use super::{LaunchError, WorkerExit};

/// Probe attempt budget and spacing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval: Duration::from_secs(1),
        }
    }
}

/// Result of a completed probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Probe not configured
    Unchecked,
    /// The worker answered on the given (1-based) attempt
    Ready { attempt: u32, status: u16 },
    /// No answer within the budget; the worker may still be starting
    NotReady { attempts: u32 },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }
}

/// Address a client should use to reach a listener bound to `addr`
pub fn probe_target(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

/// Probe `addr` until it answers, the budget runs out or `child` exits
pub(crate) async fn wait_ready(
    addr: SocketAddr,
    config: &ProbeConfig,
    child: &mut Child,
) -> Result<Readiness, LaunchError> {
    let url = format!("http://{}/", probe_target(addr));
    // The worker is local; an HTTP_PROXY in the environment must not apply
    let client = reqwest::Client::builder()
        .no_proxy()
        .timeout(config.interval.max(Duration::from_millis(100)))
        .build()
        .map_err(|e| LaunchError::Probe(e.to_string()))?;

    for attempt in 1..=config.attempts {
        if let Some(status) = child.try_wait().map_err(LaunchError::Spawn)? {
            return Err(LaunchError::WorkerExited {
                exit: WorkerExit::from(status),
            });
        }

        log::debug!("Probing {} (attempt #{}) ...", url, attempt);
        match client.head(&url).send().await {
            Ok(response) => {
                log::info!("... ready after {} attempt(s)", attempt);
                return Ok(Readiness::Ready {
                    attempt,
                    status: response.status().as_u16(),
                });
            }
            Err(e) => log::debug!("... not ready yet: {}", e),
        }

        if attempt < config.attempts {
            tokio::time::sleep(config.interval).await;
        }
    }

    log::warn!(
        "Worker did not answer {} after {} attempts",
        url,
        config.attempts
    );
    Ok(Readiness::NotReady {
        attempts: config.attempts,
    })
}
