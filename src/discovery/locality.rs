//! Detection of the caller's own location among discovered nodes.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{select_ok, BoxFuture, FutureExt};
use metrics::histogram;
use tokio::net::TcpStream;
use tracing::debug;

use crate::core::context::Context;
use crate::core::endpoint::Endpoint;
use crate::core::error::{BalancerError, BalancerResult};
use crate::observability::metrics::LOCALITY_PROBE_DURATION;

#[async_trait]
pub trait LocalityDetector: Send + Sync {
    /// Return the location tag of the nodes closest to this process
    async fn detect(&self, ctx: &Context, endpoints: &[Endpoint]) -> BalancerResult<String>;
}

/// Always reports the same location
#[derive(Debug, Clone)]
pub struct FixedLocality(pub String);

#[async_trait]
impl LocalityDetector for FixedLocality {
    async fn detect(&self, _ctx: &Context, _endpoints: &[Endpoint]) -> BalancerResult<String> {
        Ok(self.0.clone())
    }
}

/// Picks the location whose nodes accept a TCP connection first.
///
/// Up to `probes_per_location` addresses of every location are dialed at once;
/// the first successful dial decides. A cluster with a single location is
/// answered without dialing.
#[derive(Debug, Clone)]
pub struct TcpLocalityDetector {
    probes_per_location: usize,
}

impl TcpLocalityDetector {
    pub fn new(probes_per_location: usize) -> Self {
        Self {
            probes_per_location: probes_per_location.max(1),
        }
    }
}

impl Default for TcpLocalityDetector {
    fn default() -> Self {
        Self::new(3)
    }
}

fn group_by_location(endpoints: &[Endpoint]) -> BTreeMap<&str, Vec<&str>> {
    let mut locations: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for endpoint in endpoints {
        locations
            .entry(endpoint.location())
            .or_default()
            .push(endpoint.address());
    }
    locations
}

#[async_trait]
impl LocalityDetector for TcpLocalityDetector {
    async fn detect(&self, ctx: &Context, endpoints: &[Endpoint]) -> BalancerResult<String> {
        let locations = group_by_location(endpoints);

        if locations.is_empty() {
            return Err(BalancerError::locality("no endpoints to detect location from"));
        }
        if locations.len() == 1 {
            return Ok(locations.keys().next().map(|l| l.to_string()).unwrap_or_default());
        }

        let mut probes: Vec<BoxFuture<'static, Result<(String, Duration), String>>> = Vec::new();
        for (location, addresses) in &locations {
            for address in addresses.iter().take(self.probes_per_location) {
                let location = location.to_string();
                let address = address.to_string();
                probes.push(
                    async move {
                        let started = tokio::time::Instant::now();
                        TcpStream::connect(&address)
                            .await
                            .map(|_| (location, started.elapsed()))
                            .map_err(|e| format!("{}: {}", address, e))
                    }
                    .boxed(),
                );
            }
        }

        let probe_count = probes.len();
        let (location, elapsed) = ctx
            .run(select_ok(probes))
            .await?
            .map(|(winner, _pending)| winner)
            .map_err(|last| {
                BalancerError::locality(format!(
                    "all {} location probes failed, last error: {}",
                    probe_count, last
                ))
            })?;

        histogram!(LOCALITY_PROBE_DURATION).record(elapsed.as_secs_f64());
        debug!(
            location = %location,
            probes = probe_count,
            elapsed_ms = elapsed.as_millis() as u64,
            "Detected local location"
        );
        Ok(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_single_location_needs_no_probe() {
        let endpoints = vec![
            Endpoint::new("10.255.255.1:1").with_location("vla"),
            Endpoint::new("10.255.255.2:1").with_location("vla"),
        ];
        let location = TcpLocalityDetector::default()
            .detect(&Context::background(), &endpoints)
            .await
            .unwrap();
        assert_eq!(location, "vla");
    }

    #[tokio::test]
    async fn test_empty_endpoint_list_fails() {
        let err = TcpLocalityDetector::default()
            .detect(&Context::background(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, BalancerError::Locality { .. }));
    }

    #[tokio::test]
    async fn test_reachable_location_wins() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let reachable = listener.local_addr().unwrap().to_string();

        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let unreachable = closed.local_addr().unwrap().to_string();
        drop(closed);

        let endpoints = vec![
            Endpoint::new(unreachable).with_location("man"),
            Endpoint::new(reachable).with_location("sas"),
        ];
        let location = TcpLocalityDetector::default()
            .detect(&Context::background(), &endpoints)
            .await
            .unwrap();
        assert_eq!(location, "sas");
    }

    #[tokio::test]
    async fn test_all_probes_failing() {
        let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoints = vec![
            Endpoint::new(a.local_addr().unwrap().to_string()).with_location("man"),
            Endpoint::new(b.local_addr().unwrap().to_string()).with_location("sas"),
        ];
        drop(a);
        drop(b);

        let err = TcpLocalityDetector::default()
            .detect(&Context::background(), &endpoints)
            .await
            .unwrap_err();
        assert!(matches!(err, BalancerError::Locality { .. }));
    }

    #[tokio::test]
    async fn test_fixed_locality() {
        let location = FixedLocality("klg".to_string())
            .detect(&Context::background(), &[])
            .await
            .unwrap();
        assert_eq!(location, "klg");
    }
}
