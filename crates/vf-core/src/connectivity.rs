use std::collections::HashSet;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use vf_infra::types::VmEndpoint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReachabilityReport {
    pub attempts: u32,
    /// `name (address:port)` of every endpoint that never answered.
    pub unreachable: Vec<String>,
    unreachable_idx: Vec<usize>,
}

impl ReachabilityReport {
    pub fn all_reachable(&self) -> bool {
        self.unreachable.is_empty()
    }

    /// Endpoints from the probed slice that never answered.
    pub fn unreachable_in<'a>(&self, endpoints: &'a [VmEndpoint]) -> Vec<&'a VmEndpoint> {
        self.unreachable_idx
            .iter()
            .filter_map(|i| endpoints.get(*i))
            .collect()
    }
}

/// Polls TCP reachability of fleet members. Each connect is bounded only by
/// the OS connect timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectivityPoller;

impl ConnectivityPoller {
    pub fn new() -> Self {
        Self
    }

    /// `true` once every endpoint accepted a connection at least once.
    pub async fn wait_reachable<F>(
        &self,
        endpoints: &[VmEndpoint],
        port: F,
        max_attempts: u32,
        interval: Duration,
    ) -> bool
    where
        F: Fn(&VmEndpoint) -> u16,
    {
        self.probe(endpoints, port, max_attempts, interval)
            .await
            .all_reachable()
    }

    pub async fn probe<F>(
        &self,
        endpoints: &[VmEndpoint],
        port: F,
        max_attempts: u32,
        interval: Duration,
    ) -> ReachabilityReport
    where
        F: Fn(&VmEndpoint) -> u16,
    {
        let targets: Vec<Option<(String, u16)>> = endpoints
            .iter()
            .map(|e| e.address().map(|a| (a.to_string(), port(e))))
            .collect();
        for (endpoint, target) in endpoints.iter().zip(&targets) {
            if target.is_none() {
                warn!(vm = %endpoint.name, "endpoint has no address, it can never be reached");
            }
        }

        let mut reached: HashSet<usize> = HashSet::new();
        let mut attempts = 0;

        while attempts < max_attempts {
            attempts += 1;

            let pending: Vec<(usize, &(String, u16))> = targets
                .iter()
                .enumerate()
                .filter(|(i, _)| !reached.contains(i))
                .filter_map(|(i, t)| t.as_ref().map(|t| (i, t)))
                .collect();

            let results = join_all(pending.iter().map(|(i, (address, port))| async move {
                (*i, TcpStream::connect((address.as_str(), *port)).await.is_ok())
            }))
            .await;
            reached.extend(results.into_iter().filter(|(_, ok)| *ok).map(|(i, _)| i));

            if reached.len() == endpoints.len() {
                info!(endpoints = endpoints.len(), attempts, "all endpoints reachable");
                break;
            }

            let waiting: Vec<String> = (0..endpoints.len())
                .filter(|i| !reached.contains(i))
                .map(|i| label(&endpoints[i], targets[i].as_ref()))
                .collect();
            info!(attempt = attempts, max_attempts, still_unreachable = %waiting.join(", "), "waiting for endpoints");

            if attempts < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        let unreachable_idx: Vec<usize> = (0..endpoints.len())
            .filter(|i| !reached.contains(i))
            .collect();
        let unreachable: Vec<String> = unreachable_idx
            .iter()
            .map(|i| label(&endpoints[*i], targets[*i].as_ref()))
            .collect();
        if !unreachable.is_empty() {
            warn!(attempts, unreachable = %unreachable.join(", "), "endpoints never became reachable");
        } else {
            debug!(attempts, "reachability confirmed");
        }

        ReachabilityReport {
            attempts,
            unreachable,
            unreachable_idx,
        }
    }
}

fn label(endpoint: &VmEndpoint, target: Option<&(String, u16)>) -> String {
    match target {
        Some((address, port)) => format!("{} ({address}:{port})", endpoint.name),
        None => format!("{} (no address)", endpoint.name),
    }
}
