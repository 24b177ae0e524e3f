/// TCP reachability probes for pool backends
///
/// Probing is outside the routing core: outcomes are fed back through the
/// same failure/success path the connection layer uses, so a probe can eject
/// a backend exactly as failed requests would.
use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::{PoolConfig, ServerConfig};
use crate::core::connection::Connection;
use crate::core::pool::Pool;
use crate::error::{UmbralError, UmbralResult};

/// Connects to backends with a bounded wait
#[derive(Debug, Clone)]
pub struct Prober {
    connect_timeout: Duration,
}

impl Prober {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Run an I/O future under the connect timeout
    ///
    /// I/O errors surface as `Network`, an expired wait as `Timeout`.
    pub async fn bounded<F, T>(&self, operation: &str, fut: F) -> UmbralResult<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        match timeout(self.connect_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(UmbralError::timeout(operation)),
        }
    }

    pub async fn probe_server(&self, server: &ServerConfig) -> UmbralResult<()> {
        let addr = server.address();
        debug!("Probing server '{}' at {}", server.name, addr);

        let operation = format!("connect to {}", addr);
        let result = self
            .bounded(&operation, TcpStream::connect(addr.as_str()))
            .await
            .map(drop);

        match &result {
            Ok(()) => debug!("Server '{}' reachable", server.name),
            Err(e) => debug!("Probe of server '{}' failed: {}", server.name, e),
        }
        result
    }

    /// Probe every server of a pool, in server order
    pub async fn probe_pool(&self, pool: &PoolConfig) -> Vec<UmbralResult<()>> {
        let mut results = Vec::with_capacity(pool.servers.len());
        for server in &pool.servers {
            results.push(self.probe_server(server).await);
        }
        results
    }
}

impl Default for Prober {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Short label for a probe outcome
pub fn describe(result: &UmbralResult<()>) -> String {
    match result {
        Ok(()) => "ok".to_string(),
        Err(UmbralError::Timeout { .. }) => "timeout".to_string(),
        Err(UmbralError::Network(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            "refused".to_string()
        }
        Err(e) => format!("error: {}", e),
    }
}

/// Feed probe outcomes into a pool's health state; returns the failure count
pub fn apply_results<C: Connection>(pool: &mut Pool<C>, results: &[UmbralResult<()>]) -> usize {
    let mut failures = 0;
    for (server_idx, result) in results.iter().enumerate() {
        if result.is_ok() {
            pool.record_success(server_idx);
        } else {
            pool.record_failure(server_idx);
            failures += 1;
        }
    }
    failures
}
