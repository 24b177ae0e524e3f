/// One backend endpoint of a pool
use std::collections::VecDeque;

use tracing::debug;

use crate::config::ServerConfig;
use crate::continuum::RingMember;
use crate::core::connection::{ConnId, ConnOwner, Connection};
use crate::health::{HealthPolicy, HealthState, HealthStatus, HealthTransition};

/// A backend and the connections it currently owns
#[derive(Debug)]
pub struct Backend<C> {
    idx: usize,
    pool_idx: usize,
    config: ServerConfig,
    conns: VecDeque<C>,
    /// Tracked apart from `conns` so accounting never walks the queue
    nconns: u32,
    health: HealthState,
}

impl<C: Connection> Backend<C> {
    pub fn new(pool_idx: usize, idx: usize, config: ServerConfig) -> Self {
        Self {
            idx,
            pool_idx,
            config,
            conns: VecDeque::new(),
            nconns: 0,
            health: HealthState::new(),
        }
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn pool_idx(&self) -> usize {
        self.pool_idx
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn weight(&self) -> u32 {
        self.config.weight
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn owner(&self) -> ConnOwner {
        ConnOwner::Server {
            pool: self.pool_idx,
            server: self.idx,
        }
    }

    pub fn ring_member(&self) -> RingMember<'_> {
        RingMember {
            index: self.idx,
            name: &self.config.name,
            weight: self.config.weight,
            live: self.health.is_live(),
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.health.status()
    }

    pub fn is_live(&self) -> bool {
        self.health.is_live()
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }

    pub fn conn_count(&self) -> u32 {
        self.nconns
    }

    pub fn connections(&self) -> impl Iterator<Item = &C> {
        self.conns.iter()
    }

    /// Take a reference on a new connection
    pub fn attach(&mut self, conn: C) {
        debug!(
            "ref conn {} to server '{}', {} conns",
            conn.id(),
            self.config.name,
            self.nconns + 1
        );
        self.conns.push_back(conn);
        self.nconns += 1;
    }

    /// Drop the reference on a connection; unknown ids are ignored
    pub fn detach(&mut self, id: ConnId) -> Option<C> {
        let pos = self.conns.iter().position(|conn| conn.id() == id)?;
        let conn = self.conns.remove(pos)?;
        self.nconns -= 1;
        debug!(
            "unref conn {} from server '{}', {} conns",
            id, self.config.name, self.nconns
        );
        Some(conn)
    }

    /// Next live connection in round-robin order
    pub fn rotate(&mut self) -> Option<C> {
        for _ in 0..self.conns.len() {
            let conn = self.conns.pop_front()?;
            let alive = conn.is_alive();
            self.conns.push_back(conn);
            if alive {
                return self.conns.back().cloned();
            }
        }
        None
    }

    /// Close and deregister every connection
    pub fn close_all(&mut self) -> usize {
        let closed = self.conns.len();
        for conn in self.conns.drain(..) {
            conn.close();
        }
        self.nconns = 0;
        closed
    }

    pub(crate) fn record_failure(&mut self, policy: &HealthPolicy, now_usec: u64) -> HealthTransition {
        self.health.record_failure(policy, now_usec)
    }

    pub(crate) fn record_success(&mut self) {
        self.health.record_success();
    }

    pub(crate) fn try_readmit(&mut self, now_usec: u64) -> HealthTransition {
        self.health.try_readmit(now_usec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::{DryConnection, DryRunTransport, Transport};

    fn backend() -> (Backend<DryConnection>, DryRunTransport) {
        let config = ServerConfig::new("127.0.0.1", 11211, 2).with_name("cache-a");
        (Backend::new(1, 3, config), DryRunTransport::new())
    }

    #[test]
    fn test_backend_identity() {
        let (backend, _) = backend();
        assert_eq!(backend.name(), "cache-a");
        assert_eq!(backend.weight(), 2);
        assert_eq!(backend.owner(), ConnOwner::Server { pool: 1, server: 3 });

        let member = backend.ring_member();
        assert_eq!(member.index, 3);
        assert_eq!(member.name, "cache-a");
        assert!(member.live);
    }

    #[test]
    fn test_attach_detach_counts() {
        let (mut backend, mut transport) = backend();
        let first = transport.connect(backend.owner(), backend.config()).unwrap();
        let second = transport.connect(backend.owner(), backend.config()).unwrap();

        backend.attach(first.clone());
        backend.attach(second.clone());
        assert_eq!(backend.conn_count(), 2);

        assert!(backend.detach(first.id()).is_some());
        assert!(backend.detach(first.id()).is_none());
        assert_eq!(backend.conn_count(), 1);
        assert_eq!(backend.connections().count(), 1);
    }

    #[test]
    fn test_rotate_skips_dead_connections() {
        let (mut backend, mut transport) = backend();
        let conns: Vec<_> = (0..3)
            .map(|_| transport.connect(backend.owner(), backend.config()).unwrap())
            .collect();
        for conn in &conns {
            backend.attach(conn.clone());
        }

        assert_eq!(backend.rotate().map(|c| c.id()), Some(conns[0].id()));
        assert_eq!(backend.rotate().map(|c| c.id()), Some(conns[1].id()));

        conns[2].close();
        assert_eq!(backend.rotate().map(|c| c.id()), Some(conns[0].id()));

        for conn in &conns {
            conn.close();
        }
        assert!(backend.rotate().is_none());
    }

    #[test]
    fn test_close_all() {
        let (mut backend, mut transport) = backend();
        let conn = transport.connect(backend.owner(), backend.config()).unwrap();
        backend.attach(conn.clone());

        assert_eq!(backend.close_all(), 1);
        assert!(conn.is_closed());
        assert_eq!(backend.conn_count(), 0);
        assert_eq!(backend.close_all(), 0);
    }
}
