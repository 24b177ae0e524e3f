/// The set of pools the proxy currently serves
///
/// Pools are stored by position and addressed by that index everywhere else
/// in the crate; a name index sits on the side for selector lookups.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHashMap;
use tracing::info;

use crate::config::{Config, ConfigError, PoolConfig};
use crate::core::backend::Backend;
use crate::core::connection::{ConnId, ConnOwner, Connection, Transport};
use crate::core::pool::Pool;
use crate::error::{UmbralError, UmbralResult};
use crate::health::HealthTransition;
use crate::utils::Clock;

/// How a caller names a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSelector<'a> {
    Index(usize),
    Name(&'a str),
}

impl From<usize> for PoolSelector<'_> {
    fn from(idx: usize) -> Self {
        PoolSelector::Index(idx)
    }
}

impl<'a> From<&'a str> for PoolSelector<'a> {
    fn from(name: &'a str) -> Self {
        PoolSelector::Name(name)
    }
}

impl fmt::Display for PoolSelector<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolSelector::Index(idx) => write!(f, "#{}", idx),
            PoolSelector::Name(name) => write!(f, "'{}'", name),
        }
    }
}

/// One node visited by `PoolRegistry::fold`
pub enum Element<'a, C> {
    Pool(&'a Pool<C>),
    Server(&'a Backend<C>),
    Connection(&'a C),
}

pub struct PoolRegistry<C> {
    pools: Vec<Pool<C>>,
    by_name: FnvHashMap<String, usize>,
    clock: Arc<dyn Clock>,
    /// Set once this registry has been handed to a reload as the old side
    replacing: bool,
}

impl<C: Connection> PoolRegistry<C> {
    /// One pool per record, in record order
    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> UmbralResult<Self> {
        Self::from_pools(config.pools.clone(), clock)
    }

    /// Build every pool or none
    pub fn from_pools(records: Vec<PoolConfig>, clock: Arc<dyn Clock>) -> UmbralResult<Self> {
        let mut pools = Vec::with_capacity(records.len());
        let mut by_name = FnvHashMap::default();

        for (idx, record) in records.into_iter().enumerate() {
            if by_name.insert(record.name.clone(), idx).is_some() {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate pool name '{}'",
                    record.name
                ))
                .into());
            }
            pools.push(Pool::new(idx, record, clock.clone())?);
        }

        info!("registry built with {} pools", pools.len());
        Ok(Self {
            pools,
            by_name,
            clock,
            replacing: false,
        })
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn get(&self, idx: usize) -> Option<&Pool<C>> {
        self.pools.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Pool<C>> {
        self.pools.get_mut(idx)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn by_name(&self, name: &str) -> Option<&Pool<C>> {
        self.index_of(name).and_then(|idx| self.pools.get(idx))
    }

    pub fn by_name_mut(&mut self, name: &str) -> Option<&mut Pool<C>> {
        let idx = self.index_of(name)?;
        self.pools.get_mut(idx)
    }

    pub fn select(&mut self, selector: PoolSelector<'_>) -> UmbralResult<&mut Pool<C>> {
        let idx = match selector {
            PoolSelector::Index(idx) => Some(idx),
            PoolSelector::Name(name) => self.index_of(name),
        };
        idx.and_then(|idx| self.pools.get_mut(idx))
            .ok_or_else(|| UmbralError::unknown_pool(selector.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pool<C>> {
        self.pools.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pool<C>> {
        self.pools.iter_mut()
    }

    pub fn is_replacing(&self) -> bool {
        self.replacing
    }

    pub(crate) fn mark_replacing(&mut self) {
        self.replacing = true;
    }

    /// Apply `f` to every pool in order, stopping at the first error
    pub fn for_each<F, E>(&mut self, mut f: F) -> Result<(), E>
    where
        F: FnMut(&mut Pool<C>) -> Result<(), E>,
    {
        for pool in &mut self.pools {
            f(pool)?;
        }
        Ok(())
    }

    /// Route a key through the selected pool
    pub fn locate<'a, S, T>(&mut self, selector: S, key: &[u8], transport: &mut T) -> UmbralResult<C>
    where
        S: Into<PoolSelector<'a>>,
        T: Transport<Conn = C>,
    {
        self.select(selector.into())?.route(key, transport)
    }

    /// Depth-first walk threading an accumulator through every pool, then
    /// each of its servers, then each server's connections
    pub fn fold<A, F>(&self, init: A, mut visit: F) -> A
    where
        F: FnMut(Element<'_, C>, A) -> A,
    {
        let mut acc = init;
        for pool in &self.pools {
            acc = visit(Element::Pool(pool), acc);
            for backend in pool.backends() {
                acc = visit(Element::Server(backend), acc);
                for conn in backend.connections() {
                    acc = visit(Element::Connection(conn), acc);
                }
            }
        }
        acc
    }

    /// Bind every pool that is not yet listening
    pub fn bind<T>(&mut self, transport: &mut T) -> UmbralResult<()>
    where
        T: Transport<Conn = C>,
    {
        self.for_each(|pool| pool.bind(transport))
    }

    pub fn preconnect<T>(&mut self, transport: &mut T) -> usize
    where
        T: Transport<Conn = C>,
    {
        self.pools
            .iter_mut()
            .map(|pool| pool.preconnect(transport))
            .sum()
    }

    pub fn disconnect(&mut self) {
        for pool in &mut self.pools {
            pool.disconnect();
        }
    }

    /// Deregister a closed connection from whichever pool owns it
    pub fn connection_closed(&mut self, owner: ConnOwner, id: ConnId) -> bool {
        self.pools
            .get_mut(owner.pool())
            .map(|pool| pool.connection_closed(owner, id))
            .unwrap_or(false)
    }

    /// Idle timeout of a connection, resolved through the pool that owns it
    pub fn server_timeout(&self, owner: ConnOwner) -> Option<Duration> {
        self.pools.get(owner.pool()).and_then(Pool::server_timeout)
    }

    pub fn record_failure(&mut self, pool: usize, server: usize) -> HealthTransition {
        self.pools
            .get_mut(pool)
            .map(|p| p.record_failure(server))
            .unwrap_or(HealthTransition::Unchanged)
    }

    pub fn record_success(&mut self, pool: usize, server: usize) {
        if let Some(p) = self.pools.get_mut(pool) {
            p.record_success(server);
        }
    }

    /// One line per pool and per server
    pub fn summary(&self) -> Vec<String> {
        self.fold(Vec::new(), |element, mut lines| {
            match element {
                Element::Pool(pool) => lines.push(format!(
                    "pool {} '{}' {} {} listen {} {}/{} live {}/{} points {} clients {}",
                    pool.idx(),
                    pool.name(),
                    pool.state(),
                    if pool.config().redis { "redis" } else { "memcache" },
                    pool.config().listen,
                    pool.config().distribution,
                    pool.config().hash,
                    pool.live_count(),
                    pool.backends().len(),
                    pool.continuum().len(),
                    pool.client_count(),
                )),
                Element::Server(backend) => lines.push(format!(
                    "  server {} '{}' {} weight {} {} failures {} conns {}",
                    backend.idx(),
                    backend.name(),
                    backend.config().address(),
                    backend.weight(),
                    backend.status(),
                    backend.health().failure_count(),
                    backend.conn_count(),
                )),
                Element::Connection(_) => {}
            }
            lines
        })
    }

    /// Emit `summary` through the log, each line prefixed
    pub fn log_summary(&self, prefix: &str) {
        for line in self.summary() {
            info!("{}{}", prefix, line);
        }
    }
}
