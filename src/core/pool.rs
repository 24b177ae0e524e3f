/// Server pool: one routing domain
///
/// A pool owns its backends, their continuum, its listening connection and
/// its client connections. All state changes happen through the methods
/// below, on the caller's thread, and are visible to the next call.
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::continuum::{Continuum, Distribution, RingMember};
use crate::core::backend::Backend;
use crate::core::connection::{ConnId, ConnOwner, Connection, Transport};
use crate::error::{LimitScope, UmbralError, UmbralResult};
use crate::hash::KeyHasher;
use crate::health::{HealthPolicy, HealthTransition};
use crate::reload::ReloadState;
use crate::utils::{extract_hash_tag, Clock};

pub struct Pool<C> {
    idx: usize,
    config: PoolConfig,
    policy: HealthPolicy,
    hasher: Box<dyn KeyHasher>,
    hash_tag: Option<[u8; 2]>,
    backends: Vec<Backend<C>>,
    continuum: Continuum,
    /// Live backends right now, ahead of any pending rebuild
    nlive: usize,
    ring_dirty: bool,
    next_rebuild: u64,
    listener: Option<C>,
    clients: FnvHashMap<ConnId, C>,
    rng: StdRng,
    clock: Arc<dyn Clock>,
    state: ReloadState,
    counterpart: Option<String>,
}

impl<C: Connection> Pool<C> {
    /// Build a pool from its record; the record is validated first
    pub fn new(idx: usize, config: PoolConfig, clock: Arc<dyn Clock>) -> UmbralResult<Self> {
        config.validate()?;

        let backends: Vec<Backend<C>> = config
            .servers
            .iter()
            .enumerate()
            .map(|(server_idx, server)| Backend::new(idx, server_idx, server.clone()))
            .collect();
        let continuum = {
            let members: Vec<RingMember<'_>> = backends.iter().map(Backend::ring_member).collect();
            Continuum::new(config.distribution, &members)
        };

        debug!(
            "pool {} '{}' with {} servers, {} of {} points",
            idx,
            config.name,
            backends.len(),
            continuum.len(),
            continuum.point_budget()
        );

        Ok(Self {
            idx,
            policy: HealthPolicy::from(&config),
            hasher: Box::new(config.hash),
            hash_tag: config.hash_tag_pair(),
            nlive: backends.len(),
            backends,
            continuum,
            ring_dirty: false,
            next_rebuild: 0,
            listener: None,
            clients: FnvHashMap::default(),
            rng: StdRng::from_entropy(),
            clock,
            state: ReloadState::Active,
            counterpart: None,
            config,
        })
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn backends(&self) -> &[Backend<C>] {
        &self.backends
    }

    pub fn backend(&self, server_idx: usize) -> Option<&Backend<C>> {
        self.backends.get(server_idx)
    }

    pub fn continuum(&self) -> &Continuum {
        &self.continuum
    }

    pub fn live_count(&self) -> usize {
        self.nlive
    }

    pub fn is_ring_dirty(&self) -> bool {
        self.ring_dirty
    }

    pub fn listener(&self) -> Option<&C> {
        self.listener.as_ref()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn state(&self) -> ReloadState {
        self.state
    }

    /// Name of the pool replacing, or being replaced by, this one
    pub fn counterpart(&self) -> Option<&str> {
        self.counterpart.as_deref()
    }

    pub(crate) fn set_state(&mut self, state: ReloadState) {
        if self.state != state {
            info!("pool '{}' {} -> {}", self.config.name, self.state, state);
            self.state = state;
        }
    }

    pub(crate) fn set_counterpart(&mut self, counterpart: Option<String>) {
        self.counterpart = counterpart;
    }

    /// Idle timeout for connections of this pool
    pub fn server_timeout(&self) -> Option<Duration> {
        self.config.timeout()
    }

    /// Replace the configured key hash function
    pub fn set_hasher(&mut self, hasher: Box<dyn KeyHasher>) {
        self.hasher = hasher;
    }

    /// Make `random` distribution draws reproducible
    pub fn seed_random(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Ring position of a key
    ///
    /// A configured hash tag narrows the key to the text inside it. An empty
    /// key, or a pool with a single backend, always hashes to 0.
    pub fn hash_key(&self, key: &[u8]) -> u32 {
        if self.backends.len() == 1 || key.is_empty() {
            return 0;
        }

        let key = match self.hash_tag {
            Some(tag) => extract_hash_tag(key, tag),
            None => key,
        };
        self.hasher.hash(key)
    }

    /// Index of the backend a key routes to, without touching connections
    pub fn backend_index(&mut self, key: &[u8]) -> UmbralResult<usize> {
        self.update();

        if self.nlive == 0 {
            return Err(UmbralError::no_backend(&self.config.name));
        }

        let hash = match self.config.distribution {
            Distribution::Random => self.rng.gen::<u32>(),
            Distribution::Ketama | Distribution::Modula => self.hash_key(key),
        };

        self.continuum
            .locate(hash)
            .ok_or_else(|| UmbralError::no_backend(&self.config.name))
    }

    /// Route a key to a backend connection
    ///
    /// Opens a new connection while the backend is below `server_connections`,
    /// otherwise hands back its existing live connections in turn.
    pub fn route<T>(&mut self, key: &[u8], transport: &mut T) -> UmbralResult<C>
    where
        T: Transport<Conn = C>,
    {
        if self.state == ReloadState::Retired {
            return Err(UmbralError::PoolNotAccepting {
                pool: self.config.name.clone(),
                state: self.state,
            });
        }

        let server_idx = self.backend_index(key)?;
        let limit = self.config.server_connections;
        let backend = &mut self.backends[server_idx];

        if backend.conn_count() >= limit {
            return backend
                .rotate()
                .ok_or_else(|| UmbralError::limit(&self.config.name, LimitScope::Server, limit));
        }

        match transport.connect(backend.owner(), backend.config()) {
            Ok(conn) => {
                backend.attach(conn.clone());
                self.server_connected(server_idx, conn.id());
                Ok(conn)
            }
            Err(source) => {
                let server = backend.name().to_string();
                self.record_failure(server_idx);
                Err(UmbralError::ConnectFailed {
                    pool: self.config.name.clone(),
                    server,
                    source,
                })
            }
        }
    }

    /// Readmit eligible backends and rebuild the ring if it is due
    pub fn update(&mut self) {
        let now = self.clock.now_usec();

        for backend in &mut self.backends {
            if backend.try_readmit(now).changes_ring() {
                info!(
                    "pool '{}' readmitting server '{}'",
                    self.config.name,
                    backend.name()
                );
                self.nlive += 1;
                self.ring_dirty = true;
            }
        }

        if self.ring_dirty && now >= self.next_rebuild {
            self.rebuild_at(now);
        }
    }

    /// Rebuild the ring now, ignoring the throttle
    pub fn rebuild(&mut self) {
        let now = self.clock.now_usec();
        self.rebuild_at(now);
    }

    fn rebuild_at(&mut self, now: u64) {
        let members: Vec<RingMember<'_>> = self.backends.iter().map(Backend::ring_member).collect();
        self.continuum.rebuild(&members);
        self.nlive = self.continuum.live_count();
        self.ring_dirty = false;
        self.next_rebuild = now.saturating_add(self.config.rebuild_interval().as_micros() as u64);

        debug!(
            "pool '{}' rebuilt continuum with {} live servers, {} of {} points",
            self.config.name,
            self.nlive,
            self.continuum.len(),
            self.continuum.point_budget()
        );
    }

    /// Report a failed connect or I/O exchange on a backend
    pub fn record_failure(&mut self, server_idx: usize) -> HealthTransition {
        let now = self.clock.now_usec();
        let Some(backend) = self.backends.get_mut(server_idx) else {
            return HealthTransition::Unchanged;
        };

        let transition = backend.record_failure(&self.policy, now);
        if let HealthTransition::Ejected { next_retry } = transition {
            warn!(
                "pool '{}' ejecting server '{}' after {} failures, retry in {}",
                self.config.name,
                backend.name(),
                backend.health().failure_count(),
                crate::utils::format_duration(Duration::from_micros(next_retry - now))
            );
            self.nlive -= 1;
        } else {
            debug!(
                "pool '{}' server '{}' failure {}",
                self.config.name,
                backend.name(),
                backend.health().failure_count()
            );
        }
        self.ring_dirty |= transition.changes_ring();
        transition
    }

    /// Report a successful exchange on a backend
    pub fn record_success(&mut self, server_idx: usize) {
        if let Some(backend) = self.backends.get_mut(server_idx) {
            backend.record_success();
        }
    }

    /// A backend connection finished connecting
    ///
    /// A completed connect counts as a success, clearing the failure counter.
    pub fn server_connected(&mut self, server_idx: usize, conn: ConnId) {
        if let Some(backend) = self.backends.get_mut(server_idx) {
            debug!(
                "pool '{}' connected to server '{}' on {}",
                self.config.name,
                backend.name(),
                conn
            );
            backend.record_success();
        }
    }

    /// Open one connection to every live backend, if the pool asks for it
    ///
    /// Failures count as ordinary backend failures. Returns the number of
    /// connections opened.
    pub fn preconnect<T>(&mut self, transport: &mut T) -> usize
    where
        T: Transport<Conn = C>,
    {
        if !self.config.preconnect {
            return 0;
        }

        let mut opened = 0;
        for server_idx in 0..self.backends.len() {
            let backend = &mut self.backends[server_idx];
            if !backend.is_live() || backend.conn_count() > 0 {
                continue;
            }

            match transport.connect(backend.owner(), backend.config()) {
                Ok(conn) => {
                    let id = conn.id();
                    backend.attach(conn);
                    self.server_connected(server_idx, id);
                    opened += 1;
                }
                Err(e) => {
                    warn!(
                        "pool '{}' preconnect to server '{}' failed: {}",
                        self.config.name,
                        backend.name(),
                        e
                    );
                    self.record_failure(server_idx);
                }
            }
        }
        opened
    }

    /// Open the listening connection
    pub fn bind<T>(&mut self, transport: &mut T) -> UmbralResult<()>
    where
        T: Transport<Conn = C>,
    {
        if self.listener.is_some() {
            return Ok(());
        }

        let listener = transport
            .listen(ConnOwner::Proxy { pool: self.idx }, &self.config)
            .map_err(|source| UmbralError::Bind {
                pool: self.config.name.clone(),
                source,
            })?;

        info!("pool '{}' listening on {}", self.config.name, self.config.listen);
        self.listener = Some(listener);
        Ok(())
    }

    /// Close the listening connection; false if there was none
    pub fn close_listener(&mut self) -> bool {
        match self.listener.take() {
            Some(listener) => {
                listener.close();
                info!("pool '{}' closed listener on {}", self.config.name, self.config.listen);
                true
            }
            None => false,
        }
    }

    /// Register an accepted client connection
    ///
    /// A pool that is not active, or is at its client cap, closes the
    /// connection and reports why.
    pub fn accept_client(&mut self, conn: C) -> UmbralResult<()> {
        if self.state != ReloadState::Active {
            conn.close();
            return Err(UmbralError::PoolNotAccepting {
                pool: self.config.name.clone(),
                state: self.state,
            });
        }

        let limit = self.config.client_connections;
        if limit > 0 && self.clients.len() >= limit as usize {
            conn.close();
            return Err(UmbralError::limit(&self.config.name, LimitScope::Client, limit));
        }

        debug!("pool '{}' accepted client {}", self.config.name, conn.id());
        self.clients.insert(conn.id(), conn);
        Ok(())
    }

    /// Deregister a closed connection of this pool
    ///
    /// Returns false when the connection was already gone, so a repeated
    /// close notification is harmless.
    pub fn connection_closed(&mut self, owner: ConnOwner, id: ConnId) -> bool {
        match owner {
            ConnOwner::Proxy { .. } => {
                if self.listener.as_ref().map(Connection::id) == Some(id) {
                    self.listener = None;
                    true
                } else {
                    false
                }
            }
            ConnOwner::Client { .. } => self.clients.remove(&id).is_some(),
            ConnOwner::Server { server, .. } => self
                .backends
                .get_mut(server)
                .and_then(|backend| backend.detach(id))
                .is_some(),
        }
    }

    /// Close every connection the pool owns; safe to call repeatedly
    pub fn disconnect(&mut self) {
        self.close_listener();

        let clients = self.clients.len();
        for (_, conn) in self.clients.drain() {
            conn.close();
        }

        let servers: usize = self.backends.iter_mut().map(Backend::close_all).sum();
        if clients > 0 || servers > 0 {
            debug!(
                "pool '{}' disconnected {} clients, {} server conns",
                self.config.name, clients, servers
            );
        }
    }
}
