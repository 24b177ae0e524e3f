/// Connection handles as seen by the routing core
///
/// The core never performs I/O. It asks a `Transport` for listener and
/// backend connections and keeps the handles it gets back. A handle is cheap
/// to clone; cloning is how a caller acquires a reference, dropping is how it
/// releases one. Whoever observes a connection going away reports it through
/// `connection_closed` with the handle's `ConnId` and `ConnOwner`, which is
/// the single point where the core deregisters it.
use std::cell::Cell;
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::rc::Rc;

use tracing::debug;

use crate::config::{PoolConfig, ServerConfig};

/// Opaque connection identifier, unique per transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Back-reference from a connection to whatever owns it, as arena indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnOwner {
    /// Listening connection of a pool
    Proxy { pool: usize },
    /// Accepted client connection of a pool
    Client { pool: usize },
    /// Connection to one backend of a pool
    Server { pool: usize, server: usize },
}

impl ConnOwner {
    pub fn pool(&self) -> usize {
        match *self {
            ConnOwner::Proxy { pool } | ConnOwner::Client { pool } | ConnOwner::Server { pool, .. } => {
                pool
            }
        }
    }
}

impl fmt::Display for ConnOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnOwner::Proxy { pool } => write!(f, "proxy/{}", pool),
            ConnOwner::Client { pool } => write!(f, "client/{}", pool),
            ConnOwner::Server { pool, server } => write!(f, "server/{}/{}", pool, server),
        }
    }
}

/// A connection handle owned by the surrounding connection layer
pub trait Connection: Clone {
    fn id(&self) -> ConnId;

    fn owner(&self) -> ConnOwner;

    /// Whether the connection can still carry requests
    fn is_alive(&self) -> bool;

    /// Ask the connection layer to shut this connection down
    fn close(&self);
}

/// Factory for the connections the core asks for
pub trait Transport {
    type Conn: Connection;

    /// Open the listening connection of a pool
    fn listen(&mut self, owner: ConnOwner, pool: &PoolConfig) -> io::Result<Self::Conn>;

    /// Open a connection to a backend
    fn connect(&mut self, owner: ConnOwner, server: &ServerConfig) -> io::Result<Self::Conn>;
}

/// In-memory connection handed out by `DryRunTransport`
#[derive(Debug, Clone)]
pub struct DryConnection {
    id: ConnId,
    owner: ConnOwner,
    addr: String,
    closed: Rc<Cell<bool>>,
}

impl DryConnection {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

impl Connection for DryConnection {
    fn id(&self) -> ConnId {
        self.id
    }

    fn owner(&self) -> ConnOwner {
        self.owner
    }

    fn is_alive(&self) -> bool {
        !self.closed.get()
    }

    fn close(&self) {
        self.closed.set(true);
    }
}

/// Transport that performs no I/O
///
/// Listening addresses are exclusive: a second `listen` on an address fails
/// with `AddrInUse` until the first listener is closed. Backend addresses can
/// be marked as refusing connections.
#[derive(Debug, Default)]
pub struct DryRunTransport {
    next_id: u64,
    refused: HashSet<String>,
    listeners: Vec<DryConnection>,
    opened: usize,
}

impl DryRunTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make connects to `addr` (`host:port`) fail with `ConnectionRefused`
    pub fn refuse(&mut self, addr: &str) {
        self.refused.insert(addr.to_string());
    }

    /// Let connects to `addr` succeed again
    pub fn restore(&mut self, addr: &str) {
        self.refused.remove(addr);
    }

    /// Backend connections opened so far
    pub fn opened(&self) -> usize {
        self.opened
    }

    /// Whether an open listener holds `addr`
    pub fn is_bound(&self, addr: &str) -> bool {
        self.listeners
            .iter()
            .any(|listener| listener.addr == addr && listener.is_alive())
    }

    /// Simulate a client connecting to a pool
    pub fn accept_client(&mut self, pool: usize, peer: &str) -> DryConnection {
        self.handle(ConnOwner::Client { pool }, peer)
    }

    fn handle(&mut self, owner: ConnOwner, addr: &str) -> DryConnection {
        self.next_id += 1;
        DryConnection {
            id: ConnId(self.next_id),
            owner,
            addr: addr.to_string(),
            closed: Rc::new(Cell::new(false)),
        }
    }
}

impl Transport for DryRunTransport {
    type Conn = DryConnection;

    fn listen(&mut self, owner: ConnOwner, pool: &PoolConfig) -> io::Result<DryConnection> {
        self.listeners.retain(|listener| listener.is_alive());
        if self.is_bound(&pool.listen) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} already bound", pool.listen),
            ));
        }

        let listener = self.handle(owner, &pool.listen);
        self.listeners.push(listener.clone());
        debug!("dry-run listen on {} for {}", pool.listen, owner);
        Ok(listener)
    }

    fn connect(&mut self, owner: ConnOwner, server: &ServerConfig) -> io::Result<DryConnection> {
        let addr = server.address();
        if self.refused.contains(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} refused", addr),
            ));
        }

        self.opened += 1;
        Ok(self.handle(owner, &addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_owner_pool() {
        assert_eq!(ConnOwner::Proxy { pool: 1 }.pool(), 1);
        assert_eq!(ConnOwner::Client { pool: 2 }.pool(), 2);
        assert_eq!(ConnOwner::Server { pool: 3, server: 0 }.pool(), 3);
        assert_eq!(ConnOwner::Server { pool: 3, server: 4 }.to_string(), "server/3/4");
    }

    #[test]
    fn test_dry_connection_close_is_shared() {
        let mut transport = DryRunTransport::new();
        let conn = transport.accept_client(0, "10.1.1.1:50000");
        let copy = conn.clone();

        assert!(copy.is_alive());
        conn.close();
        assert!(!copy.is_alive());
        assert!(copy.is_closed());
        assert_eq!(copy.id(), conn.id());
    }

    #[test]
    fn test_listen_address_is_exclusive() {
        let mut transport = DryRunTransport::new();
        let pool = PoolConfig::new("alpha", "127.0.0.1:22121", vec![]);

        let listener = transport.listen(ConnOwner::Proxy { pool: 0 }, &pool).unwrap();
        assert!(transport.is_bound("127.0.0.1:22121"));

        let err = transport
            .listen(ConnOwner::Proxy { pool: 1 }, &pool)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        listener.close();
        assert!(!transport.is_bound("127.0.0.1:22121"));
        assert!(transport.listen(ConnOwner::Proxy { pool: 1 }, &pool).is_ok());
    }

    #[test]
    fn test_refused_backend() {
        let mut transport = DryRunTransport::new();
        let server = ServerConfig::new("127.0.0.1", 11211, 1);
        let owner = ConnOwner::Server { pool: 0, server: 0 };

        transport.refuse("127.0.0.1:11211");
        let err = transport.connect(owner, &server).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(transport.opened(), 0);

        transport.restore("127.0.0.1:11211");
        let conn = transport.connect(owner, &server).unwrap();
        assert_eq!(conn.addr(), "127.0.0.1:11211");
        assert_eq!(conn.owner(), owner);
        assert_eq!(transport.opened(), 1);
    }
}
