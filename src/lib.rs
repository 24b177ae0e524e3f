/// Umbral - routing core of a memcached/redis proxy
///
/// Pools map request keys onto backends through a weighted continuum, eject
/// backends that keep failing and readmit them after a retry timeout, and can
/// be replaced wholesale by a new configuration while old clients drain.
///
/// The crate performs no I/O of its own on the request path. The surrounding
/// connection layer supplies a `Transport` that opens connections, and
/// reports closes and exchange outcomes back into the registry.
pub mod config;
pub mod continuum;
pub mod core;
pub mod error;
pub mod hash;
pub mod health;
pub mod probe;
pub mod registry;
pub mod reload;
pub mod utils;

pub use crate::config::{Config, PoolConfig, ServerConfig};
pub use crate::continuum::{Continuum, Distribution};
pub use crate::core::{Backend, ConnId, ConnOwner, Connection, Pool, Transport};
pub use crate::error::{UmbralError, UmbralResult};
pub use crate::hash::{HashKind, KeyHasher};
pub use crate::health::HealthStatus;
pub use crate::registry::{Element, PoolRegistry, PoolSelector};
pub use crate::reload::{ReloadCoordinator, ReloadState};
pub use crate::utils::{Clock, ManualClock, MonotonicClock};
