/// Replacement of a running pool registry by a new one
///
/// ```text
/// old pool:  ACTIVE -> TO_SHUTDOWN -> DRAINING -> RETIRED
/// new pool:  WAIT_FOR_OLD -> ACTIVE        (matched by name)
///            ACTIVE                        (no old pool of that name)
/// ```
///
/// `kick_replacement` is instantaneous. `finish_replacement` is polled by the
/// caller, typically once per event loop tick, until it reports that every
/// old pool has retired.
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::core::connection::{Connection, Transport};
use crate::error::{UmbralError, UmbralResult};
use crate::registry::PoolRegistry;
use crate::utils::{format_duration, Clock};

/// Where a pool stands in a configuration replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReloadState {
    /// Normal operation
    #[default]
    Active,
    /// Marked for replacement, no new clients
    ToShutdown,
    /// Listener closed, existing clients finishing
    Draining,
    /// No clients left, connections released
    Retired,
    /// Replacement waiting for its counterpart to free the listen address
    WaitForOld,
}

impl fmt::Display for ReloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReloadState::Active => write!(f, "active"),
            ReloadState::ToShutdown => write!(f, "to_shutdown"),
            ReloadState::Draining => write!(f, "draining"),
            ReloadState::Retired => write!(f, "retired"),
            ReloadState::WaitForOld => write!(f, "wait_for_old"),
        }
    }
}

/// Drives one old registry to retirement while its successor takes over
pub struct ReloadCoordinator {
    clock: Arc<dyn Clock>,
    kicked_at: Option<u64>,
}

impl ReloadCoordinator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            kicked_at: None,
        }
    }

    /// Start replacing `old` with `new`
    ///
    /// Pools are paired by name. Old pools stop taking clients and close
    /// their listeners; unpaired new pools bind right away, paired ones bind
    /// as soon as their counterpart has let go of the address. A bind error
    /// is returned with the states already advanced, and `advance` may be
    /// called again to retry.
    pub fn kick_replacement<C, T>(
        &mut self,
        old: &mut PoolRegistry<C>,
        new: &mut PoolRegistry<C>,
        transport: &mut T,
    ) -> UmbralResult<()>
    where
        C: Connection,
        T: Transport<Conn = C>,
    {
        if old.is_replacing() || old.iter().any(|pool| pool.state() != ReloadState::Active) {
            return Err(UmbralError::ReloadInProgress);
        }

        for pool in new.iter_mut() {
            match old.by_name_mut(pool.name()) {
                Some(previous) => {
                    previous.set_counterpart(Some(pool.name().to_string()));
                    previous.set_state(ReloadState::ToShutdown);
                    pool.set_counterpart(Some(previous.name().to_string()));
                    pool.set_state(ReloadState::WaitForOld);
                }
                None => pool.set_state(ReloadState::Active),
            }
        }

        for pool in old.iter_mut() {
            if pool.state() == ReloadState::Active {
                pool.set_counterpart(None);
                pool.set_state(ReloadState::ToShutdown);
            }
        }

        old.mark_replacing();
        self.kicked_at = Some(self.clock.now_usec());
        info!(
            "replacing {} pools with {} pools",
            old.len(),
            new.len()
        );

        self.advance(old, new, transport).map(|_| ())
    }

    /// Move both sides forward as far as they can go right now
    ///
    /// Returns true once every new pool is active.
    pub fn advance<C, T>(
        &mut self,
        old: &mut PoolRegistry<C>,
        new: &mut PoolRegistry<C>,
        transport: &mut T,
    ) -> UmbralResult<bool>
    where
        C: Connection,
        T: Transport<Conn = C>,
    {
        for pool in old.iter_mut() {
            if pool.state() == ReloadState::ToShutdown {
                pool.close_listener();
                pool.set_state(ReloadState::Draining);
            }
        }

        for pool in new.iter_mut() {
            match pool.state() {
                ReloadState::WaitForOld => {
                    let vacated = pool
                        .counterpart()
                        .and_then(|name| old.by_name(name))
                        .map_or(true, |previous| {
                            matches!(previous.state(), ReloadState::Draining | ReloadState::Retired)
                        });
                    if !vacated {
                        continue;
                    }
                    pool.bind(transport)?;
                    pool.set_counterpart(None);
                    pool.set_state(ReloadState::Active);
                }
                ReloadState::Active => pool.bind(transport)?,
                other => warn!("pool '{}' unexpected {} during reload", pool.name(), other),
            }
        }

        Ok(new.iter().all(|pool| pool.state() == ReloadState::Active))
    }

    /// Retire drained old pools; true once the whole old registry is done
    ///
    /// # Panics
    ///
    /// If `old` was never passed to `kick_replacement`.
    pub fn finish_replacement<C: Connection>(&mut self, old: &mut PoolRegistry<C>) -> bool {
        assert!(
            old.is_replacing(),
            "finish_replacement on a registry that was never kicked"
        );

        for pool in old.iter_mut() {
            if pool.state() == ReloadState::Draining && pool.client_count() == 0 {
                pool.disconnect();
                pool.set_counterpart(None);
                pool.set_state(ReloadState::Retired);
            }
        }

        let done = old.iter().all(|pool| match pool.state() {
            ReloadState::Retired => true,
            ReloadState::Active => pool.counterpart().is_none(),
            _ => false,
        });

        if done {
            let elapsed = self
                .kicked_at
                .map(|at| self.clock.now_usec().saturating_sub(at))
                .unwrap_or(0);
            info!(
                "replacement finished after {}",
                format_duration(std::time::Duration::from_micros(elapsed))
            );
        } else {
            debug!(
                "replacement pending, {} clients still draining",
                old.iter().map(|pool| pool.client_count()).sum::<usize>()
            );
        }
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, ServerConfig};
    use crate::core::connection::{DryConnection, DryRunTransport};
    use crate::utils::ManualClock;
    use std::time::Duration;

    fn record(name: &str, port: u16) -> PoolConfig {
        PoolConfig::new(
            name,
            &format!("127.0.0.1:{}", port),
            vec![ServerConfig::new("10.0.0.1", 11211, 1)],
        )
    }

    fn registry(clock: &Arc<ManualClock>, records: Vec<PoolConfig>) -> PoolRegistry<DryConnection> {
        PoolRegistry::from_pools(records, clock.clone()).unwrap()
    }

    fn state(registry: &PoolRegistry<DryConnection>, name: &str) -> ReloadState {
        registry.by_name(name).unwrap().state()
    }

    #[test]
    fn test_reload_state_display() {
        assert_eq!(ReloadState::default(), ReloadState::Active);
        assert_eq!(ReloadState::ToShutdown.to_string(), "to_shutdown");
        assert_eq!(ReloadState::WaitForOld.to_string(), "wait_for_old");
    }

    #[test]
    fn test_replace_ab_with_ac() {
        let clock = Arc::new(ManualClock::new(1));
        let mut transport = DryRunTransport::new();
        let mut old = registry(&clock, vec![record("a", 22121), record("b", 22122)]);
        old.bind(&mut transport).unwrap();

        // One client on each old pool keeps them draining.
        let client_a = transport.accept_client(0, "10.9.0.1:40000");
        let client_b = transport.accept_client(1, "10.9.0.2:40000");
        old.get_mut(0).unwrap().accept_client(client_a.clone()).unwrap();
        old.get_mut(1).unwrap().accept_client(client_b.clone()).unwrap();

        let mut new = registry(&clock, vec![record("a", 22121), record("c", 22123)]);
        let mut coordinator = ReloadCoordinator::new(clock.clone());
        coordinator
            .kick_replacement(&mut old, &mut new, &mut transport)
            .unwrap();

        assert_eq!(state(&old, "a"), ReloadState::Draining);
        assert_eq!(state(&old, "b"), ReloadState::Draining);
        assert_eq!(old.by_name("b").unwrap().counterpart(), None);
        assert!(old.get(0).unwrap().listener().is_none());

        assert_eq!(state(&new, "a"), ReloadState::Active);
        assert_eq!(state(&new, "c"), ReloadState::Active);
        assert!(new.by_name("a").unwrap().listener().is_some());
        assert!(transport.is_bound("127.0.0.1:22121"));
        assert!(transport.is_bound("127.0.0.1:22123"));
        assert!(!transport.is_bound("127.0.0.1:22122"));

        // Draining pools refuse new clients.
        let late = transport.accept_client(0, "10.9.0.3:40000");
        assert!(matches!(
            old.get_mut(0).unwrap().accept_client(late),
            Err(UmbralError::PoolNotAccepting {
                state: ReloadState::Draining,
                ..
            })
        ));

        assert!(!coordinator.finish_replacement(&mut old));

        client_a.close();
        assert!(old.connection_closed(client_a.owner(), client_a.id()));
        assert!(!coordinator.finish_replacement(&mut old));
        assert_eq!(state(&old, "a"), ReloadState::Retired);
        assert_eq!(state(&old, "b"), ReloadState::Draining);

        clock.advance(Duration::from_secs(3));
        client_b.close();
        assert!(old.connection_closed(client_b.owner(), client_b.id()));
        assert!(coordinator.finish_replacement(&mut old));
        assert_eq!(state(&old, "b"), ReloadState::Retired);
        assert!(coordinator.finish_replacement(&mut old));
    }

    #[test]
    fn test_replacement_waits_for_address() {
        let clock = Arc::new(ManualClock::new(1));
        let mut transport = DryRunTransport::new();
        let mut old = registry(&clock, vec![record("a", 22121)]);
        old.bind(&mut transport).unwrap();

        // Something else grabs the address the moment the old listener closes.
        let mut new = registry(&clock, vec![record("a", 22121)]);
        let squatter = PoolConfig::new("squatter", "127.0.0.1:22121", vec![]);
        let mut coordinator = ReloadCoordinator::new(clock.clone());

        old.get_mut(0).unwrap().close_listener();
        let held = transport
            .listen(crate::core::connection::ConnOwner::Proxy { pool: 9 }, &squatter)
            .unwrap();

        let result = coordinator.kick_replacement(&mut old, &mut new, &mut transport);
        assert!(matches!(result, Err(UmbralError::Bind { .. })));
        assert_eq!(state(&new, "a"), ReloadState::WaitForOld);

        held.close();
        assert!(coordinator.advance(&mut old, &mut new, &mut transport).unwrap());
        assert_eq!(state(&new, "a"), ReloadState::Active);
        assert_eq!(new.by_name("a").unwrap().counterpart(), None);
    }

    #[test]
    fn test_finish_without_clients_is_immediate() {
        let clock = Arc::new(ManualClock::new(1));
        let mut transport = DryRunTransport::new();
        let mut old = registry(&clock, vec![record("a", 22121)]);
        let mut new = registry(&clock, vec![record("a", 22121)]);
        old.bind(&mut transport).unwrap();

        let mut coordinator = ReloadCoordinator::new(clock.clone());
        coordinator
            .kick_replacement(&mut old, &mut new, &mut transport)
            .unwrap();
        assert!(coordinator.finish_replacement(&mut old));
    }

    #[test]
    fn test_second_kick_rejected() {
        let clock = Arc::new(ManualClock::new(1));
        let mut transport = DryRunTransport::new();
        let mut old = registry(&clock, vec![record("a", 22121)]);
        let mut new = registry(&clock, vec![record("a", 22121)]);
        let mut newer = registry(&clock, vec![record("a", 22121)]);

        let mut coordinator = ReloadCoordinator::new(clock.clone());
        coordinator
            .kick_replacement(&mut old, &mut new, &mut transport)
            .unwrap();
        assert!(matches!(
            coordinator.kick_replacement(&mut old, &mut newer, &mut transport),
            Err(UmbralError::ReloadInProgress)
        ));
    }

    #[test]
    #[should_panic(expected = "never kicked")]
    fn test_finish_without_kick_panics() {
        let clock = Arc::new(ManualClock::new(1));
        let mut old = registry(&clock, vec![record("a", 22121)]);
        ReloadCoordinator::new(clock.clone()).finish_replacement(&mut old);
    }
}
