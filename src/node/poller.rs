//! Registry poller
//!
//! While MASTER, the registry is periodically refreshed through a
//! [`RegistryRefresher`]. Host probing lives outside this crate; the
//! default refresher only marks the registry as refreshed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::supervisor::StopSignal;
use crate::error::Result;
use crate::registry::{ReplicatedState, ServersData};

/// Hook that brings the registry up to date with the real hosts
pub trait RegistryRefresher: Send + Sync {
    fn refresh(&self, registry: &mut ServersData) -> Result<()>;
}

/// Refresher that only bumps `lastUpdate`
#[derive(Debug, Default, Clone, Copy)]
pub struct TouchRefresher;

impl RegistryRefresher for TouchRefresher {
    fn refresh(&self, registry: &mut ServersData) -> Result<()> {
        registry.touch(Utc::now());
        Ok(())
    }
}

/// Refresh the registry every `interval` until stopped
pub fn run_poller(
    state: Arc<ReplicatedState>,
    refresher: Arc<dyn RegistryRefresher>,
    interval: Duration,
    stop: StopSignal,
) {
    tracing::info!("Registry poller started (every {:?})", interval);

    while !stop.wait_timeout(interval) {
        if let Err(e) = refresh_once(&state, refresher.as_ref()) {
            tracing::warn!("Registry refresh failed, keeping previous registry: {}", e);
        }
    }

    tracing::info!("Registry poller stopped");
}

/// Refresh a copy of the registry and install it only if it is still valid
pub fn refresh_once(state: &ReplicatedState, refresher: &dyn RegistryRefresher) -> Result<()> {
    state.update_registry(|registry| -> Result<()> {
        let mut refreshed = registry.clone();
        refresher.refresh(&mut refreshed)?;
        refreshed.check_invariants()?;
        *registry = refreshed;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServerElement;
    use std::thread;

    struct AddHost;

    impl RegistryRefresher for AddHost {
        fn refresh(&self, registry: &mut ServersData) -> Result<()> {
            registry.upsert(ServerElement::new("srv-polled"));
            Ok(())
        }
    }

    struct DuplicateHost;

    impl RegistryRefresher for DuplicateHost {
        fn refresh(&self, registry: &mut ServersData) -> Result<()> {
            registry.servers.push(ServerElement::new("srv1"));
            registry.touch(Utc::now());
            Ok(())
        }
    }

    #[test]
    fn test_invalid_refresh_keeps_previous_registry() {
        let mut registry = ServersData::new();
        registry.upsert(ServerElement::new("srv1"));
        let state = ReplicatedState::with_registry(registry.clone());

        let err = refresh_once(&state, &DuplicateHost).unwrap_err();
        assert!(matches!(err, crate::Error::Rejected(_)));
        assert_eq!(state.registry(), registry);
        assert!(state.registry().check_invariants().is_ok());

        refresh_once(&state, &AddHost).unwrap();
        assert_eq!(state.registry().servers.len(), 2);
    }

    #[test]
    fn test_touch_refresher_bumps_last_update() {
        let mut registry = ServersData::new();
        assert!(registry.last_update.is_none());
        TouchRefresher.refresh(&mut registry).unwrap();
        assert!(registry.last_update.is_some());
    }

    #[test]
    fn test_poller_applies_refresher() {
        let state = Arc::new(ReplicatedState::new());
        let stop = StopSignal::new();

        let handle = {
            let state = Arc::clone(&state);
            let stop = stop.clone();
            thread::spawn(move || run_poller(state, Arc::new(AddHost), Duration::from_millis(20), stop))
        };

        thread::sleep(Duration::from_millis(100));
        stop.stop();
        handle.join().unwrap();

        assert!(state.registry().get("srv-polled").is_some());
    }
}
