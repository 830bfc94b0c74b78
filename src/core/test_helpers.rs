//! Shared test utilities for unit tests
//!
//! This module is only compiled in test mode.

use crate::core::address::Address;
use crate::core::clock::{Clock, ManualClock};
use crate::core::config_store::{ConfigStore, ListName};
use crate::core::filter::{MemoryFilter, PacketFilter};
use crate::core::resolver::{DomainResolver, StaticResolver};
use crate::core::tickets::TicketStore;
use crate::service::{Service, ServiceParts};
use chrono::{DateTime, TimeZone, Utc};
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mutex for tests that need exclusive access to environment variables.
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe { std::env::set_var("SBS_ELEVATION_METHOD", "sudo") };
/// // ...
/// unsafe { std::env::remove_var("SBS_ELEVATION_METHOD") };
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// Parses an address literal, panicking on bad input.
pub fn addr(s: &str) -> Address {
    s.parse().unwrap()
}

/// Fixed reference instant so tests never depend on wall-clock time.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

/// Service over the given collaborators with in-memory tickets and lists
/// under `root`.
pub fn service_with(
    root: &Path,
    filter: Arc<dyn PacketFilter>,
    resolver: Arc<dyn DomainResolver>,
    clock: Arc<dyn Clock>,
) -> Arc<Service> {
    Arc::new(Service::new(ServiceParts {
        tickets: TicketStore::in_memory(),
        configs: ConfigStore::new(root),
        filter,
        resolver,
        clock,
        apply_timeout: Duration::from_secs(5),
        audit: None,
    }))
}

/// Service wired to in-memory collaborators and a temporary config root.
pub struct TestEnv {
    pub service: Arc<Service>,
    pub filter: Arc<MemoryFilter>,
    pub clock: Arc<ManualClock>,
    configs: ConfigStore,
    _dir: tempfile::TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let filter = Arc::new(MemoryFilter::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let ip4: IpAddr = "192.0.2.10".parse().unwrap();
        let ip6: IpAddr = "2001:db8::10".parse().unwrap();
        let resolver = StaticResolver::new().with("portal.example.com", &[ip4, ip6]);

        let service = service_with(dir.path(), filter.clone(), Arc::new(resolver), clock.clone());

        Self {
            service,
            filter,
            clock,
            configs: ConfigStore::new(dir.path()),
            _dir: dir,
        }
    }

    /// Writes a list file without processing it.
    pub async fn configs_write(&self, name: ListName, text: &str) {
        self.configs.write(name, text).await.unwrap();
    }
}
