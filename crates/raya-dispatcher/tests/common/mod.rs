//! Shared helpers for the integration tests

#![allow(dead_code)]

use raya_dispatcher::{DispatcherConfig, DispatcherRegistry, DispatcherThread};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Route `tracing` output through the test harness (`RUST_LOG=raya_dispatcher=trace`)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A private registry with a short idle wait
pub fn registry() -> Arc<DispatcherRegistry> {
    init_tracing();
    DispatcherRegistry::with_config(
        DispatcherConfig::default().with_idle_wait(Duration::from_millis(10)),
    )
}

/// Spawn an owner thread on a private registry
pub fn owner_thread(name: &str) -> (Arc<DispatcherRegistry>, DispatcherThread) {
    let registry = registry();
    let owner = DispatcherThread::spawn_in(&registry, name).unwrap();
    (registry, owner)
}
