//! Shared fixtures for end-to-end tests

use std::sync::Arc;

use kina::provider::ContainerCliProvider;
use kina::{ClusterLifecycle, Settings};

/// Lifecycle engine over the real container CLI, configured from `KINA_*`
pub fn real_lifecycle() -> ClusterLifecycle {
    kina::telemetry::init_tracing();
    let settings = Settings::from_env();
    let provider = Arc::new(ContainerCliProvider::from_settings(&settings));
    ClusterLifecycle::new(provider, settings)
}

/// Best-effort delete, for test teardown
pub async fn cleanup_cluster(lifecycle: &ClusterLifecycle, name: &str) {
    if let Err(e) = lifecycle.delete(name).await {
        eprintln!("cleanup of {name} failed: {e}");
    }
}
