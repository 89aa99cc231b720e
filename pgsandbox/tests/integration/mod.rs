mod cluster_test;
mod resources_test;

use std::sync::Arc;

use pgsandbox::SandboxConfig;
use pgsandbox::test_utils::cluster::{postgres_binaries_available, test_config};
use tracing::warn;

/// Returns the test configuration, or `None` when the PostgreSQL binaries are missing.
fn sandbox_config() -> Option<Arc<SandboxConfig>> {
    let config = Arc::new(test_config());
    if !postgres_binaries_available(&config) {
        warn!("skipping test, postgres binaries are not installed");
        return None;
    }

    Some(config)
}
