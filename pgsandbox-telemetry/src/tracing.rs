use std::sync::Once;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

/// Default filter directive used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info";

/// Filter used by [`init_test_tracing`] when `RUST_LOG` is not set.
///
/// Server output is forwarded under the `postgres` target and is only interesting when
/// a test fails, so it is kept at `warn`.
const DEFAULT_TEST_FILTER: &str = "pgsandbox=debug,postgres=warn";

// A global subscriber can only be installed once per process, while many tests in the same
// binary call `init_test_tracing`.
static TEST_TRACING: Once = Once::new();

/// Installs a global `fmt` subscriber filtered by `RUST_LOG`.
///
/// `service_name` is attached to every event as the `service` field of a root span,
/// which the caller keeps entered for the lifetime of the process.
pub fn init_tracing(
    service_name: &'static str,
) -> Result<::tracing::span::EnteredSpan, TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()?;

    Ok(::tracing::info_span!("service", service = service_name).entered())
}

/// Installs a test-friendly subscriber once per process.
///
/// Output goes through the libtest capture so it is only printed for failing tests.
pub fn init_test_tracing() {
    TEST_TRACING.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_TEST_FILTER.into());

        // Another subscriber may already be installed by the test harness.
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}
