//! Shared fixtures for the `watchbuild` integration tests.
//!
//! - [`workspace`]: a source tree, state directory and `dev` target, either
//!   in memory or on disk.
//! - [`builders`]: small task definitions that count their invocations.

pub mod builders;
pub mod workspace;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt};
use watchbuild::logging::LOG_ENV_VAR;

pub use workspace::Workspace;

static INIT: Once = Once::new();

/// Upper bound on any single awaited build step in a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Install a per-test tracing subscriber once per test binary.
///
/// Output goes through `with_test_writer()`, so it only shows for failing
/// tests. The filter comes from `WATCHBUILD_LOG`
/// (`WATCHBUILD_LOG=watchbuild=debug cargo test`), defaulting to `info`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Await `f`, failing the test if it takes longer than [`TEST_TIMEOUT`].
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(TEST_TIMEOUT, f).await {
        Ok(out) => out,
        Err(_) => panic!("build step did not finish within {TEST_TIMEOUT:?}"),
    }
}
