// crates/test-utils/src/lib.rs

//! Shared helpers for pipedag's integration tests: node builders, a scripted
//! executor backend, tracing setup and run timeouts.

pub mod builders;
pub mod fake_executor;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt};

static TRACING: Once = Once::new();

/// Upper bound for a whole test run; every scenario finishes well inside it.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a test-captured subscriber once per test binary.
///
/// The filter comes from `PIPEDAG_LOG` (same variable the library reads),
/// falling back to `pipedag=info`. Output only shows for failing tests
/// unless `--nocapture` is passed.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = std::env::var("PIPEDAG_LOG")
            .ok()
            .and_then(|s| EnvFilter::try_new(s).ok())
            .unwrap_or_else(|| EnvFilter::new("pipedag=info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Await a run (or any future), panicking if it outlives [`RUN_TIMEOUT`].
pub async fn with_timeout<F, T>(run: F) -> T
where
    F: Future<Output = T>,
{
    within(RUN_TIMEOUT, run).await
}

/// Like [`with_timeout`] with an explicit bound.
pub async fn within<F, T>(limit: Duration, run: F) -> T
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(limit, run).await {
        Ok(value) => value,
        Err(_) => panic!("run did not finish within {limit:?}; a step or the scheduler is stuck"),
    }
}
