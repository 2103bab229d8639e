pub mod builders;
pub mod fakes;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Upper bound for any single dispatcher, pool or listener test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Route executor logs into the per-test capture buffer, once per binary.
///
/// Defaults to `taskexec=info`; set `RUST_LOG=taskexec=debug` to see
/// sequence building and pool traffic of a failing test.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn,taskexec=info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Await `f`, failing the test if a pool or listener never settles.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    tokio::time::timeout(TEST_TIMEOUT, f)
        .await
        .unwrap_or_else(|_| panic!("nothing settled within {TEST_TIMEOUT:?}"))
}
