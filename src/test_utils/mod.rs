use crate::runtime::{Builder, Runtime};
use std::sync::Once;

pub(crate) mod loader;
pub(crate) use loader::CountingLoader;

pub(crate) mod mocks;
pub(crate) use mocks::mock_waker;

pub(crate) mod tracker;
pub(crate) use tracker::{Method, TrackingScheduler};

static TRACING: Once = Once::new();

/// Installs a fmt subscriber writing through the test harness, once per
/// process. Filtered with `RUST_LOG`, silent by default.
pub(crate) fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Builds a runtime for a test, with 4 workers unless `builder` says
/// otherwise.
pub(crate) fn init_runtime(builder: Option<Builder>) -> Runtime {
    init_tracing();

    let builder = builder.unwrap_or_else(|| Builder::new().worker_threads(4));
    match builder.try_build() {
        Ok(runtime) => runtime,
        Err(e) => panic!("failed to build test runtime: {e:#}"),
    }
}
