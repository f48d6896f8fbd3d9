#![allow(dead_code)]

use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    util::SubscriberInitExt,
};

/// Installs a `tracing` subscriber for the current test, returning a guard
/// that must be held for the rest of the test.
pub fn trace_init() -> tracing::subscriber::DefaultGuard {
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
    let filter = if env.is_empty() {
        builder
            .parse("offset=debug,offset_rt=debug,offset_sync=debug")
            .unwrap()
    } else {
        builder.parse_lossy(env)
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .without_time()
        .finish()
        .set_default()
}

/// Yields `n` times, letting every other runnable task make progress.
pub async fn settle(n: usize) {
    offset::future::Yield::new(n).await
}
