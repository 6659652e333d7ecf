//! Test harness with a shared Redis container.
//!
//! The container is started once on first use and reused across all tests
//! for fast execution. Each test gets its own key namespace, so tests never
//! observe each other's queues.

use anyhow::{Context, Result};
use conveyor::RedisBackend;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    redis_url: String,
    // Keep the container alive for the entire test run
    _redis: ContainerAsync<Redis>,
}

/// Global shared infrastructure - initialized once, reused by all tests.
static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Respect RUST_LOG; try_init() avoids panicking if already set up.
        // Run tests with: RUST_LOG=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let redis = Redis::default()
            .start()
            .await
            .context("Failed to start Redis container")?;

        let host = redis.get_host().await?;
        let port = redis.get_host_port_ipv4(6379).await?;

        Ok(Self {
            redis_url: format!("redis://{}:{}", host, port),
            _redis: redis,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Per-test context: a backend under a fresh namespace on the shared
/// container.
pub struct TestHarness {
    pub backend: RedisBackend,
}

impl TestHarness {
    async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;
        let namespace = format!("test-{}", Uuid::new_v4().simple());
        let backend = RedisBackend::from_url_with_namespace(&infra.redis_url, namespace)?;
        Ok(Self { backend })
    }
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }
}
