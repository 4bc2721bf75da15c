//! Common test utilities for foundry-control integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use foundry_control::config::{BuildConfig, MatrixConfig};
use foundry_control::model::Entity;
use foundry_control::{
    ApiVersion, CallerContext, Callback, Component, Factory, FactoryConfig, Inventory, Language,
    LibraryKind, MemoryCi, MemoryGenerator, MemoryVersionControl, Resource, ResourceId, Status,
};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs a test log writer honouring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// API spec committed by [`TestFactory::ready_api_version`].
pub const ORDERS_SPEC: &str = "openapi: 3.0.0\ninfo:\n  title: orders\n  version: 1.0.0\n";

/// A factory over in-memory backends with fast builds.
pub struct TestFactory {
    pub factory: Factory,
    pub vcs: Arc<MemoryVersionControl>,
    pub ci: Arc<MemoryCi>,
    pub generator: Arc<MemoryGenerator>,
}

impl TestFactory {
    /// Creates a factory that polls builds every 10ms.
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    /// Creates a factory from `config` with fresh in-memory backends.
    pub fn with_config(config: FactoryConfig) -> Self {
        init_tracing();
        let vcs = Arc::new(MemoryVersionControl::new());
        let ci = Arc::new(MemoryCi::new());
        let generator = Arc::new(MemoryGenerator::new());

        let factory = Factory::builder()
            .config(config)
            .inventory(Inventory::memory())
            .version_control(vcs.clone())
            .ci(ci.clone())
            .generator(generator.clone())
            .build();

        Self {
            factory,
            vcs,
            ci,
            generator,
        }
    }

    pub fn inventory(&self) -> &Inventory {
        self.factory.inventory()
    }

    /// Group `/acme` and a READY component `orders` in it.
    pub async fn ready_component(&self) -> Component {
        self.factory
            .groups()
            .create(&ctx(), "acme", "/acme")
            .await
            .unwrap();
        let component = self
            .factory
            .components()
            .create(&ctx(), "orders", "Order service", "/acme", Callback::none())
            .await
            .unwrap()
            .into_resource();
        wait_for_status::<Component>(self.inventory(), component.id(), Status::Ready).await
    }

    /// A READY API version `1.0.0` of `component`.
    pub async fn ready_api_version(&self, component: &Component) -> ApiVersion {
        let api_version = self
            .factory
            .api_versions()
            .create(&ctx(), component, "1.0.0", ORDERS_SPEC, Callback::none())
            .await
            .unwrap()
            .into_resource();
        wait_for_status::<ApiVersion>(self.inventory(), api_version.id(), Status::Ready).await
    }
}

impl Default for TestFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration polling builds every 10ms with a two by two library matrix.
pub fn fast_config() -> FactoryConfig {
    let mut config = FactoryConfig::default();
    config.build = BuildConfig {
        poll_interval: Duration::from_millis(10),
        timeout: Duration::from_secs(5),
    };
    config.matrix = MatrixConfig {
        languages: vec![Language::Java, Language::Python],
        kinds: vec![LibraryKind::Client, LibraryKind::Server],
        library_stagger: Duration::from_millis(1),
    };
    config
}

/// Caller with a deploy key.
pub fn ctx() -> CallerContext {
    CallerContext::new("alice").with_deploy_key("deploy-key-1")
}

/// Polls the inventory until `id` reaches `status`.
pub async fn wait_for_status<E: Entity>(
    inventory: &Inventory,
    id: &ResourceId,
    status: Status,
) -> E {
    for _ in 0..500 {
        let entity: E = inventory.require(&ctx(), id).await.unwrap();
        if entity.status() == status {
            return entity;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let entity: E = inventory.require(&ctx(), id).await.unwrap();
    panic!("{id} stuck in {} waiting for {status}", entity.status());
}

/// Polls until `counter` reaches `expected`.
pub async fn wait_for_count(counter: &AtomicUsize, expected: usize) {
    for _ in 0..500 {
        if counter.load(Ordering::SeqCst) >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("counter stuck at {}", counter.load(Ordering::SeqCst));
}

/// A callback counting how many times it fired.
pub fn counting_callback(counter: &Arc<AtomicUsize>) -> Callback {
    let counter = Arc::clone(counter);
    Callback::new(move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}
