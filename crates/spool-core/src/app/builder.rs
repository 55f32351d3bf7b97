//! EngineBuilder - wiring and startup validation.
//!
//! Fail-fast: `expect_handlers` names the handlers the application relies on,
//! and `build` refuses to start when any of them is missing.
//!
//! # 学習ポイント
//! - Builder パターン: store や clock などの port をデフォルト付きで差し替えられるようにする
//! - 起動時検証 (fail-fast): 足りない handler は `build` で `BuildError` になる
//! - `build` は store を読み込み、未完了の invocation を再開してから返す

use std::sync::Arc;

use super::config::EngineConfig;
use super::engine::{Engine, EngineParts};
use crate::impls::InMemoryStore;
use crate::ports::{
    Clock, DurableStore, IdGenerator, ServiceClient, StoreError, SystemClock, UlidGenerator,
};
use crate::typed::{RegistryError, ServiceDefinition, ServiceRegistry};

/// Builds an `Engine`.
///
/// ```
/// use spool_core::{
///     Context, EngineBuilder, HandlerError, InvocationTarget, ServiceDefinition, handler_fn,
/// };
///
/// async fn deposit(ctx: Context, cents: u64) -> Result<u64, HandlerError> {
///     let balance: u64 = ctx.get_state("balance")?.unwrap_or(0);
///     ctx.set_state("balance", &(balance + cents))?;
///     Ok(balance + cents)
/// }
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let account = ServiceDefinition::virtual_object("account").handler("deposit", handler_fn(deposit));
/// let engine = EngineBuilder::new()
///     .service(account)?
///     .expect_handlers(&["account/deposit"])
///     .build()
///     .await?;
///
/// let response = engine
///     .invoke(InvocationTarget::keyed("account", "deposit", "A"), &250u64)
///     .await?;
/// assert_eq!(response.value(), Some(&serde_json::json!(250)));
/// engine.shutdown().await;
/// # Ok(())
/// # }
/// ```
///
/// Add `.store(FileStore::open(path).await?)` to keep the journal on disk.
///
/// Defaults: `InMemoryStore`, `SystemClock`, ULID ids, `EngineConfig::default()`,
/// no remote client.
pub struct EngineBuilder {
    registry: ServiceRegistry,
    expected_handlers: Option<Vec<String>>,
    store: Option<Arc<dyn DurableStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    remote: Option<Arc<dyn ServiceClient>>,
    config: EngineConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing handlers: {0:?}. These handlers were expected but not registered.")]
    MissingHandlers(Vec<String>),

    #[error("cannot load engine state: {0}")]
    Store(#[from] StoreError),
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            registry: ServiceRegistry::new(),
            expected_handlers: None,
            store: None,
            clock: None,
            ids: None,
            remote: None,
            config: EngineConfig::default(),
        }
    }

    /// Register a service. Conflicting names or handler kinds are rejected here.
    pub fn service(mut self, definition: ServiceDefinition) -> Result<Self, RegistryError> {
        self.registry.register(definition)?;
        Ok(self)
    }

    /// Handlers (`service/handler`) that must be registered for `build` to succeed.
    pub fn expect_handlers(mut self, handlers: &[&str]) -> Self {
        self.expected_handlers = Some(handlers.iter().map(|h| h.to_string()).collect());
        self
    }

    pub fn store<S: DurableStore + 'static>(mut self, store: S) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn id_generator<G: IdGenerator + 'static>(mut self, ids: G) -> Self {
        self.ids = Some(Arc::new(ids));
        self
    }

    /// Client for services not hosted by this engine.
    pub fn remote_client<C: ServiceClient + 'static>(mut self, client: C) -> Self {
        self.remote = Some(Arc::new(client));
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Check the expected handlers without starting anything.
    pub fn validate(&self) -> Result<(), BuildError> {
        let Some(expected) = &self.expected_handlers else {
            return Ok(());
        };
        let registered = self.registry.registered_handlers();
        let missing: Vec<String> = expected
            .iter()
            .filter(|h| !registered.contains(*h))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(BuildError::MissingHandlers(missing))
        }
    }

    /// Validate, load the store and start the engine. Unfinished invocations
    /// found in the store are resumed.
    pub async fn build(self) -> Result<Engine, BuildError> {
        self.validate()?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()));

        let engine = Engine::start(EngineParts {
            registry: self.registry,
            store,
            clock,
            ids,
            config: self.config,
            remote: self.remote,
        })
        .await?;
        Ok(engine)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
