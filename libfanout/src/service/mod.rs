//! Service layer for Fanout
//!
//! `FanoutService` is the single wiring point: it builds the store, vault,
//! limiter, provider registry, executor, and dispatcher, and hands out the
//! focused sub-services. Every component receives its collaborators at
//! construction; nothing reaches for a global handle, and tests construct
//! the whole stack around an in-memory store.

pub mod accounts;
pub mod events;
pub mod posts;

use std::sync::Arc;

use self::accounts::AccountService;
use self::events::{EventBus, EventReceiver};
use self::posts::PostService;
use crate::config::Config;
use crate::dispatch::{DispatchConfig, Dispatcher};
use crate::executor::PublishExecutor;
use crate::providers::mastodon::MastodonProvider;
use crate::providers::ProviderRegistry;
use crate::rate_limit::{RateLimiter, RateLimits};
use crate::store::Store;
use crate::vault::{CredentialVault, TokenRefresher};
use crate::Result;

pub struct FanoutService {
    store: Store,
    event_bus: EventBus,
    posts: PostService,
    accounts: AccountService,
    dispatcher: Arc<Dispatcher>,
}

impl FanoutService {
    /// Build the full stack from configuration.
    pub async fn from_config(config: Config, refresher: Arc<dyn TokenRefresher>) -> Result<Self> {
        let secret = config.vault.resolve_secret()?;
        let store = Store::open(&config.database.path).await?;

        let mut registry = ProviderRegistry::new();
        if let Some(mastodon) = &config.mastodon {
            registry.register(Arc::new(MastodonProvider::new(mastodon.base_url.clone())));
        }

        Ok(Self::assemble(
            store,
            &secret,
            registry,
            refresher,
            config.dispatcher.to_dispatch_config()?,
            config.rate_limits.to_rate_limits(),
        ))
    }

    /// Build around an existing store and registry. This is the seam tests
    /// and embedders use to swap in mock providers or an in-memory store.
    pub fn with_store(
        store: Store,
        secret: &str,
        registry: ProviderRegistry,
        refresher: Arc<dyn TokenRefresher>,
        dispatch: DispatchConfig,
        limits: RateLimits,
    ) -> Self {
        Self::assemble(store, secret, registry, refresher, dispatch, limits)
    }

    fn assemble(
        store: Store,
        secret: &str,
        registry: ProviderRegistry,
        refresher: Arc<dyn TokenRefresher>,
        dispatch: DispatchConfig,
        limits: RateLimits,
    ) -> Self {
        let event_bus = EventBus::new(256);
        let vault = CredentialVault::new(store.clone(), secret, refresher);
        let limiter = Arc::new(RateLimiter::new(store.clone(), limits));

        let executor = Arc::new(PublishExecutor::new(
            store.clone(),
            vault.clone(),
            limiter,
            Arc::new(registry),
            event_bus.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            Arc::clone(&executor),
            event_bus.clone(),
            dispatch,
        ));

        let posts = PostService::new(store.clone(), executor, event_bus.clone());
        let accounts = AccountService::new(store.clone(), vault);

        Self {
            store,
            event_bus,
            posts,
            accounts,
            dispatcher,
        }
    }

    /// Post authoring and publication operations.
    pub fn posts(&self) -> &PostService {
        &self.posts
    }

    /// Provider account linking operations.
    pub fn accounts(&self) -> &AccountService {
        &self.accounts
    }

    /// The job dispatcher; run it from a daemon or tick it in tests.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Direct store access for read projections.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Subscribe to transition events.
    pub fn subscribe(&self) -> EventReceiver {
        self.event_bus.subscribe()
    }

    /// Close the underlying store. In-flight operations fail afterwards.
    pub async fn close(&self) {
        self.store.close().await;
    }
}
