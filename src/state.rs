//! Shared application state, aggregated once at startup and cloned into
//! every connection task.

use crate::auth::TokenVerifier;
use crate::broadcast::Broadcaster;
use crate::cache::DocumentCache;
use crate::channel::ChannelService;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::lifecycle::LifecycleController;
use crate::registry::SessionRegistry;
use crate::store::DurableStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub cache: Arc<dyn DocumentCache>,
    pub store: Arc<dyn DurableStore>,
    pub broadcaster: Broadcaster,
    pub dispatcher: Arc<Dispatcher>,
    pub lifecycle: Arc<LifecycleController>,
    pub channels: Arc<dyn ChannelService>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub config: Config,
}

impl AppState {
    pub fn new(
        cache: Arc<dyn DocumentCache>,
        store: Arc<dyn DurableStore>,
        channels: Arc<dyn ChannelService>,
        verifier: Arc<dyn TokenVerifier>,
        config: Config,
    ) -> Self {
        let registry = SessionRegistry::new();
        let broadcaster = Broadcaster::new(registry.clone());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), cache.clone(), broadcaster.clone()));
        let lifecycle = Arc::new(LifecycleController::new(
            registry.clone(),
            cache.clone(),
            store.clone(),
            broadcaster.clone(),
        ));
        Self {
            registry,
            cache,
            store,
            broadcaster,
            dispatcher,
            lifecycle,
            channels,
            verifier,
            config,
        }
    }
}
