use crate::backend::{RemoteBackend, SqliteBackend};
use crate::cache::CacheStore;
use crate::clock::Clock;
use crate::config::Config;
use crate::issues::IssueService;
use crate::mutation::MutationCoordinator;
use crate::notifications::NotificationService;
use crate::query::QueryCacheManager;
use crate::rate_limiter::{RateLimiter, SqliteAttemptStore};
use crate::realtime::{BroadcastFeed, ChannelFilter, ResourceFamily, Subscription, SubscriptionManager};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub issues: IssueService,
    pub notifications: NotificationService,
    pub rate_limiter: RateLimiter,
    pub realtime: SubscriptionManager,
    pub backend: SqliteBackend,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(config: &Config, backend: SqliteBackend, clock: Arc<dyn Clock>) -> Self {
        let cache = QueryCacheManager::new(CacheStore::new(), config.query);
        let mutations = MutationCoordinator::new(cache.clone());
        let remote: Arc<dyn RemoteBackend> = Arc::new(backend.clone());
        let feed = Arc::new(BroadcastFeed::new(backend.events().clone()));
        let attempts = Arc::new(SqliteAttemptStore::new(backend.db().clone()));

        Self {
            issues: IssueService::new(remote.clone(), mutations.clone(), clock.clone()),
            notifications: NotificationService::new(remote, mutations, clock.clone()),
            rate_limiter: RateLimiter::new(attempts, config.rate_limits.clone(), clock.clone()),
            realtime: SubscriptionManager::new(cache, feed, config.reconnect),
            backend,
            clock,
        }
    }

    // Keeps the shared cache in step with every backend write. Dropping the
    // returned handles stops it.
    pub fn watch_backend(&self) -> Vec<Subscription> {
        ResourceFamily::ALL
            .into_iter()
            .map(|family| self.realtime.subscribe(family, ChannelFilter::All, |_| {}))
            .collect()
    }
}
