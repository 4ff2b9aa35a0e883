// Container id -> application name resolution
//
// Names come from an environment variable set on the container (e.g.
// TSURU_APPNAME=myapp). Lookups hit the runtime only on a cache miss; a
// container id never changes its environment, so entries are never
// invalidated, only evicted.

use crate::runtime::ContainerRuntime;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub const DEFAULT_CACHE_SIZE: usize = 10_000;

pub struct NameResolver {
    cache: Mutex<LruCache<String, String>>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    // Stored with the trailing '=' so entries can be prefix-matched
    env_prefix: Option<String>,
}

impl NameResolver {
    pub fn new(
        runtime: Option<Arc<dyn ContainerRuntime>>,
        env_var: Option<&str>,
        capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let env_prefix = env_var
            .map(|v| v.trim_end_matches('='))
            .filter(|v| !v.is_empty())
            .map(|v| format!("{}=", v));

        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            runtime,
            env_prefix,
        }
    }

    /// Always yields a name; the container id itself is the fallback.
    pub async fn resolve(&self, container_id: &str) -> String {
        if let Some(name) = self.cached(container_id) {
            return name;
        }

        let name = self.lookup(container_id).await;
        self.insert(container_id, &name);
        name
    }

    pub fn insert(&self, container_id: &str, name: &str) {
        self.lock()
            .put(container_id.to_string(), name.to_string());
    }

    pub fn cached(&self, container_id: &str) -> Option<String> {
        self.lock().get(container_id).cloned()
    }

    async fn lookup(&self, container_id: &str) -> String {
        let (Some(runtime), Some(prefix)) = (&self.runtime, &self.env_prefix) else {
            return container_id.to_string();
        };

        let info = match runtime.inspect(container_id).await {
            Ok(info) => info,
            Err(e) => {
                warn!(container_id, error = %e, "Unable to inspect container, using id as name");
                return container_id.to_string();
            }
        };

        match info
            .env
            .iter()
            .find_map(|entry| entry.strip_prefix(prefix.as_str()))
        {
            Some(value) if !value.is_empty() => {
                debug!(container_id, image = %info.image, name = value, "Resolved container name");
                value.to_string()
            }
            _ => {
                debug!(container_id, image = %info.image, "No application name in container env");
                container_id.to_string()
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, String>> {
        // The cache holds plain strings; a poisoned lock can't leave it torn.
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}
