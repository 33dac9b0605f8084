//! Process-global handle threaded through every handler.
//!
//! Holds the project roots, the single mutation mutex that serializes all
//! read-modify-write access to persistent state, the routing policy, and a
//! read-through cache of per-domain term metadata. No hidden singletons:
//! everything shared lives here and is passed explicitly.

use crate::artifacts::ArtifactWriter;
use crate::config::Config;
use crate::domain::DomainPaths;
use crate::models::TermMap;
use crate::routing::{ElectoralPolicy, RoutingPolicy};
use crate::state::StateStore;
use crate::storage::StorageError;
use dashmap::DashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

pub struct Coordinator {
    root: PathBuf,
    store: StateStore,
    mutation_lock: Mutex<()>,
    policy: Box<dyn RoutingPolicy>,
    terms_cache: DashMap<String, Arc<TermMap>>,
    pub watchdog_interval_ms: u64,
    pub idle_finalize_ms: u64,
}

impl Coordinator {
    /// Create the coordinator and materialize the root directory tree.
    /// An unwritable root is a startup failure, the only fatal kind.
    pub fn new(root: &Path) -> Result<Self, StorageError> {
        for sub in ["BFS_crawl/_meta", "BFS_crawl/runs", "downloads", "logs"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
            store: StateStore::new(root),
            mutation_lock: Mutex::new(()),
            policy: Box::new(ElectoralPolicy),
            terms_cache: DashMap::new(),
            watchdog_interval_ms: Config::WATCHDOG_INTERVAL_MS,
            idle_finalize_ms: Config::IDLE_FINALIZE_MS,
        })
    }

    pub fn with_watchdog(mut self, interval_ms: u64, idle_ms: u64) -> Self {
        self.watchdog_interval_ms = interval_ms;
        self.idle_finalize_ms = idle_ms;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn policy(&self) -> &dyn RoutingPolicy {
        self.policy.as_ref()
    }

    pub fn paths(&self, domain_key: &str) -> DomainPaths {
        self.store.paths(domain_key)
    }

    /// Acquire the global mutation lock. Every handler that mutates
    /// persistent state holds this across its critical section.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutation_lock.lock().await
    }

    /// Artifact writer for a domain, honoring its stored encoding choice.
    pub fn writer(&self, paths: &DomainPaths) -> Result<ArtifactWriter, StorageError> {
        let legacy = self.store.load_state(paths)?.legacy_artifacts;
        Ok(ArtifactWriter::new(&self.root, paths.artifacts_dir(), legacy))
    }

    /// Term metadata for a domain, cached until invalidated by an upsert.
    pub fn terms(&self, paths: &DomainPaths) -> Result<Arc<TermMap>, StorageError> {
        if let Some(cached) = self.terms_cache.get(paths.key()) {
            return Ok(cached.clone());
        }
        let loaded = Arc::new(self.store.load_terms(paths)?);
        self.terms_cache
            .insert(paths.key().to_string(), loaded.clone());
        Ok(loaded)
    }

    pub fn invalidate_terms(&self, domain_key: &str) {
        self.terms_cache.remove(domain_key);
    }
}
