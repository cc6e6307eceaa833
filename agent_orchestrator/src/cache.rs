//! Agent initialization cache.
//!
//! Remembers that an agent with a given descriptor was built successfully,
//! together with the warm-up state needed to bring a fresh instance up without
//! the full startup path. Entries live in memory and, optionally, as
//! `<key>.json` files in a cache directory.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::agent::{Agent, AgentDescriptor, AgentRole};
use crate::error::CacheError;
use crate::settings::CacheSettings;

/// SHA-256 over role, model and sanitized configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_descriptor(descriptor: &AgentDescriptor) -> Self {
        let configuration =
            serde_json::to_string(&descriptor.sanitized_configuration()).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(descriptor.role.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(descriptor.model.as_bytes());
        hasher.update([0u8]);
        hasher.update(configuration.as_bytes());

        let hex: String = hasher
            .finalize()
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect();
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Record of one successful build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub role: AgentRole,
    pub model: String,
    pub capabilities: Vec<String>,
    pub last_built_at: DateTime<Utc>,
    pub build_duration_ms: u64,
    pub healthy: bool,
    pub warmup_payload: Value,
    pub configuration: Value,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        now - self.last_built_at > max_age
    }

    fn validate(&self, descriptor: &AgentDescriptor) -> Result<(), CacheError> {
        let reason = if self.role != descriptor.role {
            Some(format!("entry is for '{}'", self.role))
        } else if self.model.trim().is_empty() {
            Some("empty model".to_string())
        } else if self.capabilities.is_empty() {
            Some("no capabilities recorded".to_string())
        } else if !self.configuration.is_object() {
            Some("configuration snapshot is not an object".to_string())
        } else if !self.healthy {
            Some("agent was unhealthy when cached".to_string())
        } else {
            None
        };

        match reason {
            Some(reason) => Err(CacheError::Mismatch {
                role: descriptor.role,
                reason,
            }),
            None => Ok(()),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub persisted: bool,
    pub directory: Option<PathBuf>,
}

pub struct AgentInitializationCache {
    settings: CacheSettings,
    entries: DashMap<String, Arc<CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    /// False once durable storage failed; the cache then stays memory-only.
    durable: AtomicBool,
}

impl AgentInitializationCache {
    pub fn new(settings: CacheSettings) -> Self {
        let durable = settings.enabled && settings.persist;
        let cache = Self {
            settings,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            durable: AtomicBool::new(durable),
        };

        if durable {
            match fs::create_dir_all(&cache.settings.directory) {
                Ok(()) => {
                    let loaded = cache.load_persisted();
                    info!(
                        directory = %cache.settings.directory.display(),
                        loaded,
                        "Initialization cache loaded"
                    );
                }
                Err(e) => cache.degrade(&e),
            }
        }
        cache
    }

    pub fn disabled() -> Self {
        Self::new(CacheSettings {
            enabled: false,
            persist: false,
            ..CacheSettings::default()
        })
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_durable(&self) -> bool {
        self.durable.load(Ordering::SeqCst)
    }

    fn degrade(&self, err: &dyn fmt::Display) {
        if self.durable.swap(false, Ordering::SeqCst) {
            warn!(error = %err, "Cache storage unavailable; continuing in memory only");
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.settings.directory.join(format!("{}.json", key))
    }

    fn miss(&self) -> Option<Arc<CacheEntry>> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Remove `key` only while it still maps to `stale`. A concurrent `set`
    /// that replaced the entry keeps both its memory and disk copies.
    fn evict_if<F>(&self, key: &str, stale: F) -> bool
    where
        F: FnOnce(&Arc<CacheEntry>) -> bool,
    {
        let removed = self.entries.remove_if(key, |_, entry| stale(entry)).is_some();
        if removed && self.is_durable() {
            remove_file_quietly(&self.path_for(key));
        }
        removed
    }

    /// Valid, unexpired entry for `descriptor`, if any.
    pub fn get(&self, descriptor: &AgentDescriptor) -> Option<Arc<CacheEntry>> {
        if !self.settings.enabled {
            return None;
        }
        let key = CacheKey::from_descriptor(descriptor);
        let Some(entry) = self.entries.get(key.as_str()).map(|e| e.value().clone()) else {
            return self.miss();
        };

        if entry.is_expired_at(Utc::now(), self.settings.max_age()) {
            debug!(role = %descriptor.role, "cache entry expired");
            self.evict_if(key.as_str(), |current| Arc::ptr_eq(current, &entry));
            return self.miss();
        }
        if self.settings.validate {
            if let Err(e) = entry.validate(descriptor) {
                warn!(error = %e, "Discarding invalid cache entry");
                self.evict_if(key.as_str(), |current| Arc::ptr_eq(current, &entry));
                return self.miss();
            }
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(role = %descriptor.role, key = %key, "cache hit");
        Some(entry)
    }

    /// Record a successful build. Only failing to export the agent's warm-up
    /// state is an error; storage problems are logged.
    #[instrument(skip(self, descriptor, agent), fields(role = %descriptor.role))]
    pub fn set(
        &self,
        descriptor: &AgentDescriptor,
        agent: &dyn Agent,
        build_duration_ms: u64,
    ) -> Result<Arc<CacheEntry>, CacheError> {
        let warmup_payload = agent.export_warmup().map_err(CacheError::Warmup)?;
        let key = CacheKey::from_descriptor(descriptor);
        let configuration = Value::Object(descriptor.sanitized_configuration().into_iter().collect());

        let entry = Arc::new(CacheEntry {
            key: key.as_str().to_string(),
            role: descriptor.role,
            model: descriptor.model.clone(),
            capabilities: agent.capabilities(),
            last_built_at: Utc::now(),
            build_duration_ms,
            healthy: agent.is_initialized(),
            warmup_payload,
            configuration,
        });

        if !self.settings.enabled {
            return Ok(entry);
        }
        self.entries.insert(entry.key.clone(), entry.clone());
        if self.is_durable() {
            if let Err(e) = self.persist(&entry) {
                self.degrade(&e);
            }
        }
        debug!(key = %key, build_duration_ms, "cached agent build");
        Ok(entry)
    }

    fn persist(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let path = self.path_for(&entry.key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(entry)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Builds slower than the threshold are worth remembering.
    pub fn should_cache(&self, role: AgentRole, build_duration_ms: u64) -> bool {
        let worth = self.settings.enabled && build_duration_ms > self.settings.min_build_ms;
        if !worth {
            debug!(%role, build_duration_ms, "build too fast to cache");
        }
        worth
    }

    /// Re-seed a lightweight instance from the entry's warm-up payload.
    pub fn apply_warmup(&self, agent: &dyn Agent, entry: &CacheEntry) -> Result<(), CacheError> {
        if !self.settings.warmup {
            return Ok(());
        }
        if entry.role != agent.role() {
            return Err(CacheError::Mismatch {
                role: agent.role(),
                reason: format!("warm-up payload is for '{}'", entry.role),
            });
        }
        agent
            .import_warmup(&entry.warmup_payload)
            .map_err(CacheError::Warmup)
    }

    /// Drop expired entries from memory and disk. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Utc::now();
        let max_age = self.settings.max_age();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired_at(now, max_age))
            .map(|e| e.key().clone())
            .collect();

        let mut removed: HashSet<String> = HashSet::new();
        for key in expired {
            if self.evict_if(&key, |current| current.is_expired_at(now, max_age)) {
                removed.insert(key);
            }
        }
        if self.is_durable() {
            removed.extend(self.prune_directory(now));
        }

        if !removed.is_empty() {
            info!(removed = removed.len(), "Cache cleanup finished");
        }
        removed.len()
    }

    /// Remove every entry from memory and disk.
    pub fn clear(&self) {
        self.entries.clear();
        if self.is_durable() {
            for path in json_files(&self.settings.directory) {
                remove_file_quietly(&path);
            }
        }
        info!("Initialization cache cleared");
    }

    /// Load `*.json` entries from the cache directory, deleting expired or
    /// unreadable files. Returns the number loaded.
    pub fn load_persisted(&self) -> usize {
        if !self.is_durable() {
            return 0;
        }
        let now = Utc::now();
        let max_age = self.settings.max_age();
        let mut loaded = 0;

        for path in json_files(&self.settings.directory) {
            match read_entry(&path) {
                Ok(entry) if entry.is_expired_at(now, max_age) => {
                    debug!(path = %path.display(), "pruning expired cache file");
                    remove_file_quietly(&path);
                }
                Ok(entry) => {
                    self.entries.insert(entry.key.clone(), Arc::new(entry));
                    loaded += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Removing unreadable cache file");
                    remove_file_quietly(&path);
                }
            }
        }
        loaded
    }

    fn prune_directory(&self, now: DateTime<Utc>) -> Vec<String> {
        let max_age = self.settings.max_age();
        let mut pruned = Vec::new();
        for path in json_files(&self.settings.directory) {
            let stale = match read_entry(&path) {
                Ok(entry) => entry.is_expired_at(now, max_age),
                Err(_) => true,
            };
            if stale {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    pruned.push(stem.to_string());
                }
                remove_file_quietly(&path);
            }
        }
        pruned
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            enabled: self.settings.enabled,
            entries: self.entries.len(),
            hits,
            misses,
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
            persisted: self.is_durable(),
            directory: self.is_durable().then(|| self.settings.directory.clone()),
        }
    }
}

fn read_entry(path: &Path) -> Result<CacheEntry, CacheError> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn json_files(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect(),
        Err(e) => {
            warn!(directory = %dir.display(), error = %e, "Cannot list cache directory");
            Vec::new()
        }
    }
}

fn remove_file_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove cache file");
        }
    }
}
