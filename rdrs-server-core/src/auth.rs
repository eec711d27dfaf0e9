//! API key authentication.
//!
//! Keys look like `prefix.secret`. The cache maps a full key to the set of
//! databases (projects) its owner may read. Every cached key gets its own
//! background task that re-reads the key from the metadata store on a jittered
//! interval and evicts the entry once it has been idle for long enough.

use crate::config::ApiKeyConfig;
use anyhow::Result;
use async_trait::async_trait;
use hex::ToHex;
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};

pub const API_KEY_PREFIX_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    pub secret: String,
    pub salt: String,
    pub name: String,
    pub user_id: i32,
}

/// Source of truth for API keys and project membership.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn find_api_key(&self, prefix: &str) -> Result<Option<ApiKeyRecord>>;

    async fn find_all_projects(&self, user_id: i32) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiKeyError {
    Missing,
    Malformed,
    NotFound,
    WrongSecret,
    /// `fresh` is set when the verdict comes from a just fetched entry.
    Unauthorized { fresh: bool },
    Backend(String),
}

impl Display for ApiKeyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "Unauthorized. No API key supplied"),
            Self::Malformed => write!(f, "the apikey has an incorrect format"),
            Self::NotFound => write!(f, "the apikey was not found"),
            Self::WrongSecret => write!(f, "bad API Key"),
            Self::Unauthorized { fresh: false } => {
                write!(f, "unauthorized: no access to db registered in cache")
            }
            Self::Unauthorized { fresh: true } => {
                write!(f, "unauthorized: no access to db registered")
            }
            Self::Backend(message) => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for ApiKeyError {}

/// Splits `prefix.secret`, rejecting anything that is not exactly two parts
/// with a 16 character prefix and a non-empty secret.
pub fn split_api_key(api_key: &str) -> Result<(&str, &str), ApiKeyError> {
    let parts: Vec<&str> = api_key.split('.').collect();
    match parts.as_slice() {
        [prefix, secret] if prefix.len() == API_KEY_PREFIX_LEN && !secret.is_empty() => {
            Ok((prefix, secret))
        }
        _ => Err(ApiKeyError::Malformed),
    }
}

/// `hex(sha256(secret ++ salt)) == stored secret`
pub fn secret_matches(secret: &str, record: &ApiKeyRecord) -> bool {
    let mut hasher = sha2::Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(record.salt.as_bytes());
    hasher.finalize().encode_hex::<String>() == record.secret
}

async fn fetch_authorised_dbs(
    store: &dyn ApiKeyStore,
    api_key: &str,
) -> Result<Vec<String>, ApiKeyError> {
    let (prefix, secret) = split_api_key(api_key)?;
    let record = store
        .find_api_key(prefix)
        .await
        .map_err(|err| ApiKeyError::Backend(format!("{:#}", err)))?
        .ok_or(ApiKeyError::NotFound)?;
    if !secret_matches(secret, &record) {
        return Err(ApiKeyError::WrongSecret);
    }
    store
        .find_all_projects(record.user_id)
        .await
        .map_err(|err| ApiKeyError::Backend(format!("{:#}", err)))
}

/// `base ± rand(0..jitter)`, negative when the drawn value is even.
pub fn refresh_interval_with_jitter(config: &ApiKeyConfig) -> Duration {
    let base = config.cache_refresh_interval_ms as i64;
    let jitter = config.cache_refresh_interval_jitter_ms as i64;
    let mut offset = if jitter > 0 {
        rand::thread_rng().gen_range(0..jitter)
    } else {
        0
    };
    if offset % 2 == 0 {
        offset = -offset;
    }
    Duration::from_millis((base + offset).max(1) as u64)
}

#[derive(Default)]
struct EntryState {
    dbs: FxHashSet<String>,
    last_updated: Option<Instant>,
}

struct CacheEntry {
    state: Arc<RwLock<EntryState>>,
    /// Milliseconds since the cache epoch.
    last_used: AtomicU64,
    evicted: AtomicBool,
    refresh_interval: Duration,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

struct CacheInner {
    store: Arc<dyn ApiKeyStore>,
    config: ApiKeyConfig,
    epoch: Instant,
    entries: RwLock<FxHashMap<String, Arc<CacheEntry>>>,
}

impl CacheInner {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    async fn refresh(&self, api_key: &str, state: &mut EntryState) {
        match fetch_authorised_dbs(self.store.as_ref(), api_key).await {
            Ok(dbs) => {
                state.dbs = dbs.into_iter().collect();
                state.last_updated = Some(Instant::now());
            }
            Err(err) => {
                tracing::warn!(
                    api_key = %redact(api_key),
                    "API key cache refresh failed, keeping previous entry: {}",
                    err
                );
            }
        }
    }

    async fn evict(&self, api_key: &str, entry: &Arc<CacheEntry>) {
        entry.evicted.store(true, Ordering::SeqCst);
        let mut entries = self.entries.write().await;
        if entries
            .get(api_key)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            entries.remove(api_key);
        }
        tracing::debug!("API key {} is evicted", redact(api_key));
    }
}

fn redact(api_key: &str) -> &str {
    api_key.split('.').next().unwrap_or_default()
}

async fn run_refresher(
    inner: Arc<CacheInner>,
    api_key: String,
    entry: Arc<CacheEntry>,
    first: OwnedRwLockWriteGuard<EntryState>,
) {
    let mut ticker = tokio::time::interval(entry.refresh_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut held = Some(first);
    loop {
        let mut state = match held.take() {
            Some(guard) => guard,
            None => entry.state.clone().write_owned().await,
        };
        if !entry.evicted.load(Ordering::SeqCst) {
            inner.refresh(&api_key, &mut state).await;
        }
        drop(state);

        ticker.tick().await;
        if entry.evicted.load(Ordering::SeqCst) {
            return;
        }
        let idle = inner
            .now_ms()
            .saturating_sub(entry.last_used.load(Ordering::SeqCst));
        if idle > inner.config.cache_unused_entries_eviction_ms {
            inner.evict(&api_key, &entry).await;
            return;
        }
    }
}

/// Shared handle to the API key cache.
#[derive(Clone)]
pub struct ApiKeyCache {
    inner: Arc<CacheInner>,
}

impl ApiKeyCache {
    pub fn new(store: Arc<dyn ApiKeyStore>, config: ApiKeyConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store,
                config,
                epoch: Instant::now(),
                entries: RwLock::new(FxHashMap::default()),
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.inner.config.use_hopsworks_api_keys
    }

    /// Checks that `api_key` may read every database in `dbs`.
    pub async fn validate(&self, api_key: Option<&str>, dbs: &[String]) -> Result<(), ApiKeyError> {
        if !self.enabled() {
            return Ok(());
        }
        let api_key = api_key.ok_or(ApiKeyError::Missing)?;
        split_api_key(api_key)?;
        if dbs.is_empty() {
            return Ok(());
        }

        match self.find_and_validate(api_key, dbs).await {
            Some(true) => return Ok(()),
            Some(false) => return Err(ApiKeyError::Unauthorized { fresh: false }),
            None => {}
        }

        self.insert_entry(api_key).await;
        match self.find_and_validate(api_key, dbs).await {
            Some(true) => Ok(()),
            _ => Err(ApiKeyError::Unauthorized { fresh: true }),
        }
    }

    async fn find_and_validate(&self, api_key: &str, dbs: &[String]) -> Option<bool> {
        let entry = self.inner.entries.read().await.get(api_key).cloned()?;
        let state = entry.state.read().await;
        entry.last_used.store(self.inner.now_ms(), Ordering::SeqCst);
        Some(dbs.iter().all(|db| state.dbs.contains(db)))
    }

    /// Creates the entry and starts its refresher. The refresher owns the
    /// entry's write lock from the start, so readers wait for the first fetch.
    async fn insert_entry(&self, api_key: &str) {
        let mut entries = self.inner.entries.write().await;
        if entries.contains_key(api_key) {
            return;
        }
        let entry = Arc::new(CacheEntry {
            state: Arc::new(RwLock::new(EntryState::default())),
            last_used: AtomicU64::new(self.inner.now_ms()),
            evicted: AtomicBool::new(false),
            refresh_interval: refresh_interval_with_jitter(&self.inner.config),
            refresher: Mutex::new(None),
        });
        let first = entry.state.clone().write_owned().await;
        let handle = tokio::spawn(run_refresher(
            self.inner.clone(),
            api_key.to_string(),
            entry.clone(),
            first,
        ));
        tracing::debug!(
            "API key cache updater started for {}. Refresh interval: {:?}",
            redact(api_key),
            entry.refresh_interval
        );
        *entry
            .refresher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        entries.insert(api_key.to_string(), entry);
    }

    /// Stops every refresher and empties the cache.
    pub async fn cleanup(&self) {
        tracing::info!("Shutting down API key cache");
        let mut entries = self.inner.entries.write().await;
        for entry in entries.values() {
            entry.evicted.store(true, Ordering::SeqCst);
            if let Some(handle) = entry
                .refresher
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take()
            {
                handle.abort();
            }
        }
        entries.clear();
    }

    pub async fn size(&self) -> usize {
        self.inner.entries.read().await.len()
    }

    pub async fn last_used(&self, api_key: &str) -> Option<Instant> {
        let entry = self.inner.entries.read().await.get(api_key).cloned()?;
        let ms = entry.last_used.load(Ordering::SeqCst);
        Some(self.inner.epoch + Duration::from_millis(ms))
    }

    pub async fn last_updated(&self, api_key: &str) -> Option<Instant> {
        let entry = self.inner.entries.read().await.get(api_key).cloned()?;
        let state = entry.state.read().await;
        state.last_updated
    }

    pub async fn refresh_interval(&self, api_key: &str) -> Option<Duration> {
        let entries = self.inner.entries.read().await;
        entries.get(api_key).map(|entry| entry.refresh_interval)
    }
}
