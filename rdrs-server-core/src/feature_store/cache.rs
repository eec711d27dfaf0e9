use crate::error::FeatureStoreError;
use crate::feature_store::metadata::FeatureViewMetadata;
use anyhow::Result;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const FEATURE_VIEW_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// Resolves feature view metadata. Lookup failures carry a
/// [`crate::error::FeatureStoreError`].
#[async_trait]
pub trait FeatureViewStore: Send + Sync {
    async fn feature_view(
        &self,
        feature_store: &str,
        feature_view: &str,
        version: i32,
    ) -> Result<Arc<FeatureViewMetadata>>;
}

#[derive(Clone)]
struct CachedView {
    metadata: Arc<FeatureViewMetadata>,
    loaded_at: Instant,
}

/// TTL cache in front of another [`FeatureViewStore`]. Readers never block;
/// a miss loads from the inner store and swaps in a new map.
pub struct CachedFeatureViewStore {
    inner: Arc<dyn FeatureViewStore>,
    ttl: Duration,
    views: ArcSwap<FxHashMap<String, CachedView>>,
}

impl CachedFeatureViewStore {
    pub fn new(inner: Arc<dyn FeatureViewStore>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            views: ArcSwap::from_pointee(FxHashMap::default()),
        }
    }

    fn cache_key(feature_store: &str, feature_view: &str, version: i32) -> String {
        format!("{}|{}|{}", feature_store, feature_view, version)
    }

    pub fn len(&self) -> usize {
        self.views.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FeatureViewStore for CachedFeatureViewStore {
    async fn feature_view(
        &self,
        feature_store: &str,
        feature_view: &str,
        version: i32,
    ) -> Result<Arc<FeatureViewMetadata>> {
        let key = Self::cache_key(feature_store, feature_view, version);
        if let Some(cached) = self.views.load().get(&key)
            && cached.loaded_at.elapsed() < self.ttl
        {
            return Ok(cached.metadata.clone());
        }

        let metadata = match self
            .inner
            .feature_view(feature_store, feature_view, version)
            .await
        {
            Ok(metadata) => metadata,
            Err(err) => {
                match err.downcast_ref::<FeatureStoreError>() {
                    Some(fs_err) if fs_err.is_not_found() => {
                        tracing::debug!("Feature view {} not found", key)
                    }
                    _ => tracing::warn!(error = %err, "Failed to load feature view {}", key),
                }
                return Err(err);
            }
        };
        tracing::debug!("Loaded metadata of feature view {}", key);
        let entry = CachedView {
            metadata: metadata.clone(),
            loaded_at: Instant::now(),
        };
        let ttl = self.ttl;
        self.views.rcu(|views| {
            let mut views: FxHashMap<String, CachedView> = views
                .iter()
                .filter(|(_, view)| view.loaded_at.elapsed() < ttl)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            views.insert(key.clone(), entry.clone());
            views
        });
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsErrorCode;
    use crate::feature_store::metadata::tests::two_group_features;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingViews {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl FeatureViewStore for CountingViews {
        async fn feature_view(
            &self,
            feature_store: &str,
            feature_view: &str,
            version: i32,
        ) -> Result<Arc<FeatureViewMetadata>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if feature_view != "sample_view" {
                return Err(FeatureStoreError::new(FsErrorCode::FvNotExist).into());
            }
            Ok(Arc::new(FeatureViewMetadata::new(
                feature_store,
                feature_view,
                version,
                two_group_features(),
            )?))
        }
    }

    #[tokio::test]
    async fn hits_are_served_from_cache() {
        let inner = Arc::new(CountingViews::default());
        let cache = CachedFeatureViewStore::new(inner.clone(), FEATURE_VIEW_CACHE_TTL);
        let first = cache.feature_view("test_fs", "sample_view", 1).await.unwrap();
        let second = cache.feature_view("test_fs", "sample_view", 1).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(inner.loads.load(Ordering::SeqCst), 1);

        cache.feature_view("test_fs", "sample_view", 2).await.unwrap();
        assert_eq!(inner.loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn expired_entries_reload() {
        let inner = Arc::new(CountingViews::default());
        let cache = CachedFeatureViewStore::new(inner.clone(), Duration::from_millis(20));
        cache.feature_view("test_fs", "sample_view", 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.feature_view("test_fs", "sample_view", 1).await.unwrap();
        assert_eq!(inner.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let inner = Arc::new(CountingViews::default());
        let cache = CachedFeatureViewStore::new(inner.clone(), FEATURE_VIEW_CACHE_TTL);
        let err = cache.feature_view("test_fs", "nope", 1).await.unwrap_err();
        let fs_err = err.downcast_ref::<FeatureStoreError>().unwrap();
        assert_eq!(fs_err.kind, FsErrorCode::FvNotExist);
        assert!(cache.feature_view("test_fs", "nope", 1).await.is_err());
        assert_eq!(inner.loads.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }
}
