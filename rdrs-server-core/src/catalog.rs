//! File backed metadata catalog. Holds what the Hopsworks database would
//! otherwise provide: API keys, project membership, feature view
//! definitions and, for the in-memory backend, table definitions.

use crate::auth::{ApiKeyRecord, ApiKeyStore};
use crate::error::{FeatureStoreError, FsErrorCode};
use crate::feature_store::{FeatureMetadata, FeatureViewMetadata, FeatureViewStore};
use crate::native::memory::TableDef;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyEntry {
    pub prefix: String,
    #[serde(flatten)]
    pub record: ApiKeyRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureViewEntry {
    pub feature_store_name: String,
    pub feature_view_name: String,
    pub feature_view_version: i32,
    pub features: Vec<FeatureMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CatalogFile {
    api_keys: Vec<ApiKeyEntry>,
    projects: BTreeMap<String, Vec<String>>,
    feature_views: Vec<FeatureViewEntry>,
    tables: Vec<TableDef>,
}

#[derive(Debug, Default)]
pub struct Catalog {
    api_keys: FxHashMap<String, ApiKeyRecord>,
    projects: FxHashMap<i32, Vec<String>>,
    feature_views: FxHashMap<(String, String, i32), Vec<FeatureMetadata>>,
    feature_stores: FxHashSet<String>,
    tables: Vec<TableDef>,
}

impl Catalog {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(json)?;

        let mut projects = FxHashMap::default();
        for (user, names) in file.projects {
            let user_id: i32 = user
                .parse()
                .with_context(|| format!("Invalid user id `{}` in projects", user))?;
            projects.insert(user_id, names);
        }

        let mut feature_stores: FxHashSet<String> =
            projects.values().flatten().cloned().collect();
        let mut feature_views = FxHashMap::default();
        for view in file.feature_views {
            feature_stores.insert(view.feature_store_name.clone());
            feature_views.insert(
                (view.feature_store_name, view.feature_view_name, view.feature_view_version),
                view.features,
            );
        }

        Ok(Self {
            api_keys: file
                .api_keys
                .into_iter()
                .map(|entry| (entry.prefix, entry.record))
                .collect(),
            projects,
            feature_views,
            feature_stores,
            tables: file.tables,
        })
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read catalog {}", path))?;
        Self::from_json_str(&content).with_context(|| format!("Failed to parse catalog {}", path))
    }

    pub fn tables(&self) -> &[TableDef] {
        &self.tables
    }

    pub fn num_feature_views(&self) -> usize {
        self.feature_views.len()
    }
}

#[async_trait]
impl ApiKeyStore for Catalog {
    async fn find_api_key(&self, prefix: &str) -> Result<Option<ApiKeyRecord>> {
        Ok(self.api_keys.get(prefix).cloned())
    }

    async fn find_all_projects(&self, user_id: i32) -> Result<Vec<String>> {
        Ok(self.projects.get(&user_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl FeatureViewStore for Catalog {
    async fn feature_view(
        &self,
        feature_store: &str,
        feature_view: &str,
        version: i32,
    ) -> Result<Arc<FeatureViewMetadata>> {
        if !self.feature_stores.contains(feature_store) {
            return Err(FeatureStoreError::new(FsErrorCode::FsNotExist).into());
        }
        let key = (feature_store.to_string(), feature_view.to_string(), version);
        let features = self
            .feature_views
            .get(&key)
            .ok_or_else(|| FeatureStoreError::new(FsErrorCode::FvNotExist))?;
        let metadata =
            FeatureViewMetadata::new(feature_store, feature_view, version, features.clone())?;
        Ok(Arc::new(metadata))
    }
}
