use crate::error::{FeatureStoreError, FsErrorCode};
use crate::model::{FeatureMeta, MetadataOptions};
use apache_avro::Schema;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

const COMPLEX_TYPES: [&str; 4] = ["MAP", "ARRAY", "STRUCT", "UNIONTYPE"];

/// One feature of a feature view as stored in the metadata catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureMetadata {
    pub feature_store_name: String,
    pub feature_group_name: String,
    pub feature_group_version: i32,
    pub name: String,
    #[serde(rename = "type")]
    pub feature_type: String,
    #[serde(default)]
    pub index: i32,
    #[serde(default)]
    pub label: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub prefix: String,
    /// Avro schema of complex features.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avro_schema: Option<serde_json::Value>,
}

impl FeatureMetadata {
    pub fn prefixed_name(&self) -> String {
        format!("{}{}", self.prefix, self.name)
    }

    pub fn index_key(&self) -> String {
        feature_index_key(&self.feature_store_name, &self.feature_group_name, &self.name)
    }

    /// `map<..>`, `array<..>`, `struct<..>` and `uniontype<..>` are stored Avro encoded.
    pub fn is_complex(&self) -> bool {
        let base = self
            .feature_type
            .split('<')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_uppercase();
        COMPLEX_TYPES.contains(&base.as_str())
    }
}

pub fn feature_index_key(feature_store: &str, feature_group: &str, name: &str) -> String {
    format!("{}|{}|{}", feature_store, feature_group, name)
}

/// The features of a feature view that live in one feature group table.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureGroupFeatures {
    pub feature_store_name: String,
    pub feature_group_name: String,
    pub feature_group_version: i32,
    pub primary_keys: Vec<FeatureMetadata>,
    pub features: Vec<FeatureMetadata>,
}

impl FeatureGroupFeatures {
    pub fn table_name(&self) -> String {
        format!("{}_{}", self.feature_group_name, self.feature_group_version)
    }

    pub fn operation_id(&self) -> String {
        format!("{}|{}", self.feature_store_name, self.feature_group_name)
    }
}

/// Everything the planner needs to answer lookups against one feature view.
#[derive(Debug, Clone)]
pub struct FeatureViewMetadata {
    pub feature_store_name: String,
    pub feature_view_name: String,
    pub feature_view_version: i32,
    /// prefix + name of every non label feature.
    pub prefix_features_lookup: FxHashMap<String, FeatureMetadata>,
    /// prefix + name of every primary key.
    pub primary_keys: FxHashMap<String, FeatureMetadata>,
    pub feature_groups: Vec<FeatureGroupFeatures>,
    pub feature_store_names: Vec<String>,
    pub num_of_features: usize,
    feature_index_lookup: FxHashMap<String, usize>,
    output_features: Vec<FeatureMetadata>,
    join_key_slots: FxHashMap<String, Vec<usize>>,
    complex_features: FxHashMap<usize, Schema>,
}

impl FeatureViewMetadata {
    pub fn new(
        feature_store_name: &str,
        feature_view_name: &str,
        feature_view_version: i32,
        features: Vec<FeatureMetadata>,
    ) -> Result<Self, FeatureStoreError> {
        let mut features: Vec<FeatureMetadata> = features.into_iter().filter(|f| !f.label).collect();
        features.sort_by_key(|f| f.index);

        let mut prefix_features_lookup = FxHashMap::default();
        let mut primary_keys = FxHashMap::default();
        let mut feature_groups: Vec<FeatureGroupFeatures> = Vec::new();
        let mut feature_store_names: Vec<String> = Vec::new();
        let mut seen_stores = FxHashSet::default();
        let mut feature_index_lookup = FxHashMap::default();
        let mut output_features = Vec::new();
        let mut join_key_slots: FxHashMap<String, Vec<usize>> = FxHashMap::default();
        let mut complex_features = FxHashMap::default();

        // Primary keys first so that a selected feature wins a name clash.
        for feature in features.iter().filter(|f| f.primary_key) {
            prefix_features_lookup.insert(feature.prefixed_name(), feature.clone());
            primary_keys.insert(feature.prefixed_name(), feature.clone());
        }

        for feature in &features {
            let position = feature_groups.iter().position(|g| {
                g.feature_store_name == feature.feature_store_name
                    && g.feature_group_name == feature.feature_group_name
                    && g.feature_group_version == feature.feature_group_version
            });
            let position = match position {
                Some(position) => position,
                None => {
                    if seen_stores.insert(feature.feature_store_name.clone()) {
                        feature_store_names.push(feature.feature_store_name.clone());
                    }
                    feature_groups.push(FeatureGroupFeatures {
                        feature_store_name: feature.feature_store_name.clone(),
                        feature_group_name: feature.feature_group_name.clone(),
                        feature_group_version: feature.feature_group_version,
                        primary_keys: Vec::new(),
                        features: Vec::new(),
                    });
                    feature_groups.len() - 1
                }
            };
            let group = &mut feature_groups[position];
            if feature.primary_key {
                group.primary_keys.push(feature.clone());
                continue;
            }
            group.features.push(feature.clone());

            let slot = output_features.len();
            feature_index_lookup.insert(feature.index_key(), slot);
            join_key_slots
                .entry(feature.prefixed_name())
                .or_default()
                .push(slot);
            prefix_features_lookup.insert(feature.prefixed_name(), feature.clone());
            if feature.is_complex() {
                let schema = feature.avro_schema.as_ref().ok_or_else(|| {
                    FeatureStoreError::with_message(
                        FsErrorCode::FvReadFail,
                        format!("Failed to get feature schema for feature: {}", feature.name),
                    )
                })?;
                let schema = Schema::parse(schema).map_err(|err| {
                    FeatureStoreError::with_message(
                        FsErrorCode::FvReadFail,
                        format!("Failed to parse feature schema of {}: {}", feature.name, err),
                    )
                })?;
                complex_features.insert(slot, schema);
            }
            output_features.push(feature.clone());
        }

        if seen_stores.insert(feature_store_name.to_string()) {
            feature_store_names.push(feature_store_name.to_string());
        }

        Ok(Self {
            feature_store_name: feature_store_name.to_string(),
            feature_view_name: feature_view_name.to_string(),
            feature_view_version,
            prefix_features_lookup,
            primary_keys,
            feature_groups,
            feature_store_names,
            num_of_features: output_features.len(),
            feature_index_lookup,
            output_features,
            join_key_slots,
            complex_features,
        })
    }

    pub fn feature_index(&self, feature_store: &str, feature_group: &str, name: &str) -> Option<usize> {
        self.feature_index_lookup
            .get(&feature_index_key(feature_store, feature_group, name))
            .copied()
    }

    /// Output slot of a passed feature addressed by its prefixed name.
    pub fn passed_feature_slot(&self, prefixed_name: &str) -> Option<usize> {
        let feature = self.prefix_features_lookup.get(prefixed_name)?;
        self.feature_index_lookup.get(&feature.index_key()).copied()
    }

    /// Slots of selected features whose prefixed name equals an entry key.
    pub fn join_key_slots(&self, prefixed_name: &str) -> &[usize] {
        self.join_key_slots
            .get(prefixed_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn complex_schema(&self, slot: usize) -> Option<&Schema> {
        self.complex_features.get(&slot)
    }

    /// Features in output order.
    pub fn output_features(&self) -> &[FeatureMetadata] {
        &self.output_features
    }

    pub fn metadata_projection(&self, options: &MetadataOptions) -> Vec<FeatureMeta> {
        self.output_features
            .iter()
            .map(|feature| FeatureMeta {
                name: options.feature_name.then(|| feature.prefixed_name()),
                feature_type: options.feature_type.then(|| feature.feature_type.clone()),
            })
            .collect()
    }

    /// Finds the primary key an entry key refers to, prefixed name first.
    pub fn primary_key_for_entry(&self, entry: &str) -> Option<&FeatureMetadata> {
        self.primary_keys
            .get(entry)
            .or_else(|| self.primary_keys.values().find(|pk| pk.name == entry))
    }
}
