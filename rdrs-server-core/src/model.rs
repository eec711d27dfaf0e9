use crate::buffer_pool::MemoryStats;
use crate::native::RonDbStats;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::BTreeMap;

pub const DRT_DEFAULT: &str = "default";
pub const DRT_BASE64: &str = "base64";

pub type RawJson = Box<RawValue>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub value: RawJson,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadColumn {
    pub column: String,
    #[serde(
        rename = "dataReturnType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub data_return_type: Option<String>,
}

/// Body of `POST /{db}/{table}/pk-read` and of every batch sub-operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PkReadBody {
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(
        rename = "readColumns",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub read_columns: Option<Vec<ReadColumn>>,
    #[serde(
        rename = "operationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_id: Option<String>,
}

impl PkReadBody {
    pub fn into_params(self, db: impl Into<String>, table: impl Into<String>) -> PkReadParams {
        PkReadParams {
            db: db.into(),
            table: table.into(),
            filters: self.filters,
            read_columns: self.read_columns,
            operation_id: self.operation_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PkReadParams {
    pub db: String,
    pub table: String,
    pub filters: Vec<Filter>,
    pub read_columns: Option<Vec<ReadColumn>>,
    pub operation_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PkReadResponse {
    #[serde(
        rename = "operationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, Option<RawJson>>,
}

impl PkReadResponse {
    pub fn with_operation_id(operation_id: Option<String>) -> Self {
        Self {
            operation_id,
            data: BTreeMap::new(),
        }
    }
}

/// Outcome of one native primary key read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkReadResult {
    pub code: u16,
    pub body: PkReadResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PkReadResult {
    pub fn is_ok(&self) -> bool {
        self.code == crate::error::STATUS_OK
    }

    /// 200 and 404 are both normal answers from the store.
    pub fn is_fatal(&self) -> bool {
        self.code != crate::error::STATUS_OK && self.code != crate::error::STATUS_NOT_FOUND
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOpRequest {
    #[serde(default)]
    pub operations: Option<Vec<BatchSubOp>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSubOp {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(rename = "relative-url", default)]
    pub relative_url: Option<String>,
    #[serde(default)]
    pub body: Option<PkReadBody>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResponse {
    pub result: Vec<PkReadResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataOptions {
    #[serde(default = "default_true")]
    pub feature_name: bool,
    #[serde(default = "default_true")]
    pub feature_type: bool,
}

impl Default for MetadataOptions {
    fn default() -> Self {
        Self {
            feature_name: true,
            feature_type: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureStoreRequest {
    pub feature_store_name: String,
    pub feature_view_name: String,
    pub feature_view_version: i32,
    #[serde(default)]
    pub entries: BTreeMap<String, RawJson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed_features: Option<BTreeMap<String, RawJson>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_options: Option<MetadataOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFeatureStoreRequest {
    pub feature_store_name: String,
    pub feature_view_name: String,
    pub feature_view_version: i32,
    #[serde(default)]
    pub entries: Vec<BTreeMap<String, RawJson>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed_features: Option<Vec<BTreeMap<String, RawJson>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_options: Option<MetadataOptions>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureStatus {
    Complete,
    Missing,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub feature_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureStoreResponse {
    pub metadata: Vec<FeatureMeta>,
    pub features: Vec<Option<RawJson>>,
    pub status: FeatureStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFeatureStoreResponse {
    pub metadata: Vec<FeatureMeta>,
    pub features: Vec<Vec<Option<RawJson>>>,
    pub status: Vec<FeatureStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatResponse {
    pub memory_stats: MemoryStats,
    #[serde(rename = "ronDBStats")]
    pub rondb_stats: RonDbStats,
}

/// Builds a raw JSON value, falling back to `null` when `json` is not valid JSON.
pub fn raw_json(json: impl Into<String>) -> RawJson {
    RawValue::from_string(json.into()).unwrap_or_else(|_| null_json())
}

pub fn null_json() -> RawJson {
    RawValue::from_string("null".to_string())
        .unwrap_or_else(|_| unreachable!("null is valid JSON"))
}
