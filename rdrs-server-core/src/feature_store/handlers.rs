use crate::auth::ApiKeyCache;
use crate::batch::FanOutExecutor;
use crate::error::{FeatureStoreError, FsErrorCode, STATUS_OK};
use crate::feature_store::cache::FeatureViewStore;
use crate::feature_store::metadata::FeatureViewMetadata;
use crate::feature_store::planner::{
    Entries, PlannedRead, assemble_row, overlay_passed_features, plan_reads,
    validate_passed_features, validate_primary_keys,
};
use crate::handler::Handler;
use crate::model::{
    BatchFeatureStoreRequest, BatchFeatureStoreResponse, FeatureStatus, FeatureStoreRequest,
    FeatureStoreResponse,
};
use crate::validators::validate_db_identifier;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::Arc;

/// Separates the row number from the group in batch operation ids.
const OPERATION_ID_SEPARATOR: char = '#';

fn validate_names(feature_store_name: &str, feature_view_name: &str) -> Result<()> {
    validate_db_identifier(feature_store_name)
        .map_err(|err| anyhow!("feature store name is invalid; error: {}", err))?;
    if feature_view_name.is_empty() {
        return Err(anyhow!("feature view name is invalid; error: identifier is empty"));
    }
    Ok(())
}

async fn authenticate_feature_stores(
    auth: &ApiKeyCache,
    api_key: Option<&str>,
    metadata: &FeatureViewMetadata,
) -> Result<()> {
    auth.validate(api_key, &metadata.feature_store_names)
        .await
        .map_err(|err| {
            anyhow::Error::new(FeatureStoreError::with_message(
                FsErrorCode::FeatureStoreNotShared,
                err.to_string(),
            ))
        })
}

/// `POST /feature_store`
pub struct FeatureStoreHandler {
    views: Arc<dyn FeatureViewStore>,
    executor: FanOutExecutor,
    auth: ApiKeyCache,
}

impl FeatureStoreHandler {
    pub fn new(views: Arc<dyn FeatureViewStore>, executor: FanOutExecutor, auth: ApiKeyCache) -> Self {
        Self {
            views,
            executor,
            auth,
        }
    }
}

#[async_trait]
impl Handler for FeatureStoreHandler {
    type Request = FeatureStoreRequest;
    type Response = FeatureStoreResponse;

    fn validate(&self, request: &FeatureStoreRequest) -> Result<()> {
        validate_names(&request.feature_store_name, &request.feature_view_name)
    }

    async fn authenticate(&self, api_key: Option<&str>, request: &FeatureStoreRequest) -> Result<()> {
        let metadata = self
            .views
            .feature_view(
                &request.feature_store_name,
                &request.feature_view_name,
                request.feature_view_version,
            )
            .await?;
        authenticate_feature_stores(&self.auth, api_key, &metadata).await
    }

    async fn execute(&self, request: FeatureStoreRequest) -> Result<(u16, FeatureStoreResponse)> {
        let metadata = self
            .views
            .feature_view(
                &request.feature_store_name,
                &request.feature_view_name,
                request.feature_view_version,
            )
            .await?;
        validate_primary_keys(&request.entries, &metadata)?;
        let passed_features = request.passed_features.unwrap_or_default();
        validate_passed_features(&passed_features, &metadata)?;

        let plan = plan_reads(&metadata, &request.entries, "");
        tracing::debug!(
            request_id = request.request_id.as_deref().unwrap_or_default(),
            "Reading {} feature groups of {}/{}",
            plan.len(),
            metadata.feature_view_name,
            metadata.feature_view_version
        );
        let reads = plan.iter().map(|read| read.params.clone()).collect();
        let out = self.executor.execute(reads).await?;
        let (mut features, status) =
            assemble_row(&metadata, &plan, &out.results, &request.entries)?;
        overlay_passed_features(&mut features, &passed_features, &metadata);

        let options = request.metadata_options.unwrap_or_default();
        Ok((
            STATUS_OK,
            FeatureStoreResponse {
                metadata: metadata.metadata_projection(&options),
                features,
                status,
            },
        ))
    }
}

/// `POST /batch_feature_store`
pub struct BatchFeatureStoreHandler {
    views: Arc<dyn FeatureViewStore>,
    executor: FanOutExecutor,
    auth: ApiKeyCache,
}

impl BatchFeatureStoreHandler {
    pub fn new(views: Arc<dyn FeatureViewStore>, executor: FanOutExecutor, auth: ApiKeyCache) -> Self {
        Self {
            views,
            executor,
            auth,
        }
    }
}

/// Row level checks. A failing row is answered with `ERROR` instead of
/// failing the whole request.
fn check_row(
    entries: &Entries,
    passed_features: Option<&Entries>,
    metadata: &FeatureViewMetadata,
) -> Result<(), FeatureStoreError> {
    validate_primary_keys(entries, metadata)?;
    if let Some(passed_features) = passed_features {
        validate_passed_features(passed_features, metadata)?;
    }
    Ok(())
}

#[async_trait]
impl Handler for BatchFeatureStoreHandler {
    type Request = BatchFeatureStoreRequest;
    type Response = BatchFeatureStoreResponse;

    fn validate(&self, request: &BatchFeatureStoreRequest) -> Result<()> {
        validate_names(&request.feature_store_name, &request.feature_view_name)?;
        if request.entries.is_empty() {
            return Err(FeatureStoreError::new(FsErrorCode::NoPrimaryKeyGiven).into());
        }
        if let Some(passed_features) = &request.passed_features
            && !passed_features.is_empty()
            && passed_features.len() != request.entries.len()
        {
            return Err(FeatureStoreError::with_message(
                FsErrorCode::IncorrectPassedFeature,
                "Length of passed feature does not equal to that of the entries provided in the request.",
            )
            .into());
        }
        Ok(())
    }

    async fn authenticate(
        &self,
        api_key: Option<&str>,
        request: &BatchFeatureStoreRequest,
    ) -> Result<()> {
        let metadata = self
            .views
            .feature_view(
                &request.feature_store_name,
                &request.feature_view_name,
                request.feature_view_version,
            )
            .await?;
        authenticate_feature_stores(&self.auth, api_key, &metadata).await
    }

    async fn execute(
        &self,
        request: BatchFeatureStoreRequest,
    ) -> Result<(u16, BatchFeatureStoreResponse)> {
        let metadata = self
            .views
            .feature_view(
                &request.feature_store_name,
                &request.feature_view_name,
                request.feature_view_version,
            )
            .await?;
        let passed_features = request.passed_features.unwrap_or_default();
        let passed_for_row = |row: usize| passed_features.get(row);

        let mut plans: Vec<Option<Vec<PlannedRead>>> = Vec::with_capacity(request.entries.len());
        let mut reads = Vec::new();
        for (row, entries) in request.entries.iter().enumerate() {
            match check_row(entries, passed_for_row(row), &metadata) {
                Ok(()) => {
                    let prefix = format!("{}{}", row, OPERATION_ID_SEPARATOR);
                    let plan = plan_reads(&metadata, entries, &prefix);
                    reads.extend(plan.iter().map(|read| read.params.clone()));
                    plans.push(Some(plan));
                }
                Err(err) => {
                    tracing::debug!("Skipping row {}: {}", row, err.message);
                    plans.push(None);
                }
            }
        }
        tracing::debug!(
            request_id = request.request_id.as_deref().unwrap_or_default(),
            "Reading {} rows with {} primary key reads",
            request.entries.len(),
            reads.len()
        );

        let out = self.executor.execute(reads).await?;
        let mut results = out.results.as_slice();
        let mut features = Vec::with_capacity(plans.len());
        let mut status = Vec::with_capacity(plans.len());
        for (row, plan) in plans.iter().enumerate() {
            let Some(plan) = plan else {
                features.push(vec![None; metadata.num_of_features]);
                status.push(FeatureStatus::Error);
                continue;
            };
            let (row_results, rest) = results.split_at(plan.len());
            results = rest;
            match assemble_row(&metadata, plan, row_results, &request.entries[row]) {
                Ok((mut row_features, row_status)) => {
                    if let Some(passed) = passed_for_row(row) {
                        overlay_passed_features(&mut row_features, passed, &metadata);
                    }
                    features.push(row_features);
                    status.push(row_status);
                }
                Err(err) => {
                    tracing::debug!("Row {} failed: {}", row, err.message);
                    features.push(vec![None; metadata.num_of_features]);
                    status.push(FeatureStatus::Error);
                }
            }
        }

        let options = request.metadata_options.unwrap_or_default();
        Ok((
            STATUS_OK,
            BatchFeatureStoreResponse {
                metadata: metadata.metadata_projection(&options),
                features,
                status,
            },
        ))
    }
}
