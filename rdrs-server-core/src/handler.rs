//! The `validate -> authenticate -> execute` pipeline every endpoint runs.

use crate::auth::{ApiKeyCache, ApiKeyError};
use crate::batch::{BatchOpHandler, FanOutExecutor};
use crate::config::Internal;
use crate::error::{
    RdrsError, STATUS_BAD_REQUEST, STATUS_INTERNAL_SERVER_ERROR, STATUS_UNAUTHORIZED,
};
use crate::feature_store::{BatchFeatureStoreHandler, FeatureStoreHandler, FeatureViewStore};
use crate::native::NativeDispatch;
use crate::pk_read::PkReadHandler;
use crate::stat::{HealthHandler, StatHandler};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    fn validate(&self, request: &Self::Request) -> Result<()>;

    async fn authenticate(&self, api_key: Option<&str>, request: &Self::Request) -> Result<()>;

    /// Returns the HTTP status together with the response body.
    async fn execute(&self, request: Self::Request) -> Result<(u16, Self::Response)>;
}

/// Runs the pipeline on its own task so that a panicking handler turns into a
/// 500 instead of tearing down the connection.
pub async fn handle<H: Handler>(
    handler: Arc<H>,
    api_key: Option<String>,
    request: H::Request,
) -> Result<(u16, H::Response), RdrsError> {
    let task = tokio::spawn(async move {
        handler
            .validate(&request)
            .map_err(|err| RdrsError::from_anyhow(err, STATUS_BAD_REQUEST))?;
        handler
            .authenticate(api_key.as_deref(), &request)
            .await
            .map_err(|err| RdrsError::from_anyhow(err, STATUS_UNAUTHORIZED))?;
        handler
            .execute(request)
            .await
            .map_err(|err| RdrsError::from_anyhow(err, STATUS_INTERNAL_SERVER_ERROR))
    });
    match task.await {
        Ok(result) => result,
        Err(join_error) => {
            tracing::error!(error = %join_error, "Request handler panicked");
            Err(RdrsError::internal("Internal server error"))
        }
    }
}

/// Shared authentication step: the key must grant access to every database.
pub async fn authenticate_dbs(
    auth: &ApiKeyCache,
    api_key: Option<&str>,
    dbs: &[String],
) -> Result<()> {
    auth.validate(api_key, dbs)
        .await
        .map_err(|err: ApiKeyError| anyhow::Error::new(RdrsError::unauthorized(err.to_string())))
}

/// Every endpoint handler, shared by the REST and gRPC front ends.
#[derive(Clone)]
pub struct Handlers {
    pub pk_read: Arc<PkReadHandler>,
    pub batch: Arc<BatchOpHandler>,
    pub feature_store: Arc<FeatureStoreHandler>,
    pub batch_feature_store: Arc<BatchFeatureStoreHandler>,
    pub stat: Arc<StatHandler>,
    pub health: Arc<HealthHandler>,
}

impl Handlers {
    pub fn new(
        dispatch: Arc<NativeDispatch>,
        views: Arc<dyn FeatureViewStore>,
        auth: ApiKeyCache,
        internal: &Internal,
    ) -> Self {
        let executor = FanOutExecutor::new(dispatch.clone(), internal.num_threads);
        Self {
            pk_read: Arc::new(PkReadHandler::new(
                dispatch.clone(),
                auth.clone(),
                internal.operation_id_max_size,
            )),
            batch: Arc::new(BatchOpHandler::new(
                dispatch.clone(),
                auth.clone(),
                internal.batch_max_size,
                internal.operation_id_max_size,
            )),
            feature_store: Arc::new(FeatureStoreHandler::new(
                views.clone(),
                executor.clone(),
                auth.clone(),
            )),
            batch_feature_store: Arc::new(BatchFeatureStoreHandler::new(views, executor, auth.clone())),
            stat: Arc::new(StatHandler::new(dispatch.clone(), auth)),
            health: Arc::new(HealthHandler::new(dispatch)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Echo {
        executed: AtomicUsize,
    }

    #[async_trait]
    impl Handler for Echo {
        type Request = String;
        type Response = String;

        fn validate(&self, request: &String) -> Result<()> {
            if request.is_empty() {
                return Err(anyhow!("empty request"));
            }
            Ok(())
        }

        async fn authenticate(&self, api_key: Option<&str>, _request: &String) -> Result<()> {
            match api_key {
                Some("good") => Ok(()),
                _ => Err(anyhow!("bad key")),
            }
        }

        async fn execute(&self, request: String) -> Result<(u16, String)> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            match request.as_str() {
                "panic" => panic!("boom"),
                "missing" => Err(RdrsError::not_found("no such row").into()),
                "fail" => Err(anyhow!("native call failed")),
                _ => Ok((200, request.to_uppercase())),
            }
        }
    }

    fn key(k: &str) -> Option<String> {
        Some(k.to_string())
    }

    #[tokio::test]
    async fn runs_all_stages() {
        let handler = Arc::new(Echo::default());
        let (status, body) = handle(handler.clone(), key("good"), "abc".to_string())
            .await
            .unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, "ABC");
        assert_eq!(handler.executed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stage_failures_get_their_status() {
        let handler = Arc::new(Echo::default());
        let err = handle(handler.clone(), key("good"), String::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);

        let err = handle(handler.clone(), key("bad"), "abc".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.status(), 401);
        assert_eq!(handler.executed.load(Ordering::SeqCst), 0);

        let err = handle(handler.clone(), key("good"), "fail".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.status(), 500);
        assert_eq!(err.message(), "native call failed");

        let err = handle(handler, key("good"), "missing".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.status(), 404);
    }

    #[tokio::test]
    async fn panic_becomes_internal_error() {
        let handler = Arc::new(Echo::default());
        let err = handle(handler, key("good"), "panic".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.status(), 500);
        assert_eq!(err.message(), "Internal server error");
    }
}
