use crate::auth::ApiKeyCache;
use crate::error::RdrsError;
use crate::handler::{Handler, authenticate_dbs};
use crate::model::{PkReadParams, PkReadResponse};
use crate::native::NativeDispatch;
use crate::validators::validate_pk_read;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// `POST /{db}/{table}/pk-read`
pub struct PkReadHandler {
    dispatch: Arc<NativeDispatch>,
    auth: ApiKeyCache,
    operation_id_max_size: u32,
}

impl PkReadHandler {
    pub fn new(dispatch: Arc<NativeDispatch>, auth: ApiKeyCache, operation_id_max_size: u32) -> Self {
        Self {
            dispatch,
            auth,
            operation_id_max_size,
        }
    }
}

#[async_trait]
impl Handler for PkReadHandler {
    type Request = PkReadParams;
    type Response = PkReadResponse;

    fn validate(&self, request: &PkReadParams) -> Result<()> {
        validate_pk_read(request, self.operation_id_max_size)
    }

    async fn authenticate(&self, api_key: Option<&str>, request: &PkReadParams) -> Result<()> {
        authenticate_dbs(&self.auth, api_key, std::slice::from_ref(&request.db)).await
    }

    async fn execute(&self, request: PkReadParams) -> Result<(u16, PkReadResponse)> {
        let dispatch = self.dispatch.clone();
        let result = tokio::task::spawn_blocking(move || dispatch.pk_read(&request)).await??;
        if let Some(message) = result.message {
            return Err(RdrsError::new(result.code, message).into());
        }
        Ok((result.code, result.body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::{CountingStore, api_key};
    use crate::buffer_pool::BufferPool;
    use crate::config::ApiKeyConfig;
    use crate::handler::handle;
    use crate::native::memory::tests::{read, sample_db};

    fn handler(auth_enabled: bool) -> Arc<PkReadHandler> {
        let dispatch = Arc::new(NativeDispatch::new(
            BufferPool::new(4096, 4).unwrap(),
            Arc::new(sample_db()),
        ));
        let auth = ApiKeyCache::new(
            Arc::new(CountingStore::with_projects(&["db001"])),
            ApiKeyConfig {
                use_hopsworks_api_keys: auth_enabled,
                ..Default::default()
            },
        );
        Arc::new(PkReadHandler::new(dispatch, auth, 256))
    }

    #[tokio::test]
    async fn hit_returns_columns() {
        let (status, body) = handle(handler(false), None, read("7", &["col0"], Some("op7")))
            .await
            .unwrap();
        assert_eq!(status, 200);
        assert_eq!(body.operation_id.as_deref(), Some("op7"));
        assert_eq!(body.data["col0"].as_ref().unwrap().get(), "\"hello_7\"");
    }

    #[tokio::test]
    async fn miss_is_not_found_with_empty_data() {
        let (status, body) = handle(handler(false), None, read("999", &["col0"], Some("op")))
            .await
            .unwrap();
        assert_eq!(status, 404);
        assert!(body.data.is_empty());
        assert_eq!(body.operation_id.as_deref(), Some("op"));
    }

    #[tokio::test]
    async fn unknown_column_is_bad_request() {
        let err = handle(handler(false), None, read("1", &["nope"], None))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);
        assert!(err.message().contains("Column does not exist"));
    }

    #[tokio::test]
    async fn invalid_identifier_fails_validation() {
        let mut params = read("1", &["col0"], None);
        params.db = String::new();
        let err = handle(handler(false), None, params).await.unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn api_key_is_checked_against_db() {
        let handler = handler(true);
        let err = handle(handler.clone(), None, read("1", &["col0"], None))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 401);
        assert_eq!(err.message(), "Unauthorized. No API key supplied");

        let (status, _) = handle(handler.clone(), Some(api_key()), read("1", &["col0"], None))
            .await
            .unwrap();
        assert_eq!(status, 200);

        let mut other_db = read("1", &["col0"], None);
        other_db.db = "db002".to_string();
        let err = handle(handler, Some(api_key()), other_db).await.unwrap_err();
        assert_eq!(err.status(), 401);
    }
}
