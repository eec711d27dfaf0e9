use crate::auth::ApiKeyCache;
use crate::error::{RdrsError, STATUS_OK};
use crate::handler::{Handler, authenticate_dbs};
use crate::model::StatResponse;
use crate::native::{ConnectionState, NativeDispatch};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// `GET /stat`: buffer pool and native object counters.
pub struct StatHandler {
    dispatch: Arc<NativeDispatch>,
    auth: ApiKeyCache,
}

impl StatHandler {
    pub fn new(dispatch: Arc<NativeDispatch>, auth: ApiKeyCache) -> Self {
        Self { dispatch, auth }
    }
}

#[async_trait]
impl Handler for StatHandler {
    type Request = ();
    type Response = StatResponse;

    fn validate(&self, _request: &()) -> Result<()> {
        Ok(())
    }

    async fn authenticate(&self, api_key: Option<&str>, _request: &()) -> Result<()> {
        authenticate_dbs(&self.auth, api_key, &[]).await
    }

    async fn execute(&self, _request: ()) -> Result<(u16, StatResponse)> {
        let rondb_stats = self.dispatch.rondb_stats()?;
        Ok((
            STATUS_OK,
            StatResponse {
                memory_stats: self.dispatch.pool().stats(),
                rondb_stats,
            },
        ))
    }
}

/// `GET /health`: `0` while the native connection is up.
pub struct HealthHandler {
    dispatch: Arc<NativeDispatch>,
}

impl HealthHandler {
    pub fn new(dispatch: Arc<NativeDispatch>) -> Self {
        Self { dispatch }
    }
}

#[async_trait]
impl Handler for HealthHandler {
    type Request = ();
    type Response = String;

    fn validate(&self, _request: &()) -> Result<()> {
        Ok(())
    }

    async fn authenticate(&self, _api_key: Option<&str>, _request: &()) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, _request: ()) -> Result<(u16, String)> {
        let stats = self.dispatch.rondb_stats()?;
        if stats.connection_state != ConnectionState::Connected {
            return Err(RdrsError::unavailable(format!(
                "RonDB connection state: {:?}",
                stats.connection_state
            ))
            .into());
        }
        Ok((STATUS_OK, "0".to_string()))
    }
}
