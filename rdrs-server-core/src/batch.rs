//! Batched primary key reads.
//!
//! `POST /batch` sends every sub-operation to the store in a single native
//! call. The feature store paths use [`FanOutExecutor`] instead, which spreads
//! single reads over a small pool of blocking workers.

use crate::auth::ApiKeyCache;
use crate::error::{RdrsError, STATUS_INTERNAL_SERVER_ERROR};
use crate::handler::{Handler, authenticate_dbs};
use crate::model::{BatchOpRequest, BatchResponse, PkReadParams, PkReadResult};
use crate::native::NativeDispatch;
use crate::validators::validate_pk_read;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;

const PK_READ_SUFFIX: &str = "pk-read";

fn is_url_identifier(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '$' || c == '_')
}

/// Splits `{db}/{table}/pk-read` (an optional leading `/` is ignored).
fn parse_relative_url(url: &str) -> Result<(&str, &str)> {
    let trimmed = url.strip_prefix('/').unwrap_or(url);
    let parts: Vec<&str> = trimmed.split('/').collect();
    match parts.as_slice() {
        [db, table, PK_READ_SUFFIX] if is_url_identifier(db) && is_url_identifier(table) => {
            Ok((*db, *table))
        }
        _ => Err(anyhow!("invalid relative URL: {}", url)),
    }
}

/// Turns the wire level batch into plain pk read parameters.
pub fn parse_batch_request(request: BatchOpRequest) -> Result<Vec<PkReadParams>, RdrsError> {
    let operations = request
        .operations
        .ok_or_else(|| RdrsError::bad_request("operations is missing in payload"))?;
    operations
        .into_iter()
        .map(|operation| {
            match operation.method.as_deref() {
                Some("POST") => {}
                Some(other) => {
                    return Err(RdrsError::bad_request(format!(
                        "method '{}' is not supported in batch operations",
                        other
                    )));
                }
                None => return Err(RdrsError::bad_request("method is missing in operation")),
            }
            let url = operation
                .relative_url
                .ok_or_else(|| RdrsError::bad_request("relative-url is missing in operation"))?;
            let (db, table) = parse_relative_url(&url)
                .map_err(|err| RdrsError::bad_request(err.to_string()))?;
            let body = operation
                .body
                .ok_or_else(|| RdrsError::bad_request("body of operation is nil"))?;
            Ok(body.into_params(db, table))
        })
        .collect()
}

/// `POST /batch`
pub struct BatchOpHandler {
    dispatch: Arc<NativeDispatch>,
    auth: ApiKeyCache,
    batch_max_size: u32,
    operation_id_max_size: u32,
}

impl BatchOpHandler {
    pub fn new(
        dispatch: Arc<NativeDispatch>,
        auth: ApiKeyCache,
        batch_max_size: u32,
        operation_id_max_size: u32,
    ) -> Self {
        Self {
            dispatch,
            auth,
            batch_max_size,
            operation_id_max_size,
        }
    }
}

#[async_trait]
impl Handler for BatchOpHandler {
    type Request = Vec<PkReadParams>;
    type Response = BatchResponse;

    fn validate(&self, request: &Vec<PkReadParams>) -> Result<()> {
        if request.is_empty() {
            return Err(anyhow!("list of operations is empty"));
        }
        if request.len() > self.batch_max_size as usize {
            return Err(anyhow!(
                "too many operations. Max allowed operations: {}, got: {}",
                self.batch_max_size,
                request.len()
            ));
        }
        for params in request {
            validate_pk_read(params, self.operation_id_max_size)?;
        }
        Ok(())
    }

    async fn authenticate(&self, api_key: Option<&str>, request: &Vec<PkReadParams>) -> Result<()> {
        let dbs: Vec<String> = request
            .iter()
            .map(|params| params.db.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        authenticate_dbs(&self.auth, api_key, &dbs).await
    }

    async fn execute(&self, request: Vec<PkReadParams>) -> Result<(u16, BatchResponse)> {
        let dispatch = self.dispatch.clone();
        let result = tokio::task::spawn_blocking(move || dispatch.pk_batch_read(&request)).await??;
        Ok((crate::error::STATUS_OK, BatchResponse { result }))
    }
}

/// Output of a fan-out: one slot per input, in input order.
pub struct FanOutResults {
    pub results: Vec<Result<PkReadResult, RdrsError>>,
}

impl FanOutResults {
    /// First slot, in input order, that is neither a hit nor a miss.
    pub fn first_fatal(&self) -> Option<RdrsError> {
        self.results.iter().find_map(|result| match result {
            Err(err) => Some(err.clone()),
            Ok(result) if result.is_fatal() => Some(RdrsError::new(
                result.code,
                result.message.clone().unwrap_or_default(),
            )),
            Ok(_) => None,
        })
    }
}

/// Runs single pk reads on a fixed number of blocking workers. Workers drain
/// the queue to the end even after a read failed.
#[derive(Clone)]
pub struct FanOutExecutor {
    dispatch: Arc<NativeDispatch>,
    workers: usize,
}

impl FanOutExecutor {
    pub fn new(dispatch: Arc<NativeDispatch>, workers: u32) -> Self {
        Self {
            dispatch,
            workers: workers.max(1) as usize,
        }
    }

    pub async fn execute(&self, requests: Vec<PkReadParams>) -> Result<FanOutResults> {
        let total = requests.len();
        let queue: Arc<Mutex<VecDeque<(usize, PkReadParams)>>> =
            Arc::new(Mutex::new(requests.into_iter().enumerate().collect()));

        let mut join_set: JoinSet<Vec<(usize, Result<PkReadResult, RdrsError>)>> = JoinSet::new();
        for _ in 0..self.workers.min(total) {
            let queue = queue.clone();
            let dispatch = self.dispatch.clone();
            join_set.spawn_blocking(move || {
                let mut done = Vec::new();
                loop {
                    let next = queue
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .pop_front();
                    let Some((index, params)) = next else {
                        break;
                    };
                    let result = dispatch
                        .pk_read(&params)
                        .map_err(|err| RdrsError::from_anyhow(err, STATUS_INTERNAL_SERVER_ERROR));
                    done.push((index, result));
                }
                done
            });
        }

        let mut slots: Vec<Option<Result<PkReadResult, RdrsError>>> =
            (0..total).map(|_| None).collect();
        while let Some(res) = join_set.join_next().await {
            let done = res.map_err(|err| anyhow!("Error joining pk read worker: {:?}", err))?;
            for (index, result) in done {
                slots[index] = Some(result);
            }
        }
        let results = slots
            .into_iter()
            .map(|slot| slot.ok_or_else(|| anyhow!("pk read worker dropped an operation")))
            .collect::<Result<Vec<_>>>()?;
        Ok(FanOutResults { results })
    }
}
