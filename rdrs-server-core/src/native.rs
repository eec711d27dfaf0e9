//! Native dispatch. Requests are encoded into pooled buffers and handed to a
//! [`RonDbClient`], either the RonDB C library or the in-memory store.

mod encoding;
#[cfg(feature = "rondb")]
pub mod ffi;
pub mod memory;

use crate::buffer_pool::{BufferPool, NativeBuffer, PooledBuffer};
use crate::error::{RdrsError, STATUS_NOT_FOUND, STATUS_OK};
use crate::model::{PkReadParams, PkReadResponse, PkReadResult};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use encoding::{decode_pk_response, encode_pk_request};

pub const ADDRESS_SIZE: u32 = 4;

pub const RDRS_PK_REQ_ID: u32 = 1;
pub const RDRS_PK_RESP_ID: u32 = 2;
pub const RDRS_BATCH_REQ_ID: u32 = 3;
pub const RDRS_BATCH_RESP_ID: u32 = 4;

pub const RDRS_UNKNOWN_DATATYPE: u32 = 0;
pub const RDRS_STRING_DATATYPE: u32 = 1;
pub const RDRS_INTEGER_DATATYPE: u32 = 2;
pub const RDRS_FLOAT_DATATYPE: u32 = 3;
pub const RDRS_BINARY_DATATYPE: u32 = 4;
pub const RDRS_DATETIME_DATATYPE: u32 = 5;
pub const RDRS_BIT_DATATYPE: u32 = 6;

pub const DEFAULT_DRT: u32 = 1;

pub const PK_REQ_OP_TYPE_IDX: usize = 0;
pub const PK_REQ_CAPACITY_IDX: usize = 1;
pub const PK_REQ_LENGTH_IDX: usize = 2;
pub const PK_REQ_DB_IDX: usize = 3;
pub const PK_REQ_TABLE_IDX: usize = 4;
pub const PK_REQ_PK_COLS_IDX: usize = 5;
pub const PK_REQ_READ_COLS_IDX: usize = 6;
pub const PK_REQ_OP_ID_IDX: usize = 7;
pub const PK_REQ_HEADER_END: u32 = 32;

pub const PK_RESP_OP_TYPE_IDX: usize = 0;
pub const PK_RESP_OP_STATUS_IDX: usize = 1;
pub const PK_RESP_CAPACITY_IDX: usize = 2;
pub const PK_RESP_LENGTH_IDX: usize = 3;
pub const PK_RESP_DB_IDX: usize = 4;
pub const PK_RESP_TABLE_IDX: usize = 5;
pub const PK_RESP_COLS_IDX: usize = 6;
pub const PK_RESP_OP_ID_IDX: usize = 7;
pub const PK_RESP_HEADER_END: u32 = 32;

/// Status returned by every native call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeStatus {
    pub http_code: u16,
    pub status: i32,
    pub classification: i32,
    pub code: i32,
    pub mysql_code: i32,
    pub message: String,
    pub err_line_no: i32,
    pub err_file_name: String,
}

impl NativeStatus {
    pub fn ok() -> Self {
        Self {
            http_code: STATUS_OK,
            ..Default::default()
        }
    }

    pub fn new(http_code: u16, message: impl Into<String>) -> Self {
        Self {
            http_code,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_location(mut self, file: impl Into<String>, line: i32) -> Self {
        self.err_file_name = file.into();
        self.err_line_no = line;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.http_code == STATUS_OK
    }

    /// Message shown to clients: verbose with source location for server
    /// errors, the short message otherwise.
    pub fn client_message(&self) -> String {
        if self.http_code >= 500 {
            format!(
                "{}; File: {}, Line: {}",
                self.message, self.err_file_name, self.err_line_no
            )
        } else {
            self.message.clone()
        }
    }

    pub fn to_error(&self) -> Option<RdrsError> {
        if self.is_ok() {
            None
        } else {
            Some(RdrsError::new(self.http_code, self.client_message()))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connected,
    Connecting,
    #[default]
    Disconnected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RonDbStats {
    #[serde(rename = "ndbObjectsCreationCount")]
    pub ndb_objects_created: u64,
    #[serde(rename = "ndbObjectsDeletionCount")]
    pub ndb_objects_deleted: u64,
    #[serde(rename = "ndbObjectsTotalCount")]
    pub ndb_objects_count: u64,
    #[serde(rename = "ndbObjectsFreeCount")]
    pub ndb_objects_available: u64,
    #[serde(skip)]
    pub connection_state: ConnectionState,
    #[serde(skip)]
    pub is_shutdown: bool,
    #[serde(skip)]
    pub is_reconnection_in_progress: bool,
}

/// Synchronous native entry points. Calls block the calling thread.
pub trait RonDbClient: Send + Sync + 'static {
    fn pk_read(&self, request: &mut NativeBuffer, response: &mut NativeBuffer) -> NativeStatus;

    /// The i-th response buffer answers the i-th request buffer.
    fn pk_batch_read(
        &self,
        requests: &mut [&mut NativeBuffer],
        responses: &mut [&mut NativeBuffer],
    ) -> NativeStatus;

    fn stats(&self) -> Result<RonDbStats>;

    fn shutdown(&self) -> Result<()>;
}

/// Couples the buffer pool with a native client. Every operation borrows its
/// buffers for exactly its own duration.
pub struct NativeDispatch {
    pool: Arc<BufferPool>,
    client: Arc<dyn RonDbClient>,
}

impl NativeDispatch {
    pub fn new(pool: Arc<BufferPool>, client: Arc<dyn RonDbClient>) -> Self {
        Self { pool, client }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn client(&self) -> &Arc<dyn RonDbClient> {
        &self.client
    }

    /// Single primary key read. Store level failures are reported in the
    /// result code and message; `Err` is reserved for encoding and buffer
    /// failures. A missing row comes back as a native 404 with the response
    /// buffer written, and yields code 404 with the decoded body and no message.
    pub fn pk_read(&self, params: &PkReadParams) -> Result<PkReadResult> {
        let mut request = self.pool.acquire()?;
        let mut response = self.pool.acquire()?;
        encode_pk_request(params, &mut request)?;
        let status = self.client.pk_read(&mut request, &mut response);
        // A 404 without a readable response (unknown table) stays an error.
        if status.http_code == STATUS_NOT_FOUND
            && let Ok((_, body)) = decode_pk_response(&response)
        {
            return Ok(PkReadResult {
                code: STATUS_NOT_FOUND,
                body,
                message: None,
            });
        }
        if !status.is_ok() {
            return Ok(PkReadResult {
                code: status.http_code,
                body: PkReadResponse::with_operation_id(params.operation_id.clone()),
                message: Some(status.client_message()),
            });
        }
        let (code, body) = decode_pk_response(&response)?;
        Ok(PkReadResult {
            code,
            body,
            message: None,
        })
    }

    /// All reads go to the store in one native call. A failing call fails the
    /// whole batch; per-row outcomes come back in each result code.
    pub fn pk_batch_read(&self, params: &[PkReadParams]) -> Result<Vec<PkReadResult>> {
        let mut requests: Vec<PooledBuffer> = Vec::with_capacity(params.len());
        let mut responses: Vec<PooledBuffer> = Vec::with_capacity(params.len());
        for param in params {
            let mut request = self.pool.acquire()?;
            encode_pk_request(param, &mut request)?;
            requests.push(request);
            responses.push(self.pool.acquire()?);
        }
        let mut request_refs: Vec<&mut NativeBuffer> =
            requests.iter_mut().map(|buffer| &mut **buffer).collect();
        let mut response_refs: Vec<&mut NativeBuffer> =
            responses.iter_mut().map(|buffer| &mut **buffer).collect();
        let status = self
            .client
            .pk_batch_read(&mut request_refs, &mut response_refs);
        if let Some(err) = status.to_error() {
            return Err(err.into());
        }
        responses
            .iter()
            .map(|response| {
                let (code, body) = decode_pk_response(response)?;
                Ok(PkReadResult {
                    code,
                    body,
                    message: None,
                })
            })
            .collect()
    }

    pub fn rondb_stats(&self) -> Result<RonDbStats> {
        self.client.stats()
    }

    pub fn shutdown(&self) -> Result<()> {
        self.client.shutdown()?;
        self.pool.shutdown()
    }
}
