//! Bindings to the RonDB data access library (`librdrs_client`).

use super::*;
use crate::auth::{ApiKeyRecord, ApiKeyStore};
use crate::config::RonDbConfig;
use crate::error::STATUS_INTERNAL_SERVER_ERROR;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::ffi::{CStr, CString, c_char, c_int, c_uchar, c_uint};

const RS_STATUS_MSG_LEN: usize = 256;
const RS_STATUS_FILE_NAME_LEN: usize = 256;

#[repr(C)]
struct RsStatus {
    http_code: c_int,
    status: c_int,
    classification: c_int,
    code: c_int,
    mysql_code: c_int,
    message: [c_char; RS_STATUS_MSG_LEN],
    err_line_no: c_int,
    err_file_name: [c_char; RS_STATUS_FILE_NAME_LEN],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RsBuffer {
    size: c_uint,
    buffer: *mut c_char,
}

#[repr(C)]
#[derive(Default)]
struct RonDbStatsRaw {
    ndb_objects_created: c_uint,
    ndb_objects_deleted: c_uint,
    ndb_objects_count: c_uint,
    ndb_objects_available: c_uint,
    connection_state: c_int,
    is_shutdown: c_uchar,
    is_reconnection_in_progress: c_uchar,
}

#[repr(C)]
struct HopsworksApiKey {
    secret: [c_char; 513],
    salt: [c_char; 257],
    name: [c_char; 46],
    user_id: c_int,
}

#[link(name = "rdrs_client")]
unsafe extern "C" {
    fn init() -> RsStatus;
    fn add_data_connection(
        connection_string: *const c_char,
        connection_pool_size: c_uint,
        node_ids: *mut c_uint,
        node_ids_len: c_uint,
        connection_retries: c_uint,
        connection_retry_delay_in_sec: c_uint,
    ) -> RsStatus;
    fn set_op_retry_props_data_cluster(
        retry_count: c_uint,
        retry_initial_delay: c_uint,
        jitter: c_uint,
    ) -> RsStatus;
    fn shutdown_connection() -> RsStatus;
    fn pk_read(req: *mut RsBuffer, resp: *mut RsBuffer) -> RsStatus;
    fn pk_batch_read(no_req: c_uint, reqs: *mut RsBuffer, resps: *mut RsBuffer) -> RsStatus;
    fn get_rondb_stats(stats: *mut RonDbStatsRaw) -> RsStatus;
    fn find_api_key(prefix: *const c_char, api_key: *mut HopsworksApiKey) -> RsStatus;
    fn find_all_projects(uid: c_int, projects: *mut *mut *mut c_char, count: *mut c_int)
    -> RsStatus;
}

fn c_chars_to_string(chars: &[c_char]) -> String {
    let bytes: Vec<u8> = chars
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

impl From<RsStatus> for NativeStatus {
    fn from(raw: RsStatus) -> Self {
        NativeStatus {
            http_code: u16::try_from(raw.http_code).unwrap_or(500),
            status: raw.status,
            classification: raw.classification,
            code: raw.code,
            mysql_code: raw.mysql_code,
            message: c_chars_to_string(&raw.message),
            err_line_no: raw.err_line_no,
            err_file_name: c_chars_to_string(&raw.err_file_name),
        }
    }
}

/// The native layer reads buffers as 32 bit words.
fn misaligned(buffers: &[RsBuffer]) -> Option<NativeStatus> {
    buffers
        .iter()
        .any(|b| (b.buffer as usize) % ADDRESS_SIZE as usize != 0)
        .then(|| {
            NativeStatus::new(STATUS_INTERNAL_SERVER_ERROR, "buffer is not word aligned")
                .with_location(file!(), line!() as i32)
        })
}

fn rs_buffer(buffer: &mut NativeBuffer) -> RsBuffer {
    RsBuffer {
        size: buffer.size(),
        buffer: buffer.as_mut_ptr().cast::<c_char>(),
    }
}

fn check(status: RsStatus, what: &str) -> Result<()> {
    let status = NativeStatus::from(status);
    match status.to_error() {
        None => Ok(()),
        Some(err) => Err(anyhow!(err)).with_context(|| format!("{} failed", what)),
    }
}

/// Handle to the process wide native connection.
pub struct NativeRonDb {
    _private: (),
}

impl NativeRonDb {
    pub fn connect(config: &RonDbConfig) -> Result<Self> {
        let mgmds = config.mgmd_connect_string()?;
        let connect_string = CString::new(mgmds.as_str())?;
        // SAFETY: all pointers passed below outlive the calls and the library copies them.
        unsafe {
            check(init(), "init")?;
            let mut node_ids: Vec<c_uint> = config.node_ids.clone();
            check(
                add_data_connection(
                    connect_string.as_ptr(),
                    config.connection_pool_size,
                    node_ids.as_mut_ptr(),
                    node_ids.len() as c_uint,
                    config.connection_retries,
                    config.connection_retry_delay_in_sec,
                ),
                "add_data_connection",
            )?;
            check(
                set_op_retry_props_data_cluster(
                    config.op_retry_on_transient_errors_count,
                    config.op_retry_initial_delay_in_ms,
                    config.op_retry_jitter_in_ms,
                ),
                "set_op_retry_props_data_cluster",
            )?;
        }
        tracing::info!("Connected to RonDB at {}", mgmds);
        Ok(Self { _private: () })
    }
}

impl RonDbClient for NativeRonDb {
    fn pk_read(&self, request: &mut NativeBuffer, response: &mut NativeBuffer) -> NativeStatus {
        let mut req = rs_buffer(request);
        let mut resp = rs_buffer(response);
        if let Some(status) = misaligned(&[req, resp]) {
            return status;
        }
        // SAFETY: both buffers are exclusively borrowed for the duration of the call.
        unsafe { pk_read(&mut req, &mut resp) }.into()
    }

    fn pk_batch_read(
        &self,
        requests: &mut [&mut NativeBuffer],
        responses: &mut [&mut NativeBuffer],
    ) -> NativeStatus {
        let mut reqs: Vec<RsBuffer> = requests.iter_mut().map(|b| rs_buffer(b)).collect();
        let mut resps: Vec<RsBuffer> = responses.iter_mut().map(|b| rs_buffer(b)).collect();
        if let Some(status) = misaligned(&reqs).or_else(|| misaligned(&resps)) {
            return status;
        }
        // SAFETY: see `pk_read`; the descriptor arrays live until the call returns.
        unsafe {
            pk_batch_read(
                reqs.len() as c_uint,
                reqs.as_mut_ptr(),
                resps.as_mut_ptr(),
            )
        }
        .into()
    }

    fn stats(&self) -> Result<RonDbStats> {
        let mut raw = RonDbStatsRaw::default();
        // SAFETY: `raw` is a valid out pointer.
        check(unsafe { get_rondb_stats(&mut raw) }, "get_rondb_stats")?;
        Ok(RonDbStats {
            ndb_objects_created: raw.ndb_objects_created as u64,
            ndb_objects_deleted: raw.ndb_objects_deleted as u64,
            ndb_objects_count: raw.ndb_objects_count as u64,
            ndb_objects_available: raw.ndb_objects_available as u64,
            connection_state: match raw.connection_state {
                0 => ConnectionState::Connected,
                1 => ConnectionState::Connecting,
                _ => ConnectionState::Disconnected,
            },
            is_shutdown: raw.is_shutdown != 0,
            is_reconnection_in_progress: raw.is_reconnection_in_progress != 0,
        })
    }

    fn shutdown(&self) -> Result<()> {
        // SAFETY: no arguments.
        check(unsafe { shutdown_connection() }, "shutdown_connection")
    }
}

fn lookup_api_key(prefix: &str) -> Result<Option<ApiKeyRecord>> {
    let prefix = CString::new(prefix)?;
    let mut raw = HopsworksApiKey {
        secret: [0; 513],
        salt: [0; 257],
        name: [0; 46],
        user_id: 0,
    };
    // SAFETY: `raw` is a valid out pointer and `prefix` is NUL terminated.
    let status: NativeStatus = unsafe { find_api_key(prefix.as_ptr(), &mut raw) }.into();
    if status.http_code == crate::error::STATUS_NOT_FOUND {
        return Ok(None);
    }
    if let Some(err) = status.to_error() {
        return Err(anyhow!(err)).context("find_api_key failed");
    }
    Ok(Some(ApiKeyRecord {
        secret: c_chars_to_string(&raw.secret),
        salt: c_chars_to_string(&raw.salt),
        name: c_chars_to_string(&raw.name),
        user_id: raw.user_id,
    }))
}

fn lookup_projects(user_id: i32) -> Result<Vec<String>> {
    let mut projects: *mut *mut c_char = std::ptr::null_mut();
    let mut count: c_int = 0;
    // SAFETY: out pointers are valid; the library allocates the array with malloc.
    check(
        unsafe { find_all_projects(user_id, &mut projects, &mut count) },
        "find_all_projects",
    )?;
    let mut names = Vec::with_capacity(count.max(0) as usize);
    if projects.is_null() {
        return Ok(names);
    }
    for i in 0..count.max(0) as usize {
        // SAFETY: the library returned `count` NUL terminated strings.
        unsafe {
            let name = *projects.add(i);
            if !name.is_null() {
                names.push(CStr::from_ptr(name).to_string_lossy().into_owned());
                libc::free(name.cast());
            }
        }
    }
    // SAFETY: allocated by the library with malloc.
    unsafe { libc::free(projects.cast()) };
    Ok(names)
}

#[async_trait]
impl ApiKeyStore for NativeRonDb {
    async fn find_api_key(&self, prefix: &str) -> Result<Option<ApiKeyRecord>> {
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || lookup_api_key(&prefix)).await?
    }

    async fn find_all_projects(&self, user_id: i32) -> Result<Vec<String>> {
        tokio::task::spawn_blocking(move || lookup_projects(user_id)).await?
    }
}
