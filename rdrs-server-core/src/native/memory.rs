//! In-process RonDB stand-in. Speaks the same buffer layout as the native
//! library so the whole dispatch path runs without a cluster.

use super::encoding::{DecodedPkRequest, ResponseColumn, decode_pk_request, encode_pk_response};
use super::*;
use crate::error::{STATUS_BAD_REQUEST, STATUS_INTERNAL_SERVER_ERROR, STATUS_NOT_FOUND};
use anyhow::{Result, anyhow};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, RwLock};

const ERR_NO_TABLE: &str = "Database/Table does not exist.";
const ERR_NO_COLUMN: &str = "Column does not exist.";
const ERR_PK_COUNT: &str = "Wrong number of primary-key columns.";
const ERR_PK_COLUMN: &str = "Wrong primay-key column.";
const ERR_DATA_TYPE: &str = "Wrong data type.";
const ERR_NOT_OPEN: &str = "RonDB connection is not open.";
const ERR_NOT_FOUND: &str = "Not Found";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Int,
    Bigint,
    Float,
    Double,
    Varchar,
    Date,
    Datetime,
    Varbinary,
    Bit,
}

impl ColumnType {
    fn data_type(self) -> u32 {
        match self {
            Self::Int | Self::Bigint => RDRS_INTEGER_DATATYPE,
            Self::Float | Self::Double => RDRS_FLOAT_DATATYPE,
            Self::Varchar => RDRS_STRING_DATATYPE,
            Self::Date | Self::Datetime => RDRS_DATETIME_DATATYPE,
            Self::Varbinary => RDRS_BINARY_DATATYPE,
            Self::Bit => RDRS_BIT_DATATYPE,
        }
    }

    fn is_integer(self) -> bool {
        matches!(self, Self::Int | Self::Bigint)
    }

    fn sql_name(self) -> &'static str {
        match self {
            Self::Int => "INT",
            Self::Bigint => "BIGINT",
            Self::Float => "FLOAT",
            Self::Double => "DOUBLE",
            Self::Varchar => "VARCHAR",
            Self::Date => "DATE",
            Self::Datetime => "DATETIME",
            Self::Varbinary => "VARBINARY",
            Self::Bit => "BIT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub primary_key: bool,
}

/// Table definition with optional seed rows, as found in the catalog file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDef {
    pub db: String,
    pub table: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub rows: Vec<BTreeMap<String, serde_json::Value>>,
}

struct MemoryTable {
    columns: Vec<ColumnDef>,
    rows: FxHashMap<Vec<String>, BTreeMap<String, Option<String>>>,
}

impl MemoryTable {
    fn primary_keys(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| c.primary_key)
    }

    fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

fn text_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Normalises a key value so `7`, `"7"` and `07` address the same integer row.
fn key_value(column: &ColumnDef, raw: &str) -> std::result::Result<String, NativeStatus> {
    if column.column_type.is_integer() {
        raw.trim().parse::<i64>().map(|v| v.to_string()).map_err(|_| {
            NativeStatus::new(
                STATUS_BAD_REQUEST,
                format!(
                    "{} Expecting {}. Column: {}",
                    ERR_DATA_TYPE,
                    column.column_type.sql_name(),
                    column.name
                ),
            )
        })
    } else {
        Ok(raw.to_string())
    }
}

struct Counters {
    stats: RonDbStats,
}

pub struct MemoryRonDb {
    tables: RwLock<FxHashMap<(String, String), MemoryTable>>,
    counters: Mutex<Counters>,
}

impl Default for MemoryRonDb {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRonDb {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(FxHashMap::default()),
            counters: Mutex::new(Counters {
                stats: RonDbStats {
                    connection_state: ConnectionState::Connected,
                    ..Default::default()
                },
            }),
        }
    }

    pub fn from_tables(defs: &[TableDef]) -> Result<Self> {
        let db = Self::new();
        for def in defs {
            db.create_table(&def.db, &def.table, def.columns.clone())?;
            for row in &def.rows {
                db.insert_row(&def.db, &def.table, row)?;
            }
        }
        Ok(db)
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_table(&self, db: &str, table: &str, columns: Vec<ColumnDef>) -> Result<()> {
        if !columns.iter().any(|c| c.primary_key) {
            return Err(anyhow!("table {}.{} has no primary key", db, table));
        }
        let mut tables = self
            .tables
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tables.insert(
            (db.to_string(), table.to_string()),
            MemoryTable {
                columns,
                rows: FxHashMap::default(),
            },
        );
        Ok(())
    }

    pub fn insert_row(
        &self,
        db: &str,
        table: &str,
        row: &BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        let mut tables = self
            .tables
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let t = tables
            .get_mut(&(db.to_string(), table.to_string()))
            .ok_or_else(|| anyhow!("table {}.{} does not exist", db, table))?;
        let mut key = Vec::new();
        for pk in t.primary_keys() {
            let value = row
                .get(&pk.name)
                .and_then(text_value)
                .ok_or_else(|| anyhow!("row for {}.{} is missing key {}", db, table, pk.name))?;
            key.push(key_value(pk, &value).map_err(|status| anyhow!(status.message))?);
        }
        let values = t
            .columns
            .iter()
            .filter(|c| !c.primary_key)
            .map(|c| (c.name.clone(), row.get(&c.name).and_then(text_value)))
            .collect();
        t.rows.insert(key, values);
        Ok(())
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        self.counters().stats.connection_state = state;
    }

    fn check_open(&self) -> std::result::Result<(), NativeStatus> {
        let counters = self.counters();
        if counters.stats.connection_state != ConnectionState::Connected
            || counters.stats.is_shutdown
        {
            return Err(
                NativeStatus::new(STATUS_INTERNAL_SERVER_ERROR, ERR_NOT_OPEN)
                    .with_location(file!(), line!() as i32),
            );
        }
        Ok(())
    }

    /// Borrows an Ndb object for the duration of one call, growing the object pool if needed.
    fn with_ndb_object<T>(&self, f: impl FnOnce() -> T) -> T {
        {
            let mut counters = self.counters();
            let stats = &mut counters.stats;
            if stats.ndb_objects_available == 0 {
                stats.ndb_objects_created += 1;
                stats.ndb_objects_count += 1;
            } else {
                stats.ndb_objects_available -= 1;
            }
        }
        let out = f();
        self.counters().stats.ndb_objects_available += 1;
        out
    }

    fn read_row(
        &self,
        request: &DecodedPkRequest,
    ) -> std::result::Result<(u16, Vec<ResponseColumn>), NativeStatus> {
        let tables = self
            .tables
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let table = tables
            .get(&(request.db.clone(), request.table.clone()))
            .ok_or_else(|| {
                NativeStatus::new(
                    STATUS_NOT_FOUND,
                    format!(
                        "{} Database: {} Table: {}",
                        ERR_NO_TABLE, request.db, request.table
                    ),
                )
            })?;

        let pk_count = table.primary_keys().count();
        if request.filters.len() != pk_count {
            return Err(NativeStatus::new(
                STATUS_BAD_REQUEST,
                format!(
                    "{} Expecting: {} Got: {}",
                    ERR_PK_COUNT,
                    pk_count,
                    request.filters.len()
                ),
            ));
        }

        let mut supplied: FxHashMap<&str, String> = FxHashMap::default();
        for (name, value) in &request.filters {
            let column = table
                .column(name)
                .filter(|c| c.primary_key)
                .ok_or_else(|| {
                    NativeStatus::new(
                        STATUS_BAD_REQUEST,
                        format!("{} Column: {}", ERR_PK_COLUMN, name),
                    )
                })?;
            let raw = String::from_utf8_lossy(value);
            supplied.insert(name.as_str(), key_value(column, &raw)?);
        }
        let mut key = Vec::with_capacity(pk_count);
        for pk in table.primary_keys() {
            match supplied.remove(pk.name.as_str()) {
                Some(value) => key.push(value),
                None => {
                    return Err(NativeStatus::new(
                        STATUS_BAD_REQUEST,
                        format!("{} Column: {}", ERR_PK_COLUMN, pk.name),
                    ));
                }
            }
        }

        let wanted: Vec<&ColumnDef> = match &request.read_columns {
            Some(read_columns) => {
                let mut wanted = Vec::with_capacity(read_columns.len());
                for (_, name) in read_columns {
                    let column = table
                        .column(name)
                        .filter(|c| !c.primary_key)
                        .ok_or_else(|| {
                            NativeStatus::new(
                                STATUS_BAD_REQUEST,
                                format!("{} Column: {}", ERR_NO_COLUMN, name),
                            )
                        })?;
                    wanted.push(column);
                }
                wanted
            }
            None => table.columns.iter().filter(|c| !c.primary_key).collect(),
        };

        let Some(row) = table.rows.get(&key) else {
            return Ok((STATUS_NOT_FOUND, Vec::new()));
        };
        let columns = wanted
            .into_iter()
            .map(|c| ResponseColumn {
                name: c.name.clone(),
                value: row.get(&c.name).cloned().flatten(),
                data_type: c.column_type.data_type(),
            })
            .collect();
        Ok((STATUS_OK, columns))
    }

    fn execute(&self, request: &NativeBuffer, response: &mut NativeBuffer) -> NativeStatus {
        let decoded = match decode_pk_request(request) {
            Ok(decoded) => decoded,
            Err(err) => return NativeStatus::new(STATUS_BAD_REQUEST, format!("{:#}", err)),
        };
        let (status, columns) = match self.read_row(&decoded) {
            Ok(found) => found,
            Err(status) => return status,
        };
        match encode_pk_response(response, status, &decoded, &columns) {
            // A single read reports a miss in the call status as well, after
            // the response buffer has been written.
            Ok(()) if status == STATUS_NOT_FOUND => {
                NativeStatus::new(STATUS_NOT_FOUND, ERR_NOT_FOUND)
            }
            Ok(()) => NativeStatus::ok(),
            Err(err) => NativeStatus::new(STATUS_INTERNAL_SERVER_ERROR, format!("{:#}", err))
                .with_location(file!(), line!() as i32),
        }
    }

    /// Batch sub-operations that fail validation still get a response buffer
    /// carrying their status.
    fn execute_sub_op(&self, request: &NativeBuffer, response: &mut NativeBuffer) -> NativeStatus {
        let decoded = match decode_pk_request(request) {
            Ok(decoded) => decoded,
            Err(err) => return NativeStatus::new(STATUS_BAD_REQUEST, format!("{:#}", err)),
        };
        let (status, columns) = match self.read_row(&decoded) {
            Ok(found) => found,
            Err(status) => (status.http_code, Vec::new()),
        };
        match encode_pk_response(response, status, &decoded, &columns) {
            Ok(()) => NativeStatus::ok(),
            Err(err) => NativeStatus::new(STATUS_INTERNAL_SERVER_ERROR, format!("{:#}", err))
                .with_location(file!(), line!() as i32),
        }
    }
}

impl RonDbClient for MemoryRonDb {
    fn pk_read(&self, request: &mut NativeBuffer, response: &mut NativeBuffer) -> NativeStatus {
        if let Err(status) = self.check_open() {
            return status;
        }
        self.with_ndb_object(|| self.execute(request, response))
    }

    fn pk_batch_read(
        &self,
        requests: &mut [&mut NativeBuffer],
        responses: &mut [&mut NativeBuffer],
    ) -> NativeStatus {
        if let Err(status) = self.check_open() {
            return status;
        }
        if requests.len() != responses.len() {
            return NativeStatus::new(
                STATUS_INTERNAL_SERVER_ERROR,
                "request and response buffer counts differ",
            )
            .with_location(file!(), line!() as i32);
        }
        self.with_ndb_object(|| {
            for (request, response) in requests.iter().zip(responses.iter_mut()) {
                let status = self.execute_sub_op(request, response);
                if !status.is_ok() {
                    return status;
                }
            }
            NativeStatus::ok()
        })
    }

    fn stats(&self) -> Result<RonDbStats> {
        Ok(self.counters().stats)
    }

    fn shutdown(&self) -> Result<()> {
        let mut counters = self.counters();
        counters.stats.is_shutdown = true;
        counters.stats.connection_state = ConnectionState::Disconnected;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;
    use crate::model::{Filter, PkReadParams, ReadColumn, raw_json};
    use serde_json::json;
    use std::sync::Arc;

    /// `db001.table_1 (id0 INT pk, col0 VARCHAR, col1 INT)` with rows id0 = 0..10.
    pub(crate) fn sample_db() -> MemoryRonDb {
        let db = MemoryRonDb::new();
        db.create_table(
            "db001",
            "table_1",
            vec![
                ColumnDef {
                    name: "id0".to_string(),
                    column_type: ColumnType::Int,
                    primary_key: true,
                },
                ColumnDef {
                    name: "col0".to_string(),
                    column_type: ColumnType::Varchar,
                    primary_key: false,
                },
                ColumnDef {
                    name: "col1".to_string(),
                    column_type: ColumnType::Int,
                    primary_key: false,
                },
            ],
        )
        .unwrap();
        for i in 0..10 {
            let row = json!({"id0": i, "col0": format!("hello_{}", i), "col1": i * 10});
            let row: BTreeMap<String, serde_json::Value> = serde_json::from_value(row).unwrap();
            db.insert_row("db001", "table_1", &row).unwrap();
        }
        db
    }

    pub(crate) fn read(id: &str, columns: &[&str], op: Option<&str>) -> PkReadParams {
        PkReadParams {
            db: "db001".to_string(),
            table: "table_1".to_string(),
            filters: vec![Filter {
                column: "id0".to_string(),
                value: raw_json(id),
            }],
            read_columns: if columns.is_empty() {
                None
            } else {
                Some(
                    columns
                        .iter()
                        .map(|c| ReadColumn {
                            column: c.to_string(),
                            data_return_type: None,
                        })
                        .collect(),
                )
            },
            operation_id: op.map(str::to_string),
        }
    }

    fn dispatch(db: MemoryRonDb) -> NativeDispatch {
        NativeDispatch::new(BufferPool::new(1024, 2).unwrap(), Arc::new(db))
    }

    #[test]
    fn reads_existing_row() -> Result<()> {
        let dispatch = dispatch(sample_db());
        let result = dispatch.pk_read(&read("7", &["col0"], Some("op")))?;
        assert_eq!(result.code, 200);
        assert_eq!(result.body.operation_id.as_deref(), Some("op"));
        assert_eq!(result.body.data.len(), 1);
        assert_eq!(result.body.data["col0"].as_ref().unwrap().get(), "\"hello_7\"");
        Ok(())
    }

    #[test]
    fn string_key_addresses_integer_row() -> Result<()> {
        let dispatch = dispatch(sample_db());
        let result = dispatch.pk_read(&read("\"3\"", &[], None))?;
        assert_eq!(result.code, 200);
        assert_eq!(result.body.data["col1"].as_ref().unwrap().get(), "30");
        Ok(())
    }

    #[test]
    fn missing_row_is_not_found() -> Result<()> {
        let dispatch = dispatch(sample_db());
        let result = dispatch.pk_read(&read("999", &["col0"], Some("miss")))?;
        assert_eq!(result.code, 404);
        assert!(result.body.data.is_empty());
        assert_eq!(result.body.operation_id.as_deref(), Some("miss"));
        Ok(())
    }

    #[test]
    fn single_miss_is_a_native_not_found_with_written_response() -> Result<()> {
        let db = sample_db();
        let pool = BufferPool::new(1024, 2)?;
        let mut request = pool.acquire()?;
        let mut response = pool.acquire()?;
        encode_pk_request(&read("999", &["col0"], Some("miss")), &mut request)?;
        let status = db.pk_read(&mut request, &mut response);
        assert_eq!(status.http_code, 404);
        let (code, body) = decode_pk_response(&response)?;
        assert_eq!(code, 404);
        assert_eq!(body.operation_id.as_deref(), Some("miss"));

        let result = dispatch(db).pk_read(&read("999", &["col0"], Some("miss")))?;
        assert_eq!(result.code, 404);
        assert!(result.message.is_none());
        assert_eq!(result.body.operation_id.as_deref(), Some("miss"));
        Ok(())
    }

    #[test]
    fn unknown_table_keeps_its_message() -> Result<()> {
        let mut params = read("1", &[], Some("op"));
        params.table = "no_table".to_string();
        let result = dispatch(sample_db()).pk_read(&params)?;
        assert_eq!(result.code, 404);
        assert!(
            result
                .message
                .unwrap()
                .starts_with("Database/Table does not exist.")
        );
        Ok(())
    }

    #[test]
    fn unknown_column_and_bad_type_are_client_errors() -> Result<()> {
        let dispatch = dispatch(sample_db());
        let result = dispatch.pk_read(&read("1", &["nope"], None))?;
        assert_eq!(result.code, 400);
        assert_eq!(result.message.as_deref(), Some("Column does not exist. Column: nope"));

        let result = dispatch.pk_read(&read("\"abc\"", &[], None))?;
        assert_eq!(result.code, 400);
        assert_eq!(
            result.message.as_deref(),
            Some("Wrong data type. Expecting INT. Column: id0")
        );
        Ok(())
    }

    #[test]
    fn closed_connection_is_server_error() -> Result<()> {
        let db = sample_db();
        db.set_connection_state(ConnectionState::Disconnected);
        let dispatch = dispatch(db);
        let result = dispatch.pk_read(&read("1", &[], None))?;
        assert_eq!(result.code, 500);
        assert!(
            result
                .message
                .unwrap()
                .starts_with("RonDB connection is not open.; File:")
        );
        Ok(())
    }

    #[test]
    fn batch_keeps_per_row_status() -> Result<()> {
        let dispatch = dispatch(sample_db());
        let results = dispatch.pk_batch_read(&[
            read("1", &["col0"], Some("a")),
            read("999", &["col0"], Some("b")),
            read("2", &["missing_col"], Some("c")),
        ])?;
        let codes: Vec<u16> = results.iter().map(|r| r.code).collect();
        assert_eq!(codes, vec![200, 404, 400]);
        assert_eq!(results[1].body.operation_id.as_deref(), Some("b"));
        Ok(())
    }

    #[test]
    fn ndb_objects_are_reused() -> Result<()> {
        let dispatch = dispatch(sample_db());
        dispatch.pk_read(&read("1", &[], None))?;
        dispatch.pk_read(&read("2", &[], None))?;
        let stats = dispatch.rondb_stats()?;
        assert_eq!(stats.ndb_objects_created, 1);
        assert_eq!(stats.ndb_objects_available, 1);
        assert_eq!(stats.connection_state, ConnectionState::Connected);
        Ok(())
    }
}
