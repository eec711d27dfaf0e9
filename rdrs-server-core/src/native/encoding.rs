//! Primary key read request/response buffer layout shared with the native library.
//!
//! Request:
//! ```text
//! [op type][capacity][length][db off][table off][pk off][read cols off][op id off]  (32 bytes)
//! db\0 table\0
//! [count][tuple off]...  each tuple: [key off][value off] key\0 [len:2B] value\0
//! [count][col off]...    each col:   [return type] name\0
//! op_id\0
//! ```
//! Response:
//! ```text
//! [op type][status][capacity][length][db off][table off][cols off][op id off]  (32 bytes)
//! [count] then per column [name off][value off][is null][data type]
//! ```

use super::*;
use crate::error::RdrsError;
use crate::model::{DRT_DEFAULT, PkReadParams, PkReadResponse, raw_json};
use anyhow::Result;
use std::collections::BTreeMap;

const BUFFER_OVERFLOW: &str = "trying to write more data than the buffer capacity";

fn align_word(head: u32) -> u32 {
    let rem = head % ADDRESS_SIZE;
    if rem != 0 { head + (ADDRESS_SIZE - rem) } else { head }
}

struct Writer<'a> {
    bytes: &'a mut [u8],
}

impl Writer<'_> {
    fn capacity(&self) -> u32 {
        self.bytes.len() as u32
    }

    fn put_u32(&mut self, offset: u32, value: u32) -> Result<()> {
        let start = offset as usize;
        let slot = self
            .bytes
            .get_mut(start..start + 4)
            .ok_or_else(|| RdrsError::bad_request(BUFFER_OVERFLOW))?;
        slot.copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    fn put_word(&mut self, index: usize, value: u32) -> Result<()> {
        self.put_u32(index as u32 * ADDRESS_SIZE, value)
    }

    /// Writes a NUL terminated string and returns the next free offset.
    fn put_cstr(&mut self, offset: u32, src: &[u8]) -> Result<u32> {
        let end = offset as usize + src.len();
        if end + 1 > self.bytes.len() {
            return Err(RdrsError::bad_request(BUFFER_OVERFLOW).into());
        }
        self.bytes[offset as usize..end].copy_from_slice(src);
        self.bytes[end] = 0;
        Ok(end as u32 + 1)
    }

    /// Two byte little endian length prefix followed by the NUL terminated bytes.
    fn put_ndb_str(&mut self, offset: u32, src: &[u8]) -> Result<u32> {
        if offset as usize + src.len() + 1 + 2 > self.bytes.len() || src.len() > u16::MAX as usize
        {
            return Err(RdrsError::bad_request(BUFFER_OVERFLOW).into());
        }
        let start = offset as usize;
        self.bytes[start] = (src.len() % 256) as u8;
        self.bytes[start + 1] = (src.len() / 256) as u8;
        self.put_cstr(offset + 2, src)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl Reader<'_> {
    fn corrupt(what: &str) -> anyhow::Error {
        RdrsError::internal(format!("response buffer may be corrupt. {}", what)).into()
    }

    fn u32_at(&self, offset: u32) -> Result<u32> {
        let start = offset as usize;
        let slot = self
            .bytes
            .get(start..start + 4)
            .ok_or_else(|| Self::corrupt("Offset out of bounds"))?;
        let mut word = [0u8; 4];
        word.copy_from_slice(slot);
        Ok(u32::from_ne_bytes(word))
    }

    fn word(&self, index: usize) -> Result<u32> {
        self.u32_at(index as u32 * ADDRESS_SIZE)
    }

    fn cstr_at(&self, offset: u32) -> Result<String> {
        let tail = self
            .bytes
            .get(offset as usize..)
            .ok_or_else(|| Self::corrupt("String offset out of bounds"))?;
        let len = tail
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Self::corrupt("Unterminated string"))?;
        String::from_utf8(tail[..len].to_vec()).map_err(|_| Self::corrupt("Invalid UTF-8"))
    }

    fn ndb_str_at(&self, offset: u32) -> Result<Vec<u8>> {
        let start = offset as usize;
        let prefix = self
            .bytes
            .get(start..start + 2)
            .ok_or_else(|| Self::corrupt("Value offset out of bounds"))?;
        let len = prefix[0] as usize + prefix[1] as usize * 256;
        self.bytes
            .get(start + 2..start + 2 + len)
            .map(|value| value.to_vec())
            .ok_or_else(|| Self::corrupt("Value out of bounds"))
    }
}

pub fn data_return_type(drt: Option<&str>) -> Result<u32> {
    match drt {
        None | Some(DRT_DEFAULT) => Ok(DEFAULT_DRT),
        Some(other) => Err(RdrsError::bad_request(format!(
            "return data type is not supported. Data type: {}",
            other
        ))
        .into()),
    }
}

/// JSON strings travel unquoted, every other JSON literal travels verbatim.
fn filter_value_bytes(raw: &str) -> Result<Vec<u8>> {
    let trimmed = raw.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        let unquoted: String = serde_json::from_str(trimmed).map_err(|err| {
            RdrsError::bad_request(format!("failed to unquote string. Error: {}", err))
        })?;
        Ok(unquoted.into_bytes())
    } else {
        Ok(trimmed.as_bytes().to_vec())
    }
}

pub fn encode_pk_request(params: &PkReadParams, buffer: &mut NativeBuffer) -> Result<()> {
    let mut w = Writer {
        bytes: buffer.as_bytes_mut(),
    };
    let mut head = PK_REQ_HEADER_END;

    let db_offset = head;
    head = w.put_cstr(head, params.db.as_bytes())?;
    let table_offset = head;
    head = w.put_cstr(head, params.table.as_bytes())?;

    head = align_word(head);
    let pk_offset = head;
    w.put_u32(head, params.filters.len() as u32)?;
    head += ADDRESS_SIZE;
    let mut kv_slot = head;
    head += params.filters.len() as u32 * ADDRESS_SIZE;
    for filter in &params.filters {
        head = align_word(head);
        let tuple_offset = head;
        head += 2 * ADDRESS_SIZE;
        let key_offset = head;
        head = w.put_cstr(head, filter.column.as_bytes())?;
        let value_offset = head;
        head = w.put_ndb_str(head, &filter_value_bytes(filter.value.get())?)?;
        w.put_u32(kv_slot, tuple_offset)?;
        kv_slot += ADDRESS_SIZE;
        w.put_u32(tuple_offset, key_offset)?;
        w.put_u32(tuple_offset + ADDRESS_SIZE, value_offset)?;
    }

    head = align_word(head);
    let mut read_cols_offset = 0;
    if let Some(read_columns) = &params.read_columns {
        read_cols_offset = head;
        w.put_u32(head, read_columns.len() as u32)?;
        head += ADDRESS_SIZE;
        let mut col_slot = head;
        head += read_columns.len() as u32 * ADDRESS_SIZE;
        for column in read_columns {
            head = align_word(head);
            w.put_u32(col_slot, head)?;
            col_slot += ADDRESS_SIZE;
            let drt = data_return_type(column.data_return_type.as_deref())?;
            w.put_u32(head, drt)?;
            head += ADDRESS_SIZE;
            head = w.put_cstr(head, column.column.as_bytes())?;
        }
    }

    let mut op_id_offset = 0;
    if let Some(operation_id) = &params.operation_id {
        op_id_offset = head;
        head = w.put_cstr(head, operation_id.as_bytes())?;
    }

    let capacity = w.capacity();
    w.put_word(PK_REQ_OP_TYPE_IDX, RDRS_PK_REQ_ID)?;
    w.put_word(PK_REQ_CAPACITY_IDX, capacity)?;
    w.put_word(PK_REQ_LENGTH_IDX, head)?;
    w.put_word(PK_REQ_DB_IDX, db_offset)?;
    w.put_word(PK_REQ_TABLE_IDX, table_offset)?;
    w.put_word(PK_REQ_PK_COLS_IDX, pk_offset)?;
    w.put_word(PK_REQ_READ_COLS_IDX, read_cols_offset)?;
    w.put_word(PK_REQ_OP_ID_IDX, op_id_offset)?;
    Ok(())
}

/// Converts a native column value into JSON. Numbers stay raw, everything
/// else becomes a JSON string.
fn column_json(data_type: u32, value: &str) -> crate::model::RawJson {
    if data_type == RDRS_INTEGER_DATATYPE || data_type == RDRS_FLOAT_DATATYPE {
        raw_json(value)
    } else {
        raw_json(serde_json::Value::String(value.to_string()).to_string())
    }
}

pub fn decode_pk_response(buffer: &NativeBuffer) -> Result<(u16, PkReadResponse)> {
    let r = Reader {
        bytes: buffer.as_bytes(),
    };
    if r.word(PK_RESP_OP_TYPE_IDX)? != RDRS_PK_RESP_ID {
        return Err(RdrsError::internal("wrong response type").into());
    }
    let capacity = r.word(PK_RESP_CAPACITY_IDX)?;
    let length = r.word(PK_RESP_LENGTH_IDX)?;
    if buffer.size() != capacity || length >= capacity {
        return Err(RdrsError::internal(format!(
            "response buffer may be corrupt. Buffer capacity: {}, Buffer data length: {}",
            capacity, length
        ))
        .into());
    }

    let mut response = PkReadResponse::default();
    let op_id_offset = r.word(PK_RESP_OP_ID_IDX)?;
    if op_id_offset != 0 {
        response.operation_id = Some(r.cstr_at(op_id_offset)?);
    }

    let status = r.word(PK_RESP_OP_STATUS_IDX)?;
    let status = u16::try_from(status)
        .map_err(|_| RdrsError::internal(format!("invalid response status {}", status)))?;
    if status == crate::error::STATUS_OK {
        let cols_offset = r.word(PK_RESP_COLS_IDX)?;
        let count = r.u32_at(cols_offset)?;
        let mut data = BTreeMap::new();
        for i in 0..count {
            let header = cols_offset + ADDRESS_SIZE + i * 4 * ADDRESS_SIZE;
            let name = r.cstr_at(r.u32_at(header)?)?;
            let value_offset = r.u32_at(header + ADDRESS_SIZE)?;
            let is_null = r.u32_at(header + 2 * ADDRESS_SIZE)?;
            let data_type = r.u32_at(header + 3 * ADDRESS_SIZE)?;
            let value = if is_null == 0 {
                Some(column_json(data_type, &r.cstr_at(value_offset)?))
            } else {
                None
            };
            data.insert(name, value);
        }
        response.data = data;
    }
    Ok((status, response))
}

/// Request as seen by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DecodedPkRequest {
    pub db: String,
    pub table: String,
    pub filters: Vec<(String, Vec<u8>)>,
    pub read_columns: Option<Vec<(u32, String)>>,
    pub operation_id: Option<String>,
}

pub(crate) fn decode_pk_request(buffer: &NativeBuffer) -> Result<DecodedPkRequest> {
    let r = Reader {
        bytes: buffer.as_bytes(),
    };
    if r.word(PK_REQ_OP_TYPE_IDX)? != RDRS_PK_REQ_ID {
        return Err(RdrsError::internal("wrong request type").into());
    }
    let db = r.cstr_at(r.word(PK_REQ_DB_IDX)?)?;
    let table = r.cstr_at(r.word(PK_REQ_TABLE_IDX)?)?;

    let pk_offset = r.word(PK_REQ_PK_COLS_IDX)?;
    let pk_count = r.u32_at(pk_offset)?;
    let mut filters = Vec::with_capacity(pk_count as usize);
    for i in 0..pk_count {
        let tuple = r.u32_at(pk_offset + ADDRESS_SIZE + i * ADDRESS_SIZE)?;
        let key = r.cstr_at(r.u32_at(tuple)?)?;
        let value = r.ndb_str_at(r.u32_at(tuple + ADDRESS_SIZE)?)?;
        filters.push((key, value));
    }

    let read_cols_offset = r.word(PK_REQ_READ_COLS_IDX)?;
    let read_columns = if read_cols_offset == 0 {
        None
    } else {
        let count = r.u32_at(read_cols_offset)?;
        let mut columns = Vec::with_capacity(count as usize);
        for i in 0..count {
            let col = r.u32_at(read_cols_offset + ADDRESS_SIZE + i * ADDRESS_SIZE)?;
            let drt = r.u32_at(col)?;
            columns.push((drt, r.cstr_at(col + ADDRESS_SIZE)?));
        }
        Some(columns)
    };

    let op_id_offset = r.word(PK_REQ_OP_ID_IDX)?;
    let operation_id = if op_id_offset == 0 {
        None
    } else {
        Some(r.cstr_at(op_id_offset)?)
    };

    Ok(DecodedPkRequest {
        db,
        table,
        filters,
        read_columns,
        operation_id,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResponseColumn {
    pub name: String,
    pub value: Option<String>,
    pub data_type: u32,
}

pub(crate) fn encode_pk_response(
    buffer: &mut NativeBuffer,
    status: u16,
    request: &DecodedPkRequest,
    columns: &[ResponseColumn],
) -> Result<()> {
    let mut w = Writer {
        bytes: buffer.as_bytes_mut(),
    };
    let mut head = PK_RESP_HEADER_END;
    let db_offset = head;
    head = w.put_cstr(head, request.db.as_bytes())?;
    let table_offset = head;
    head = w.put_cstr(head, request.table.as_bytes())?;
    let mut op_id_offset = 0;
    if let Some(operation_id) = &request.operation_id {
        op_id_offset = head;
        head = w.put_cstr(head, operation_id.as_bytes())?;
    }

    head = align_word(head);
    let cols_offset = head;
    w.put_u32(head, columns.len() as u32)?;
    head += ADDRESS_SIZE;
    let mut column_header = head;
    head += columns.len() as u32 * 4 * ADDRESS_SIZE;
    for column in columns {
        let name_offset = head;
        head = w.put_cstr(head, column.name.as_bytes())?;
        let mut value_offset = 0;
        if let Some(value) = &column.value {
            value_offset = head;
            head = w.put_cstr(head, value.as_bytes())?;
        }
        w.put_u32(column_header, name_offset)?;
        w.put_u32(column_header + ADDRESS_SIZE, value_offset)?;
        w.put_u32(column_header + 2 * ADDRESS_SIZE, column.value.is_none() as u32)?;
        w.put_u32(column_header + 3 * ADDRESS_SIZE, column.data_type)?;
        column_header += 4 * ADDRESS_SIZE;
    }
    if head >= w.capacity() {
        return Err(RdrsError::internal("Response buffer overflow.").into());
    }

    let capacity = w.capacity();
    w.put_word(PK_RESP_OP_TYPE_IDX, RDRS_PK_RESP_ID)?;
    w.put_word(PK_RESP_OP_STATUS_IDX, status as u32)?;
    w.put_word(PK_RESP_CAPACITY_IDX, capacity)?;
    w.put_word(PK_RESP_LENGTH_IDX, head)?;
    w.put_word(PK_RESP_DB_IDX, db_offset)?;
    w.put_word(PK_RESP_TABLE_IDX, table_offset)?;
    w.put_word(PK_RESP_COLS_IDX, cols_offset)?;
    w.put_word(PK_RESP_OP_ID_IDX, op_id_offset)?;
    Ok(())
}
