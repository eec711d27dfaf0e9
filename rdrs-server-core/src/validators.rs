use crate::model::{DRT_BASE64, DRT_DEFAULT, PkReadParams};
use anyhow::{Result, anyhow};
use rustc_hash::FxHashSet;

pub const MAX_IDENTIFIER_LEN: usize = 64;

/// MySQL identifier rules: 1 to 64 characters from U+0001..U+007F or U+0080..U+0FFF.
pub fn validate_db_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty() {
        return Err(anyhow!("identifier is empty"));
    }
    if identifier.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(anyhow!("identifier is too large: {}", identifier));
    }
    if let Some(bad) = identifier
        .chars()
        .find(|c| !matches!(*c as u32, 0x0001..=0x0FFF))
    {
        return Err(anyhow!(
            "identifier carries an invalid character 'U+{:04X}'",
            bad as u32
        ));
    }
    Ok(())
}

pub fn validate_operation_id(operation_id: Option<&str>, max_size: u32) -> Result<()> {
    match operation_id {
        Some("") => Err(anyhow!("field validation for 'OperationID' failed on the 'min' tag")),
        Some(id) if id.chars().count() > max_size as usize => {
            Err(anyhow!("max allowed length is {}", max_size))
        }
        _ => Ok(()),
    }
}

pub fn validate_pk_read(params: &PkReadParams, operation_id_max_size: u32) -> Result<()> {
    validate_db_identifier(&params.db)
        .map_err(|err| anyhow!("db name is invalid; error: {}", err))?;
    validate_db_identifier(&params.table)
        .map_err(|err| anyhow!("table name is invalid; error: {}", err))?;

    if params.filters.is_empty() {
        return Err(anyhow!("field validation for 'Filters' failed on the 'min' tag"));
    }
    let mut filter_columns = FxHashSet::default();
    for filter in &params.filters {
        validate_db_identifier(&filter.column)
            .map_err(|err| anyhow!("filter column name is invalid; error: {}", err))?;
        if !filter_columns.insert(filter.column.as_str()) {
            return Err(anyhow!("field validation for filter failed on the 'unique' tag"));
        }
    }

    if let Some(read_columns) = &params.read_columns {
        let mut seen = FxHashSet::default();
        for column in read_columns {
            validate_db_identifier(&column.column)
                .map_err(|err| anyhow!("read column name is invalid; error: {}", err))?;
            if filter_columns.contains(column.column.as_str()) {
                return Err(anyhow!(
                    "field validation for read columns failed. '{}' already included in filter",
                    column.column
                ));
            }
            if !seen.insert(column.column.as_str()) {
                return Err(anyhow!(
                    "field validation for 'ReadColumns' failed on the 'unique' tag"
                ));
            }
            match column.data_return_type.as_deref() {
                None | Some(DRT_DEFAULT) | Some(DRT_BASE64) => {}
                Some(_) => {
                    return Err(anyhow!(
                        "field validation for 'DataReturnType' failed on the 'oneof' tag"
                    ));
                }
            }
        }
    }

    validate_operation_id(params.operation_id.as_deref(), operation_id_max_size)
}
