//! Turns a feature vector lookup into primary key reads and stitches the
//! answers back into one positional vector.

use crate::error::{FeatureStoreError, FsErrorCode, STATUS_BAD_REQUEST, STATUS_NOT_FOUND};
use crate::feature_store::avro::decode_complex_feature;
use crate::feature_store::metadata::FeatureViewMetadata;
use crate::model::{FeatureStatus, Filter, PkReadParams, PkReadResult, RawJson, ReadColumn};
use std::collections::BTreeMap;

pub type Entries = BTreeMap<String, RawJson>;

const WRONG_DATA_TYPE: &str = "Wrong data type.";
const WRONG_PK_COUNT: &str = "Wrong number of primary-key columns.";
const WRONG_PK_COLUMN: &str = "Wrong primay-key column.";
const NO_SUCH_COLUMN: &str = "Column does not exist.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JsonKind {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

impl JsonKind {
    fn of(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(_) => Self::Boolean,
            serde_json::Value::Number(_) => Self::Number,
            serde_json::Value::String(_) => Self::String,
            serde_json::Value::Array(_) => Self::Array,
            serde_json::Value::Object(_) => Self::Object,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// JSON kinds accepted for an offline type such as `bigint` or `array<int>`.
fn expected_kinds(feature_type: &str) -> &'static [JsonKind] {
    let base = feature_type
        .split(['<', '('])
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match base.as_str() {
        "boolean" => &[JsonKind::Boolean],
        "tinyint" | "int" | "smallint" | "bigint" | "float" | "double" | "decimal" => {
            &[JsonKind::Number]
        }
        "date" | "string" | "binary" | "timestamp" => &[JsonKind::String],
        _ => &[JsonKind::Array, JsonKind::Object],
    }
}

/// Null is accepted for every type.
pub fn validate_feature_type(value: &RawJson, feature_type: &str) -> Result<(), FeatureStoreError> {
    let parsed: serde_json::Value = serde_json::from_str(value.get()).map_err(|err| {
        FeatureStoreError::with_message(
            FsErrorCode::IncorrectFeatureValue,
            format!(
                "Provided value {} is not in correct JSON format. {}",
                value.get(),
                err
            ),
        )
    })?;
    let got = JsonKind::of(&parsed);
    let expected = expected_kinds(feature_type);
    if got == JsonKind::Null || expected.contains(&got) {
        return Ok(());
    }
    Err(FeatureStoreError::with_message(
        FsErrorCode::WrongDataType,
        format!(
            "Got: '{}', expected: '{}' (offline type: {})",
            got.name(),
            expected[0].name(),
            feature_type
        ),
    ))
}

/// Entries must name exactly the primary keys of the view, either by prefixed
/// or by bare column name.
pub fn validate_primary_keys(
    entries: &Entries,
    metadata: &FeatureViewMetadata,
) -> Result<(), FeatureStoreError> {
    if entries.is_empty() {
        return Err(FeatureStoreError::new(FsErrorCode::NoPrimaryKeyGiven));
    }
    for name in entries.keys() {
        if metadata.primary_key_for_entry(name).is_none() {
            return Err(FeatureStoreError::with_message(
                FsErrorCode::IncorrectPrimaryKey,
                format!(
                    "Provided primary key `{}` does not belong to the set of primary keys.",
                    name
                ),
            ));
        }
    }
    for (prefixed, pk) in &metadata.primary_keys {
        if !entries.contains_key(prefixed) && !entries.contains_key(&pk.name) {
            return Err(FeatureStoreError::with_message(
                FsErrorCode::IncorrectPrimaryKey,
                format!("Primary key `{}` is missing.", prefixed),
            ));
        }
    }
    Ok(())
}

pub fn validate_passed_features(
    passed_features: &Entries,
    metadata: &FeatureViewMetadata,
) -> Result<(), FeatureStoreError> {
    for (name, value) in passed_features {
        let feature = metadata
            .passed_feature_slot(name)
            .and_then(|_| metadata.prefix_features_lookup.get(name))
            .ok_or_else(|| {
                FeatureStoreError::with_message(
                    FsErrorCode::FeatureNotExist,
                    format!("Feature `{}` does not exist.", name),
                )
            })?;
        validate_feature_type(value, &feature.feature_type)?;
    }
    Ok(())
}

/// One read per feature group.
#[derive(Debug, Clone)]
pub struct PlannedRead {
    pub group: usize,
    pub params: PkReadParams,
}

/// Builds the reads for one row of entries. `operation_prefix` lets batch
/// requests tag reads with their row number.
pub fn plan_reads(
    metadata: &FeatureViewMetadata,
    entries: &Entries,
    operation_prefix: &str,
) -> Vec<PlannedRead> {
    metadata
        .feature_groups
        .iter()
        .enumerate()
        .filter(|(_, group)| !group.features.is_empty())
        .map(|(index, group)| {
            let filters = group
                .primary_keys
                .iter()
                .filter_map(|pk| {
                    entries
                        .get(&pk.prefixed_name())
                        .or_else(|| entries.get(&pk.name))
                        .map(|value| Filter {
                            column: pk.name.clone(),
                            value: value.clone(),
                        })
                })
                .collect();
            let read_columns = group
                .features
                .iter()
                .map(|feature| ReadColumn {
                    column: feature.name.clone(),
                    data_return_type: None,
                })
                .collect();
            PlannedRead {
                group: index,
                params: PkReadParams {
                    db: group.feature_store_name.clone(),
                    table: group.table_name(),
                    filters,
                    read_columns: Some(read_columns),
                    operation_id: Some(format!("{}{}", operation_prefix, group.operation_id())),
                },
            }
        })
        .collect()
}

fn wrong_data_type_message(message: &str) -> String {
    // "Wrong data type. Expecting INT. Column: id1"
    let rewritten = message
        .split_once("Expecting ")
        .and_then(|(_, rest)| rest.split_once(". Column: "))
        .filter(|(data_type, _)| {
            !data_type.is_empty() && data_type.chars().all(|c| c.is_alphanumeric() || c == '_')
        })
        .map(|(data_type, column)| {
            let column: String = column
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            format!("Primary key '{}' should be in '{}' format.", column, data_type)
        });
    rewritten.unwrap_or_else(|| message.to_string())
}

/// Maps a failed read to a feature store error. `None` means the row is
/// simply treated as missing.
pub fn translate_read_error(code: u16, message: &str) -> Option<FeatureStoreError> {
    if code == STATUS_NOT_FOUND || message.contains(WRONG_PK_COUNT) {
        return None;
    }
    if message.contains(WRONG_DATA_TYPE) {
        return Some(FeatureStoreError::with_message(
            FsErrorCode::WrongDataType,
            wrong_data_type_message(message),
        ));
    }
    if message.contains(WRONG_PK_COLUMN) || message.contains(NO_SUCH_COLUMN) {
        return Some(FeatureStoreError::with_message(
            FsErrorCode::IncorrectPrimaryKey,
            message,
        ));
    }
    if code == STATUS_BAD_REQUEST {
        return Some(FeatureStoreError::with_message(
            FsErrorCode::ReadFromDbFailBadInput,
            message,
        ));
    }
    Some(FeatureStoreError::with_message(
        FsErrorCode::ReadFromDbFail,
        message,
    ))
}

/// Assembles the feature vector of one row from its read results, which
/// must line up with `plan`.
pub fn assemble_row(
    metadata: &FeatureViewMetadata,
    plan: &[PlannedRead],
    results: &[Result<PkReadResult, crate::error::RdrsError>],
    entries: &Entries,
) -> Result<(Vec<Option<RawJson>>, FeatureStatus), FeatureStoreError> {
    let mut features: Vec<Option<RawJson>> = vec![None; metadata.num_of_features];
    let mut status = FeatureStatus::Complete;

    for (read, result) in plan.iter().zip(results) {
        let result = match result {
            Ok(result) => result,
            Err(err) => {
                return Err(translate_read_error(err.status(), err.message()).unwrap_or_else(
                    || FeatureStoreError::with_message(FsErrorCode::ReadFromDbFail, err.message()),
                ));
            }
        };
        if !result.is_ok() {
            let message = result.message.as_deref().unwrap_or_default();
            match translate_read_error(result.code, message) {
                None => status = FeatureStatus::Missing,
                Some(err) => return Err(err),
            }
            continue;
        }
        let group = &metadata.feature_groups[read.group];
        for (column, value) in &result.body.data {
            let Some(slot) =
                metadata.feature_index(&group.feature_store_name, &group.feature_group_name, column)
            else {
                continue;
            };
            features[slot] = match (value, metadata.complex_schema(slot)) {
                (Some(value), Some(schema)) => Some(decode_complex_feature(value, schema)?),
                (value, _) => value.clone(),
            };
        }
    }

    for (name, value) in entries {
        for slot in metadata.join_key_slots(name) {
            features[*slot] = Some(value.clone());
        }
    }
    Ok((features, status))
}

/// Passed features win over whatever the store returned.
pub fn overlay_passed_features(
    features: &mut [Option<RawJson>],
    passed_features: &Entries,
    metadata: &FeatureViewMetadata,
) {
    for (name, value) in passed_features {
        if let Some(slot) = metadata.passed_feature_slot(name) {
            features[slot] = Some(value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RdrsError;
    use crate::feature_store::metadata::tests::{feature, two_group_metadata};
    use crate::model::{PkReadResponse, raw_json};

    fn entries(pairs: &[(&str, &str)]) -> Entries {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), raw_json(*v)))
            .collect()
    }

    fn hit(pairs: &[(&str, &str)]) -> Result<PkReadResult, RdrsError> {
        Ok(PkReadResult {
            code: 200,
            body: PkReadResponse {
                operation_id: None,
                data: pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), Some(raw_json(*v))))
                    .collect(),
            },
            message: None,
        })
    }

    fn failed(code: u16, message: &str) -> Result<PkReadResult, RdrsError> {
        Ok(PkReadResult {
            code,
            body: PkReadResponse::default(),
            message: Some(message.to_string()),
        })
    }

    fn values(features: &[Option<RawJson>]) -> Vec<Option<String>> {
        features
            .iter()
            .map(|f| f.as_ref().map(|v| v.get().to_string()))
            .collect()
    }

    #[test]
    fn feature_types() {
        assert!(validate_feature_type(&raw_json("1"), "bigint").is_ok());
        assert!(validate_feature_type(&raw_json("1.5"), "decimal(10,2)").is_ok());
        assert!(validate_feature_type(&raw_json("\"a\""), "string").is_ok());
        assert!(validate_feature_type(&raw_json("true"), "boolean").is_ok());
        assert!(validate_feature_type(&raw_json("[1]"), "array<int>").is_ok());
        assert!(validate_feature_type(&raw_json("{}"), "struct<a:int>").is_ok());
        assert!(validate_feature_type(&raw_json("null"), "bigint").is_ok());
        let err = validate_feature_type(&raw_json("\"1\""), "bigint").unwrap_err();
        assert_eq!(err.kind, FsErrorCode::WrongDataType);
        assert_eq!(err.message, "Got: 'string', expected: 'number' (offline type: bigint)");
    }

    #[test]
    fn primary_key_validation() {
        let metadata = two_group_metadata();
        assert!(validate_primary_keys(&entries(&[("id1", "1"), ("fg2_id1", "1")]), &metadata).is_ok());

        let err = validate_primary_keys(&Entries::new(), &metadata).unwrap_err();
        assert_eq!(err.kind, FsErrorCode::NoPrimaryKeyGiven);

        let err = validate_primary_keys(&entries(&[("id1", "1"), ("nope", "1")]), &metadata)
            .unwrap_err();
        assert_eq!(err.kind, FsErrorCode::IncorrectPrimaryKey);
    }

    #[test]
    fn bare_name_covers_prefixed_key() {
        let metadata = two_group_metadata();
        assert!(validate_primary_keys(&entries(&[("id1", "1")]), &metadata).is_ok());
        let plan = plan_reads(&metadata, &entries(&[("id1", "5")]), "");
        assert_eq!(plan[1].params.filters[0].value.get(), "5");
    }

    #[test]
    fn passed_feature_validation() {
        let metadata = two_group_metadata();
        assert!(validate_passed_features(&entries(&[("data1", "\"x\"")]), &metadata).is_ok());
        let err = validate_passed_features(&entries(&[("id1", "1")]), &metadata).unwrap_err();
        assert_eq!(err.kind, FsErrorCode::FeatureNotExist);
        let err = validate_passed_features(&entries(&[("fg2_data2", "\"x\"")]), &metadata)
            .unwrap_err();
        assert_eq!(err.status, 415);
    }

    #[test]
    fn plan_has_one_read_per_group() {
        let metadata = two_group_metadata();
        let plan = plan_reads(&metadata, &entries(&[("id1", "1"), ("fg2_id1", "2")]), "3#");
        assert_eq!(plan.len(), 2);
        let first = &plan[0].params;
        assert_eq!(first.db, "test_fs");
        assert_eq!(first.table, "sample_1_1");
        assert_eq!(first.filters[0].column, "id1");
        assert_eq!(first.filters[0].value.get(), "1");
        let columns: Vec<&str> = first
            .read_columns
            .as_ref()
            .unwrap()
            .iter()
            .map(|c| c.column.as_str())
            .collect();
        assert_eq!(columns, vec!["data1", "data2"]);
        assert_eq!(first.operation_id.as_deref(), Some("3#test_fs|sample_1"));

        let second = &plan[1].params;
        assert_eq!(second.table, "sample_3_1");
        assert_eq!(second.filters[0].column, "id1");
        assert_eq!(second.filters[0].value.get(), "2");
    }

    #[test]
    fn assembles_positionally_and_overlays() {
        let metadata = two_group_metadata();
        let row = entries(&[("id1", "1"), ("fg2_id1", "1")]);
        let plan = plan_reads(&metadata, &row, "");
        let results = vec![
            hit(&[("data1", "\"a\""), ("data2", "10")]),
            hit(&[("data2", "0.5")]),
        ];
        let (mut features, status) = assemble_row(&metadata, &plan, &results, &row).unwrap();
        assert_eq!(status, FeatureStatus::Complete);
        assert_eq!(
            values(&features),
            vec![
                Some("\"a\"".to_string()),
                Some("10".to_string()),
                Some("0.5".to_string())
            ]
        );

        overlay_passed_features(&mut features, &entries(&[("data1", "999")]), &metadata);
        assert_eq!(features[0].as_ref().unwrap().get(), "999");
    }

    #[test]
    fn missing_row_leaves_nulls() {
        let metadata = two_group_metadata();
        let row = entries(&[("id1", "1"), ("fg2_id1", "2")]);
        let plan = plan_reads(&metadata, &row, "");
        let results = vec![hit(&[("data1", "\"a\""), ("data2", "10")]), failed(404, "")];
        let (features, status) = assemble_row(&metadata, &plan, &results, &row).unwrap();
        assert_eq!(status, FeatureStatus::Missing);
        assert!(features[2].is_none());
    }

    #[test]
    fn read_errors_are_translated() {
        assert!(translate_read_error(400, "Wrong number of primary-key columns. Expecting: 1 Got: 2").is_none());
        let err =
            translate_read_error(400, "Wrong data type. Expecting INT. Column: id1").unwrap();
        assert_eq!(err.kind, FsErrorCode::WrongDataType);
        assert_eq!(err.message, "Primary key 'id1' should be in 'INT' format.");
        let err = translate_read_error(400, "Wrong data type. Expecting INT UNSIGNED. Column: id1")
            .unwrap();
        assert_eq!(err.message, "Wrong data type. Expecting INT UNSIGNED. Column: id1");
        let err = translate_read_error(400, "Column does not exist. Column: x").unwrap();
        assert_eq!(err.kind, FsErrorCode::IncorrectPrimaryKey);
        let err = translate_read_error(400, "something else").unwrap();
        assert_eq!(err.kind, FsErrorCode::ReadFromDbFailBadInput);
        let err = translate_read_error(500, "Failed to start transaction.").unwrap();
        assert_eq!((err.kind, err.status), (FsErrorCode::ReadFromDbFail, 500));

        let metadata = two_group_metadata();
        let row = entries(&[("id1", "\"x\""), ("fg2_id1", "1")]);
        let plan = plan_reads(&metadata, &row, "");
        let results = vec![
            failed(400, "Wrong data type. Expecting BIGINT. Column: id1"),
            hit(&[]),
        ];
        let err = assemble_row(&metadata, &plan, &results, &row).unwrap_err();
        assert_eq!(err.status, 415);
    }

    #[test]
    fn join_keys_are_echoed() {
        // sample_3 selects the join column `id1` of sample_1 as a plain feature.
        let features = vec![
            feature("sample_1", "id1", "bigint", 0, true, ""),
            feature("sample_1", "data1", "string", 1, false, ""),
            feature("sample_3", "fk", "bigint", 2, true, "fg2_"),
            feature("sample_3", "id1", "bigint", 3, false, ""),
        ];
        let metadata = FeatureViewMetadata::new("test_fs", "v", 1, features).unwrap();
        let row = entries(&[("id1", "7"), ("fg2_fk", "7")]);
        let plan = plan_reads(&metadata, &row, "");
        let results = vec![hit(&[("data1", "\"a\"")]), hit(&[])];
        let (features, _) = assemble_row(&metadata, &plan, &results, &row).unwrap();
        assert_eq!(values(&features), vec![Some("\"a\"".to_string()), Some("7".to_string())]);
    }
}
