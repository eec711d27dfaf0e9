//! Complex features are stored as base64 encoded Avro datums.

use crate::error::{FeatureStoreError, FsErrorCode};
use crate::model::RawJson;
use apache_avro::Schema;
use apache_avro::types::Value as AvroValue;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value as JsonValue;
use serde_json::value::RawValue;

fn deserialise_error(message: impl Into<String>) -> FeatureStoreError {
    FeatureStoreError::with_message(FsErrorCode::DeserialiseFeatureFail, message)
}

/// `"<base64>"` -> Avro datum -> plain JSON.
pub fn decode_complex_feature(raw: &RawValue, schema: &Schema) -> Result<RawJson, FeatureStoreError> {
    let encoded: String = serde_json::from_str(raw.get())
        .map_err(|err| deserialise_error(format!("Failed to unmarshal feature value: {}", err)))?;
    let bytes = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|err| deserialise_error(format!("Failed to decode base64 value: {}", err)))?;
    let datum = apache_avro::from_avro_datum(schema, &mut bytes.as_slice(), None)
        .map_err(|err| deserialise_error(format!("Failed to decode avro value: {}", err)))?;
    let json = avro_to_json(datum)
        .map_err(|err| deserialise_error(format!("Failed to convert avro value: {}", err)))?;
    serde_json::value::to_raw_value(&json)
        .map_err(|err| deserialise_error(format!("Failed to serialise feature value: {}", err)))
}

/// Unions collapse to their branch; records and maps become objects.
fn avro_to_json(value: AvroValue) -> Result<JsonValue, apache_avro::Error> {
    Ok(match value {
        AvroValue::Null => JsonValue::Null,
        AvroValue::Boolean(b) => JsonValue::Bool(b),
        AvroValue::Int(i) | AvroValue::Date(i) | AvroValue::TimeMillis(i) => i.into(),
        AvroValue::Long(l)
        | AvroValue::TimeMicros(l)
        | AvroValue::TimestampMillis(l)
        | AvroValue::TimestampMicros(l) => l.into(),
        AvroValue::Float(f) => float_to_json(f as f64),
        AvroValue::Double(d) => float_to_json(d),
        AvroValue::String(s) | AvroValue::Enum(_, s) => JsonValue::String(s),
        AvroValue::Bytes(bytes) | AvroValue::Fixed(_, bytes) => JsonValue::String(STANDARD.encode(bytes)),
        AvroValue::Union(_, inner) => avro_to_json(*inner)?,
        AvroValue::Array(items) => JsonValue::Array(
            items
                .into_iter()
                .map(avro_to_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        AvroValue::Map(entries) => JsonValue::Object(
            entries
                .into_iter()
                .map(|(key, value)| Ok((key, avro_to_json(value)?)))
                .collect::<Result<serde_json::Map<_, _>, apache_avro::Error>>()?,
        ),
        AvroValue::Record(fields) => JsonValue::Object(
            fields
                .into_iter()
                .map(|(key, value)| Ok((key, avro_to_json(value)?)))
                .collect::<Result<serde_json::Map<_, _>, apache_avro::Error>>()?,
        ),
        other => JsonValue::try_from(other)?,
    })
}

fn float_to_json(value: f64) -> JsonValue {
    serde_json::Number::from_f64(value)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}
