use serde::Serialize;
use std::fmt::{self, Display, Formatter};

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_UNAUTHORIZED: u16 = 401;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_UNSUPPORTED_MEDIA_TYPE: u16 = 415;
pub const STATUS_INTERNAL_SERVER_ERROR: u16 = 500;
pub const STATUS_SERVICE_UNAVAILABLE: u16 = 503;

/// Error surfaced to clients once a handler gives up. Either a plain
/// `(status, message)` pair or a coded feature store error.
#[derive(Debug, Clone, PartialEq)]
pub enum RdrsError {
    Message { status: u16, message: String },
    FeatureStore(FeatureStoreError),
}

impl RdrsError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self::Message {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(STATUS_BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(STATUS_UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(STATUS_NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(STATUS_INTERNAL_SERVER_ERROR, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(STATUS_SERVICE_UNAVAILABLE, message)
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Message { status, .. } => *status,
            Self::FeatureStore(err) => err.status,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Message { message, .. } => message,
            Self::FeatureStore(err) => &err.message,
        }
    }

    /// Collapses an arbitrary error into a client facing one. Typed errors keep
    /// their own status, anything else gets `default_status`.
    pub fn from_anyhow(err: anyhow::Error, default_status: u16) -> Self {
        if let Some(rdrs_error) = err.downcast_ref::<RdrsError>() {
            return rdrs_error.clone();
        }
        if let Some(fs_error) = err.downcast_ref::<FeatureStoreError>() {
            return Self::FeatureStore(fs_error.clone());
        }
        Self::new(default_status, format!("{:#}", err))
    }
}

impl Display for RdrsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message { message, .. } => write!(f, "{}", message),
            Self::FeatureStore(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for RdrsError {}

impl From<FeatureStoreError> for RdrsError {
    fn from(value: FeatureStoreError) -> Self {
        Self::FeatureStore(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum FsErrorCode {
    FvNotExist,
    FsNotExist,
    FgNotExist,
    FgReadFail,
    FsReadFail,
    FvReadFail,
    TdJoinReadFail,
    TdFeatureReadFail,
    FetchMetadataFromCacheFail,
    WrongDataType,
    FeatureNotExist,
    IncorrectPrimaryKey,
    IncorrectPassedFeature,
    ReadFromDbFail,
    NoPrimaryKeyGiven,
    IncorrectFeatureValue,
    FeatureStoreNotShared,
    ReadFromDbFailBadInput,
    DeserialiseFeatureFail,
}

impl FsErrorCode {
    pub fn code(self) -> i32 {
        match self {
            Self::FvNotExist => 1,
            Self::FsNotExist => 2,
            Self::FgNotExist => 3,
            Self::FgReadFail => 4,
            Self::FsReadFail => 5,
            Self::FvReadFail => 6,
            Self::TdJoinReadFail => 7,
            Self::TdFeatureReadFail => 8,
            Self::FetchMetadataFromCacheFail => 9,
            Self::WrongDataType => 10,
            Self::FeatureNotExist => 11,
            Self::IncorrectPrimaryKey => 12,
            Self::IncorrectPassedFeature => 13,
            // Both db read failures share code 14; clients tell them apart by status.
            Self::ReadFromDbFail | Self::ReadFromDbFailBadInput => 14,
            Self::NoPrimaryKeyGiven => 15,
            Self::IncorrectFeatureValue => 16,
            Self::FeatureStoreNotShared => 17,
            Self::DeserialiseFeatureFail => 18,
        }
    }

    pub fn status(self) -> u16 {
        match self {
            Self::FvNotExist | Self::FsNotExist | Self::FgNotExist | Self::FeatureNotExist => {
                STATUS_NOT_FOUND
            }
            Self::WrongDataType => STATUS_UNSUPPORTED_MEDIA_TYPE,
            Self::IncorrectPrimaryKey
            | Self::IncorrectPassedFeature
            | Self::NoPrimaryKeyGiven
            | Self::IncorrectFeatureValue
            | Self::ReadFromDbFailBadInput => STATUS_BAD_REQUEST,
            Self::FeatureStoreNotShared => STATUS_UNAUTHORIZED,
            Self::FgReadFail
            | Self::FsReadFail
            | Self::FvReadFail
            | Self::TdJoinReadFail
            | Self::TdFeatureReadFail
            | Self::FetchMetadataFromCacheFail
            | Self::ReadFromDbFail
            | Self::DeserialiseFeatureFail => STATUS_INTERNAL_SERVER_ERROR,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::FvNotExist => "Feature view does not exist.",
            Self::FsNotExist => "Feature store does not exist.",
            Self::FgNotExist => "Feature group does not exist.",
            Self::FgReadFail => "Reading feature group failed.",
            Self::FsReadFail => "Reading feature store failed.",
            Self::FvReadFail => "Reading feature view failed.",
            Self::TdJoinReadFail => "Reading training dataset join failed.",
            Self::TdFeatureReadFail => "Reading training dataset feature failed.",
            Self::FetchMetadataFromCacheFail => "Fetching metadata from cache failed.",
            Self::WrongDataType => "Wrong data type.",
            Self::FeatureNotExist => "Feature does not exist.",
            Self::IncorrectPrimaryKey => "Incorrect primary key.",
            Self::IncorrectPassedFeature => "Incorrect passed feature.",
            Self::ReadFromDbFail | Self::ReadFromDbFailBadInput => "Reading from db failed.",
            Self::NoPrimaryKeyGiven => "No primary key is given.",
            Self::IncorrectFeatureValue => "Incorrect feature value.",
            Self::FeatureStoreNotShared => "Accessing unshared feature store failed",
            Self::DeserialiseFeatureFail => "Deserialising complex feature failed.",
        }
    }
}

/// Feature store error as returned to clients: `{code, reason, message}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureStoreError {
    #[serde(skip)]
    pub kind: FsErrorCode,
    #[serde(skip)]
    pub status: u16,
    pub code: i32,
    pub reason: String,
    pub message: String,
}

impl FeatureStoreError {
    pub fn new(kind: FsErrorCode) -> Self {
        Self {
            kind,
            status: kind.status(),
            code: kind.code(),
            reason: kind.reason().to_string(),
            message: String::new(),
        }
    }

    pub fn with_message(kind: FsErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::new(kind)
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == STATUS_NOT_FOUND
    }
}

impl Display for FeatureStoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => write!(f, "{}", json),
            Err(_) => write!(f, "{} {}", self.reason, self.message),
        }
    }
}

impl std::error::Error for FeatureStoreError {}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn feature_store_error_serializes_public_fields_only() {
        let err = FeatureStoreError::with_message(FsErrorCode::FvNotExist, "fv_1 missing");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "code": 1,
                "reason": "Feature view does not exist.",
                "message": "fv_1 missing"
            })
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn db_read_failures_share_code() {
        let internal = FeatureStoreError::new(FsErrorCode::ReadFromDbFail);
        let bad_input = FeatureStoreError::new(FsErrorCode::ReadFromDbFailBadInput);
        assert_eq!(internal.code, 14);
        assert_eq!(bad_input.code, 14);
        assert_eq!(internal.status, 500);
        assert_eq!(bad_input.status, 400);
    }

    #[test]
    fn from_anyhow_keeps_typed_status() {
        let err = anyhow::Error::new(FeatureStoreError::new(FsErrorCode::WrongDataType));
        assert_eq!(RdrsError::from_anyhow(err, 400).status(), 415);

        let err = anyhow::Error::new(RdrsError::unauthorized("nope"));
        assert_eq!(RdrsError::from_anyhow(err, 500).status(), 401);

        let err = anyhow!("plain failure");
        let collapsed = RdrsError::from_anyhow(err, 400);
        assert_eq!(collapsed.status(), 400);
        assert_eq!(collapsed.message(), "plain failure");
    }
}
