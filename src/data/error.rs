use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::database::{DatabaseError, DatabaseErrorKind};
use crate::offline::{StorageError, StorageErrorCode};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataErrorCode {
    /// No connectivity and the offline path is switched off.
    OfflineModeDisabled,
    Remote(DatabaseErrorKind),
    Storage(StorageErrorCode),
}

impl DataErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataErrorCode::OfflineModeDisabled => "data/offline-mode-disabled",
            DataErrorCode::Remote(DatabaseErrorKind::Network) => "data/network",
            DataErrorCode::Remote(DatabaseErrorKind::Permission) => "data/permission",
            DataErrorCode::Remote(DatabaseErrorKind::Validation) => "data/validation",
            DataErrorCode::Remote(DatabaseErrorKind::NotFound) => "data/not-found",
            DataErrorCode::Storage(_) => "data/storage",
        }
    }
}

#[derive(Clone, Debug)]
pub struct DataError {
    pub code: DataErrorCode,
    message: String,
}

impl DataError {
    pub fn new(code: DataErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Kind reported by the remote gateway, if the failure came from there.
    pub fn remote_kind(&self) -> Option<DatabaseErrorKind> {
        match self.code {
            DataErrorCode::Remote(kind) => Some(kind),
            _ => None,
        }
    }
}

impl Display for DataError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for DataError {}

impl From<DatabaseError> for DataError {
    fn from(error: DatabaseError) -> Self {
        DataError::new(DataErrorCode::Remote(error.kind()), error.message())
    }
}

impl From<StorageError> for DataError {
    fn from(error: StorageError) -> Self {
        DataError::new(DataErrorCode::Storage(error.code), error.message())
    }
}

pub type DataResult<T> = Result<T, DataError>;

pub fn offline_mode_disabled() -> DataError {
    DataError::new(DataErrorCode::OfflineModeDisabled, "オフラインモードが無効です")
}
