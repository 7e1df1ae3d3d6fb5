use std::fmt::{Display, Formatter};

use crate::database::backend::BackendError;

/// Coarse classification the rest of the application reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DatabaseErrorKind {
    Network,
    Permission,
    Validation,
    NotFound,
}

impl DatabaseErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseErrorKind::Network => "network",
            DatabaseErrorKind::Permission => "permission",
            DatabaseErrorKind::Validation => "validation",
            DatabaseErrorKind::NotFound => "not-found",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseError {
    code: String,
    pub kind: DatabaseErrorKind,
    message: String,
}

impl DatabaseError {
    pub fn new(
        code: impl Into<String>,
        kind: DatabaseErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            kind,
            message: message.into(),
        }
    }

    /// Raw code reported by the backend, e.g. `permission-denied`.
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn kind(&self) -> DatabaseErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for DatabaseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}/{})", self.message, self.kind.as_str(), self.code)
    }
}

impl std::error::Error for DatabaseError {}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

const UNKNOWN_ERROR_MESSAGE: &str = "不明なエラーが発生しました";

/// Maps a backend failure onto the gateway taxonomy with a localized message.
///
/// Codes may carry a service prefix (`firestore/not-found`); only the last segment is
/// inspected. Anything unrecognised is treated as a network failure.
pub fn map_backend_error(error: BackendError) -> DatabaseError {
    let code = if error.code.is_empty() {
        "unknown".to_string()
    } else {
        error.code
    };
    let bare = code.rsplit('/').next().unwrap_or(code.as_str());

    let (kind, message) = match bare {
        "permission-denied" => (DatabaseErrorKind::Permission, "アクセス権限がありません".to_string()),
        "not-found" => (DatabaseErrorKind::NotFound, "データが見つかりません".to_string()),
        "invalid-argument" => (DatabaseErrorKind::Validation, "無効な引数です".to_string()),
        "unavailable" => (DatabaseErrorKind::Network, "サービスが利用できません".to_string()),
        "deadline-exceeded" => (
            DatabaseErrorKind::Network,
            "リクエストがタイムアウトしました".to_string(),
        ),
        _ => {
            let message = if error.message.is_empty() {
                UNKNOWN_ERROR_MESSAGE.to_string()
            } else {
                error.message
            };
            (DatabaseErrorKind::Network, message)
        }
    };

    DatabaseError::new(code, kind, message)
}

pub fn invalid_argument(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new("invalid-argument", DatabaseErrorKind::Validation, message)
}

pub fn invalid_document(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new("invalid-document", DatabaseErrorKind::Validation, message)
}
