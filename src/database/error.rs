use std::fmt;

use crate::error::{AppError, AppErrorKind, InfrastructureError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseErrorKind {
    NotFound { entity: String, id: String },
    UniqueViolation { constraint: String },
    ForeignKeyViolation { constraint: String },
    CheckViolation { constraint: String },
    ConnectionError { message: String },
    PoolExhausted,
    /// Stored value could not be mapped back into a domain type
    Decode { message: String },
    Unknown { message: String },
}

#[derive(Debug, Clone)]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::Decode {
            message: message.into(),
        })
    }

    pub fn from_sqlx(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::RowNotFound => DatabaseErrorKind::NotFound {
                entity: "row".to_string(),
                id: String::new(),
            },
            sqlx::Error::PoolTimedOut => DatabaseErrorKind::PoolExhausted,
            sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                DatabaseErrorKind::ConnectionError {
                    message: err.to_string(),
                }
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                DatabaseErrorKind::Decode {
                    message: err.to_string(),
                }
            }
            sqlx::Error::Database(db_err) => {
                let constraint = db_err.constraint().unwrap_or_default().to_string();
                match db_err.code().as_deref() {
                    Some("23505") => DatabaseErrorKind::UniqueViolation { constraint },
                    Some("23503") => DatabaseErrorKind::ForeignKeyViolation { constraint },
                    Some("23514") => DatabaseErrorKind::CheckViolation { constraint },
                    _ => DatabaseErrorKind::Unknown {
                        message: db_err.message().to_string(),
                    },
                }
            }
            _ => DatabaseErrorKind::Unknown {
                message: err.to_string(),
            },
        };
        Self { kind }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            DatabaseErrorKind::ConnectionError { .. } | DatabaseErrorKind::PoolExhausted
        )
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::UniqueViolation { .. })
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DatabaseErrorKind::NotFound { entity, id } => write!(f, "{} not found: {}", entity, id),
            DatabaseErrorKind::UniqueViolation { constraint } => {
                write!(f, "unique constraint violated: {}", constraint)
            }
            DatabaseErrorKind::ForeignKeyViolation { constraint } => {
                write!(f, "foreign key violated: {}", constraint)
            }
            DatabaseErrorKind::CheckViolation { constraint } => {
                write!(f, "check constraint violated: {}", constraint)
            }
            DatabaseErrorKind::ConnectionError { message } => {
                write!(f, "database connection error: {}", message)
            }
            DatabaseErrorKind::PoolExhausted => write!(f, "database pool exhausted"),
            DatabaseErrorKind::Decode { message } => write!(f, "decode error: {}", message),
            DatabaseErrorKind::Unknown { message } => write!(f, "database error: {}", message),
        }
    }
}

impl std::error::Error for DatabaseError {}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
            message: err.to_string(),
            is_retryable: err.is_retryable(),
        }))
    }
}
