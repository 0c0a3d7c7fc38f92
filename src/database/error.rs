//! Database error classification

use crate::error::{AppError, AppErrorKind, InfrastructureError};
use std::fmt;

#[derive(Debug, Clone)]
pub enum DatabaseErrorKind {
    NotFound { entity: String, id: String },
    UniqueViolation { constraint: Option<String> },
    ForeignKeyViolation { constraint: Option<String> },
    Connection { message: String },
    Query { message: String },
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

    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Self::new(DatabaseErrorKind::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        })
    }

    pub fn from_sqlx(err: sqlx::Error) -> Self {
        let kind = match err {
            sqlx::Error::RowNotFound => DatabaseErrorKind::NotFound {
                entity: "row".to_string(),
                id: "unknown".to_string(),
            },
            sqlx::Error::Database(db_err) => {
                let constraint = db_err.constraint().map(str::to_string);
                // SQLSTATE 23505 unique_violation, 23503 foreign_key_violation
                match db_err.code().as_deref() {
                    Some("23505") => DatabaseErrorKind::UniqueViolation { constraint },
                    Some("23503") => DatabaseErrorKind::ForeignKeyViolation { constraint },
                    _ => DatabaseErrorKind::Query {
                        message: db_err.message().to_string(),
                    },
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseErrorKind::Connection {
                    message: err.to_string(),
                }
            }
            other => DatabaseErrorKind::Unknown {
                message: other.to_string(),
            },
        };
        Self { kind }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::Connection { .. })
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DatabaseErrorKind::NotFound { entity, id } => write!(f, "{} {} not found", entity, id),
            DatabaseErrorKind::UniqueViolation { constraint } => {
                write!(f, "unique violation on {}", constraint.as_deref().unwrap_or("?"))
            }
            DatabaseErrorKind::ForeignKeyViolation { constraint } => {
                write!(f, "foreign key violation on {}", constraint.as_deref().unwrap_or("?"))
            }
            DatabaseErrorKind::Connection { message } => write!(f, "connection error: {}", message),
            DatabaseErrorKind::Query { message } => write!(f, "query error: {}", message),
            DatabaseErrorKind::Unknown { message } => write!(f, "database error: {}", message),
        }
    }
}

impl std::error::Error for DatabaseError {}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        let is_retryable = err.is_retryable();
        AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
            message: err.to_string(),
            is_retryable,
        }))
    }
}
