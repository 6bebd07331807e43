//! Typed errors and envelope code mapping.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing reference: {kind} '{id}'")]
    MissingReference { kind: &'static str, id: String },
    #[error("duplicate entity: {0}")]
    DuplicateEntity(String),
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("config load: {0}")]
    Load(String),
}

/// Every failure a pipeline or persistence operation can report.
///
/// Callers branch on the variant (see [`RuntimeError::is_not_found`]), never on the message.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A required input was missing; storage was never touched.
    #[error("{0}")]
    Validation(String),
    #[error("not found: {entity} {key}")]
    NotFound { entity: String, key: String },
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    /// Opaque failure reported by the document engine.
    #[error("storage: {0}")]
    Storage(String),
    /// A lifecycle hook aborted the operation.
    #[error("hook: {0}")]
    Hook(String),
}

impl RuntimeError {
    pub fn not_found(entity: &str, key: impl std::fmt::Display) -> Self {
        RuntimeError::NotFound {
            entity: entity.to_string(),
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RuntimeError::NotFound { .. } | RuntimeError::Db(sqlx::Error::RowNotFound)
        )
    }

    /// Stable code used in the `{error}` envelope.
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::Config(_) => "config_error",
            RuntimeError::Validation(_) => "validation_error",
            RuntimeError::NotFound { .. } => "not_found",
            RuntimeError::Db(sqlx::Error::RowNotFound) => "not_found",
            RuntimeError::Db(_) => "database_error",
            RuntimeError::Storage(_) => "storage_error",
            RuntimeError::Hook(_) => "hook_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_counts_as_not_found() {
        let err = RuntimeError::Db(sqlx::Error::RowNotFound);
        assert!(err.is_not_found());
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn validation_is_not_not_found() {
        let err = RuntimeError::Validation("body is required for create".into());
        assert!(!err.is_not_found());
        assert_eq!(err.code(), "validation_error");
        assert_eq!(err.to_string(), "body is required for create");
    }
}
