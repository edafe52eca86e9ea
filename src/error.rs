//! Error types for RORI.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence errors raised by the stores.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A raw payload could not be turned into an `Interaction`.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid interaction payload: {0}")]
    InvalidPayload(String),

    #[error("Field {0} must not be empty")]
    EmptyField(&'static str),

    #[error("Invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },
}

/// Module registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid condition for module {name}: {reason}")]
    InvalidCondition { name: String, reason: String },

    #[error("Module {0} is already registered")]
    DuplicateName(String),

    #[error("Module {0} not found")]
    NotFound(String),

    #[error("Failed to load registry: {0}")]
    Load(#[from] DatabaseError),
}

/// Failures local to a single module invocation. Never abort a dispatch cycle.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("Cannot resolve module at {location}: {reason}")]
    Resolution { location: String, reason: String },

    #[error("Module {name} failed: {reason}")]
    Execution { name: String, reason: String },

    #[error("Module {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Module {name} panicked")]
    Panicked { name: String },

    #[error("Persistence failed: {0}")]
    Persistence(#[from] DatabaseError),
}

/// Reply delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Failed to deliver reply through {sink}: {reason}")]
    SendFailed { sink: String, reason: String },
}

/// Interaction source errors.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Source {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },
}

/// A scheduled task that cannot be planned or run.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid schedule field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Task {task} targets unknown module {module}")]
    UnknownModule { task: i64, module: String },

    #[error("Task {task} parameter is missing {key}")]
    MissingParameter { task: i64, key: &'static str },

    #[error("Task {task} device {device} is not linked to user {username}")]
    UnknownDevice {
        task: i64,
        device: String,
        username: String,
    },

    #[error("Persistence failed: {0}")]
    Persistence(#[from] DatabaseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_errors_wrap_persistence_failures() {
        let err: ModuleError = DatabaseError::Query("disk full".into()).into();
        assert!(matches!(err, ModuleError::Persistence(_)));
        assert_eq!(err.to_string(), "Persistence failed: Query failed: disk full");
    }

    #[test]
    fn timeout_names_module_and_budget() {
        let err = ModuleError::Timeout {
            name: "slow".into(),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "Module slow timed out after 250ms");
    }

    #[test]
    fn registry_load_wraps_database_errors() {
        let err = RegistryError::from(DatabaseError::Pool("gone".into()));
        assert!(matches!(err, RegistryError::Load(DatabaseError::Pool(_))));
    }
}
