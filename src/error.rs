//! Error types for petrel.
//!
//! Validation errors surface to the submitter with a 4xx status and nothing
//! persisted; update errors surface on the callback response while the owning
//! execution is driven to `errored`; everything else is an internal fault.

use thiserror::Error;

/// Result type alias for petrel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// petrel error types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("DAG '{dag}' contains a cycle")]
    DagCycle { dag: String },

    #[error("duplicate link from '{link_source}' to '{destination}'")]
    DuplicateLink {
        link_source: String,
        destination: String,
    },

    #[error("task name '{name}' is reserved in DAG '{dag}'")]
    IllegalTaskName { dag: String, name: String },

    #[error("missing required inputs: {}", missing.join(", "))]
    MissingInputs { missing: Vec<String> },

    #[error("property '{property}' of task '{task}' has more than one data-flow source")]
    DuplicateDataFlow { task: String, property: String },

    #[error("workflow named '{0}' already exists")]
    DuplicateWorkflowName(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("field '{0}' of an execution is immutable")]
    ImmutableUpdate(String),

    #[error("outputs already set for execution {0}")]
    OutputsAlreadySet(String),

    #[error("execution {execution_id} is missing outputs: {}", missing.join(", "))]
    MissingOutputs {
        execution_id: String,
        missing: Vec<String>,
    },

    #[error("no such {kind}: {id}")]
    NoSuchEntity { kind: &'static str, id: String },

    #[error("invalid callback '{name}' for {entity}; allowed: {}", allowed.join(", "))]
    InvalidCallback {
        entity: &'static str,
        name: String,
        allowed: Vec<&'static str>,
    },

    #[error("job URL mismatch for execution {execution_id}: got '{reported}'")]
    JobUrlMismatch {
        execution_id: String,
        reported: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the machine-parseable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::DagCycle { .. } => "DAG_CYCLE",
            Error::DuplicateLink { .. } => "DUPLICATE_LINK",
            Error::IllegalTaskName { .. } => "ILLEGAL_TASK_NAME",
            Error::MissingInputs { .. } => "MISSING_INPUTS",
            Error::DuplicateDataFlow { .. } => "DUPLICATE_DATA_FLOW",
            Error::DuplicateWorkflowName(_) => "DUPLICATE_WORKFLOW_NAME",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::ImmutableUpdate(_) => "IMMUTABLE_UPDATE",
            Error::OutputsAlreadySet(_) => "OUTPUTS_ALREADY_SET",
            Error::MissingOutputs { .. } => "MISSING_OUTPUTS",
            Error::NoSuchEntity { .. } => "NO_SUCH_ENTITY",
            Error::InvalidCallback { .. } => "INVALID_CALLBACK",
            Error::JobUrlMismatch { .. } => "JOB_URL_MISMATCH",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// HTTP status used when this error is returned from an API handler.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::DagCycle { .. }
            | Error::DuplicateLink { .. }
            | Error::IllegalTaskName { .. }
            | Error::MissingInputs { .. }
            | Error::DuplicateDataFlow { .. }
            | Error::Validation(_) => 422,
            Error::DuplicateWorkflowName(_) | Error::OutputsAlreadySet(_) => 409,
            Error::ImmutableUpdate(_)
            | Error::MissingOutputs { .. }
            | Error::InvalidCallback { .. }
            | Error::JobUrlMismatch { .. } => 400,
            Error::NoSuchEntity { .. } => 404,
            Error::Json(_) | Error::Yaml(_) => 400,
            Error::Config(_)
            | Error::Internal(_)
            | Error::Http(_)
            | Error::Database(_)
            | Error::Io(_) => 500,
        }
    }

    /// Get a sanitized message safe for external consumers.
    ///
    /// Internal faults hide details like file paths and SQL statements;
    /// user-facing errors keep their full message.
    pub fn external_message(&self) -> String {
        match self {
            Error::Database(_) => "A database error occurred".to_string(),
            Error::Internal(_) => "An internal error occurred".to_string(),
            Error::Io(_) => "An I/O error occurred".to_string(),
            Error::Http(e) => {
                if let Some(status) = e.status() {
                    format!("Upstream request failed with status {}", status.as_u16())
                } else if e.is_timeout() {
                    "Upstream request timed out".to_string()
                } else if e.is_connect() {
                    "Failed to connect to upstream service".to_string()
                } else {
                    "Upstream request failed".to_string()
                }
            }
            other => other.to_string(),
        }
    }

    /// Convert to the JSON error envelope returned by API handlers.
    pub fn to_external_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.external_message(),
            }
        })
    }

    /// True for errors the submitter caused (4xx), false for faults.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.http_status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_are_client_errors() {
        let err = Error::DagCycle { dag: "root".into() };
        assert!(err.is_client_error());
        assert_eq!(err.code(), "DAG_CYCLE");
        assert_eq!(err.http_status(), 422);
    }

    #[test]
    fn test_missing_inputs_lists_names() {
        let err = Error::MissingInputs {
            missing: vec!["alpha".into(), "beta".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("alpha"));
        assert!(msg.contains("beta"));
    }

    #[test]
    fn test_invalid_callback_names_allowed_set() {
        let err = Error::InvalidCallback {
            entity: "job method",
            name: "bogus".into(),
            allowed: vec!["execute", "succeeded"],
        };
        assert!(err.to_string().contains("execute"));
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn test_internal_messages_are_sanitized() {
        let err = Error::Internal("secret path /var/lib/petrel".into());
        assert!(!err.external_message().contains("/var/lib"));
        assert_eq!(err.http_status(), 500);
    }
}
