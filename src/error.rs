//! Error types for the dose-rate engine
//!
//! Every fallible operation in the library returns [`DoseResult`]. Lookup
//! misses against cross-reference tables are not errors: they come back as
//! `Ok(None)` so callers can skip the record and carry on, while anything in
//! [`DoseError`] aborts the current load or computation.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DoseError {
    /// A line or record does not match its expected layout
    #[error("File {file} has incorrect format, line {line}: {description}")]
    Format {
        file: String,
        line: usize,
        description: String,
    },

    /// A requested field does not exist on a table
    #[error("Field error: {0}")]
    Field(String),

    /// Power history breaks a domain invariant (e.g. non-zero first power)
    #[error("Core history file invalid: {0}")]
    HistoryInvalid(String),

    /// No algorithm in the run is flagged as the reference one
    #[error("No reference algorithm found")]
    MissingReference,

    /// The decay-spectrum program ran but reported failure
    #[error("{program} exited with status {status:?}\nstdout: {stdout}\nstderr: {stderr}")]
    Collaborator {
        program: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// The decay-spectrum program could not be started
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type DoseResult<T> = Result<T, DoseError>;

impl DoseError {
    pub fn format(file: impl Into<String>, line: usize, description: impl Into<String>) -> Self {
        DoseError::Format {
            file: file.into(),
            line,
            description: description.into(),
        }
    }

    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DoseError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors that must stop the whole run without partial output
    pub fn is_history_invalid(&self) -> bool {
        matches!(self, DoseError::HistoryInvalid(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error_message() {
        let err = DoseError::format("MCU_FAs.txt", 12, "error parsing 1.2.3");
        assert_eq!(
            err.to_string(),
            "File MCU_FAs.txt has incorrect format, line 12: error parsing 1.2.3"
        );
    }

    #[test]
    fn test_history_invalid_is_flagged() {
        let err = DoseError::HistoryInvalid("first record must have zero power".into());
        assert!(err.is_history_invalid());
        assert!(!DoseError::Field("No Cell field".into()).is_history_invalid());
    }
}
