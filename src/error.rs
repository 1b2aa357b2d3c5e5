//! Error taxonomy for template analysis, rendering and job execution
//!
//! This module provides:
//! - `TemplateError`, the single error type returned by the library
//! - `ErrorCode` classification (stable numeric codes, categories, retryability)
//! - Constructors that carry sheet / cell context

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// =============================================================================
// ERROR CODES
// =============================================================================

/// Stable error codes, one per `TemplateError` family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    /// Malformed marker, overlapping repeat ranges, unknown sheet reference
    TemplateProcessing = -32101,
    /// Adjusted formula exceeds the host format's limits
    FormulaExpansion = -32102,
    /// Variables or collections referenced by the template are missing
    MissingTemplateData = -32103,
    /// Planned and iterated collection sizes disagree
    CollectionSizeMismatch = -32104,
    /// Output file already exists under the `Error` conflict policy
    OutputExists = -32105,
    /// Rendering was cancelled cooperatively
    Cancelled = -32106,
    /// Invalid configuration
    InvalidConfig = -32107,
    /// Output encryption failed
    Encryption = -32108,
    /// Underlying I/O, zip or XML failure
    IoError = -32109,
    /// Unexpected internal failure (e.g. a panicking worker)
    InternalError = -32110,
}

impl ErrorCode {
    /// Get the integer code
    pub fn code(&self) -> i32 {
        *self as i32
    }

    /// Check if this error type is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::IoError | ErrorCode::InternalError | ErrorCode::CollectionSizeMismatch
        )
    }

    /// Get the error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            ErrorCode::TemplateProcessing | ErrorCode::FormulaExpansion => "template_error",
            ErrorCode::MissingTemplateData | ErrorCode::CollectionSizeMismatch => "data_error",
            ErrorCode::OutputExists | ErrorCode::IoError | ErrorCode::Encryption => "io_error",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::InvalidConfig => "client_error",
            ErrorCode::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

// =============================================================================
// TEMPLATE ERROR
// =============================================================================

/// Errors raised while analyzing a template, rendering it, or running a job
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template processing error{}: {message}", location_suffix(sheet, cell))]
    TemplateProcessing {
        message: String,
        sheet: Option<String>,
        cell: Option<String>,
    },

    #[error("formula expansion error at {sheet}!{cell}: {reason} (formula: {formula})")]
    FormulaExpansion {
        sheet: String,
        cell: String,
        formula: String,
        reason: String,
    },

    #[error("{}", missing_message(variables, collections))]
    MissingTemplateData {
        variables: Vec<String>,
        collections: Vec<String>,
    },

    #[error("collection '{collection}' planned {expected} items but yielded {actual}")]
    CollectionSizeMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("output file already exists: {}", path.display())]
    OutputExists { path: PathBuf },

    #[error("rendering cancelled")]
    Cancelled,

    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("failed to encrypt output: {message}")]
    Encryption { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("zip error: {source}")]
    Zip {
        #[from]
        source: zip::result::ZipError,
    },

    #[error("XML error in {part}: {message}")]
    Xml { part: String, message: String },
}

pub type Result<T, E = TemplateError> = std::result::Result<T, E>;

impl TemplateError {
    pub fn template(message: impl Into<String>) -> Self {
        TemplateError::TemplateProcessing {
            message: message.into(),
            sheet: None,
            cell: None,
        }
    }

    pub fn template_at(
        message: impl Into<String>,
        sheet: impl Into<String>,
        cell: impl Into<String>,
    ) -> Self {
        TemplateError::TemplateProcessing {
            message: message.into(),
            sheet: Some(sheet.into()),
            cell: Some(cell.into()),
        }
    }

    pub fn formula(
        sheet: impl Into<String>,
        cell: impl Into<String>,
        formula: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        TemplateError::FormulaExpansion {
            sheet: sheet.into(),
            cell: cell.into(),
            formula: formula.into(),
            reason: reason.into(),
        }
    }

    pub fn xml(part: impl Into<String>, err: impl fmt::Display) -> Self {
        TemplateError::Xml {
            part: part.into(),
            message: err.to_string(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        TemplateError::Config {
            message: message.into(),
        }
    }

    /// Attach sheet context to a template error that was raised without it
    pub fn in_sheet(self, sheet_name: &str) -> Self {
        match self {
            TemplateError::TemplateProcessing {
                message,
                sheet: None,
                cell,
            } => TemplateError::TemplateProcessing {
                message,
                sheet: Some(sheet_name.to_string()),
                cell,
            },
            other => other,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            TemplateError::TemplateProcessing { .. } => ErrorCode::TemplateProcessing,
            TemplateError::FormulaExpansion { .. } => ErrorCode::FormulaExpansion,
            TemplateError::MissingTemplateData { .. } => ErrorCode::MissingTemplateData,
            TemplateError::CollectionSizeMismatch { .. } => ErrorCode::CollectionSizeMismatch,
            TemplateError::OutputExists { .. } => ErrorCode::OutputExists,
            TemplateError::Cancelled => ErrorCode::Cancelled,
            TemplateError::Config { .. } => ErrorCode::InvalidConfig,
            TemplateError::Encryption { .. } => ErrorCode::Encryption,
            TemplateError::Internal { .. } => ErrorCode::InternalError,
            TemplateError::Io { .. } | TemplateError::Zip { .. } | TemplateError::Xml { .. } => {
                ErrorCode::IoError
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TemplateError::Cancelled)
    }
}

impl From<quick_xml::Error> for TemplateError {
    fn from(err: quick_xml::Error) -> Self {
        TemplateError::xml("package", err)
    }
}

fn location_suffix(sheet: &Option<String>, cell: &Option<String>) -> String {
    match (sheet, cell) {
        (Some(sheet), Some(cell)) => format!(" at {sheet}!{cell}"),
        (Some(sheet), None) => format!(" in sheet '{sheet}'"),
        (None, Some(cell)) => format!(" at {cell}"),
        (None, None) => String::new(),
    }
}

fn missing_message(variables: &[String], collections: &[String]) -> String {
    let mut parts = Vec::new();
    if !variables.is_empty() {
        parts.push(format!("variables [{}]", variables.join(", ")));
    }
    if !collections.is_empty() {
        parts.push(format!("collections [{}]", collections.join(", ")));
    }
    format!("missing template data: {}", parts.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_data_message_names_everything() {
        let err = TemplateError::MissingTemplateData {
            variables: vec!["title".into()],
            collections: vec!["employees".into()],
        };
        let text = err.to_string();
        assert!(text.contains("title"));
        assert!(text.contains("employees"));
        assert_eq!(err.code(), ErrorCode::MissingTemplateData);
        assert_eq!(err.code().category(), "data_error");
    }

    #[test]
    fn template_error_location_is_rendered() {
        let err = TemplateError::template_at("bad marker", "Sheet1", "B2");
        assert_eq!(
            err.to_string(),
            "template processing error at Sheet1!B2: bad marker"
        );
        let err = TemplateError::template("overlap").in_sheet("Data");
        assert!(err.to_string().contains("in sheet 'Data'"));
    }

    #[test]
    fn retryable_codes() {
        assert!(ErrorCode::IoError.is_retryable());
        assert!(!ErrorCode::TemplateProcessing.is_retryable());
        assert_eq!(ErrorCode::Cancelled.code(), -32106);
    }
}
