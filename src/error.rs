//! Error types for the trace optimizer

use std::fmt;
use thiserror::Error;

/// Location inside a trace source text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    /// Line number (1-indexed)
    pub line: u32,
    /// Column number (1-indexed)
    pub column: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Format the offending line of a trace with a caret under the error column
pub fn format_error_context(source: &str, location: &SourceLocation) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let line_idx = (location.line.saturating_sub(1)) as usize;

    if line_idx >= lines.len() {
        return String::new();
    }

    let width = format!("{}", location.line).len().max(3);
    let mut result = String::new();
    result.push_str(&format!(
        "{:>width$} | {}\n",
        location.line,
        lines[line_idx],
        width = width
    ));
    let pointer_offset = (location.column.saturating_sub(1)) as usize;
    result.push_str(&format!(
        "{:>width$} | {}^\n",
        "",
        " ".repeat(pointer_offset),
        width = width
    ));
    result
}

/// Main error type for the optimizer
#[derive(Error, Debug)]
pub enum Error {
    /// A speculative assumption was proven false; the trace must be discarded
    #[error("InvalidLoop: {0}")]
    InvalidLoop(String),

    /// Too many values to reconstruct on a guard's failure path
    #[error("TagOverflow: guard {guard} needs {entries} resume entries (limit {limit})")]
    TagOverflow {
        guard: u32,
        entries: usize,
        limit: usize,
    },

    /// Runtime values do not match the shape a virtual state expects
    #[error("BadVirtualState: {0}")]
    BadVirtualState(String),

    /// A feature that this optimizer cannot handle
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Trace text could not be parsed
    #[error("ParseError: {message} at {location}{}", if source_context.is_empty() { String::new() } else { format!("\n{}", source_context) })]
    Parse {
        message: String,
        location: SourceLocation,
        source_context: String,
    },

    /// The reference interpreter hit an ill-typed or ill-formed operation
    #[error("ExecutionError: {0}")]
    Execution(String),

    /// Internal optimizer error
    #[error("InternalError: {0}")]
    Internal(String),

    /// IO error
    #[error("IOError: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Create an InvalidLoop error
    pub fn invalid_loop(message: impl Into<String>) -> Self {
        Error::InvalidLoop(message.into())
    }

    /// Create a BadVirtualState error
    pub fn bad_virtual_state(message: impl Into<String>) -> Self {
        Error::BadVirtualState(message.into())
    }

    /// Create an Unsupported error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Error::Unsupported(message.into())
    }

    /// Create a parse error without source context
    pub fn parse_error(message: impl Into<String>, location: SourceLocation) -> Self {
        Error::Parse {
            message: message.into(),
            location,
            source_context: String::new(),
        }
    }

    /// Create a parse error that quotes the offending line
    pub fn parse_error_with_context(
        message: impl Into<String>,
        location: SourceLocation,
        source: &str,
    ) -> Self {
        Error::Parse {
            message: message.into(),
            source_context: format_error_context(source, &location),
            location,
        }
    }

    /// Create an interpreter error
    pub fn execution(message: impl Into<String>) -> Self {
        Error::Execution(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    /// Whether the caller may recover by discarding this trace
    pub fn is_invalid_loop(&self) -> bool {
        matches!(self, Error::InvalidLoop(_))
    }
}

/// Result type for optimizer operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = Error::invalid_loop("guard_value can never pass");
        assert_eq!(err.to_string(), "InvalidLoop: guard_value can never pass");
        assert!(err.is_invalid_loop());

        let err = Error::TagOverflow { guard: 3, entries: 10, limit: 4 };
        assert!(err.to_string().contains("guard 3"));
        assert!(!err.is_invalid_loop());
    }

    #[test]
    fn test_parse_error_context() {
        let source = "[i0]\ni1 = int_add(i0, )\n";
        let loc = SourceLocation { line: 2, column: 19 };
        let err = Error::parse_error_with_context("expected operand", loc, source);
        let msg = err.to_string();
        assert!(msg.contains("expected operand at 2:19"));
        assert!(msg.contains("i1 = int_add(i0, )"));
        assert!(msg.contains('^'));
    }

    #[test]
    fn test_context_out_of_range() {
        let loc = SourceLocation { line: 9, column: 1 };
        assert_eq!(format_error_context("one line", &loc), String::new());
    }
}
