//! Error taxonomy shared by the parser, the expansion pipeline and the print engine.

use std::sync::Arc;
use thiserror::Error;

use crate::gcode::Line;

#[derive(Debug, Error)]
pub enum GCodeError {
    #[error("Malformed command: {0}")]
    Parse(String),
    #[error("G-Code macro '{0}' already registered")]
    DuplicateMacro(String),
    #[error("{0}")]
    Config(String),
    #[error("{0} called recursively")]
    Recursion(String),
    #[error("File '{0}' not found")]
    FileNotFound(String),
    #[error("{0}")]
    Command(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("SD busy")]
    Busy,
    #[error("No file loaded")]
    NotLoaded,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// An error raised while handling a specific line; carries the line for backtraces.
    #[error("{source}")]
    AtLine {
        source: Box<GCodeError>,
        line: Arc<Line>,
    },
}

impl GCodeError {
    pub fn command(message: impl Into<String>) -> Self {
        GCodeError::Command(message.into())
    }

    /// Tag the error with the line it originated from. An already tagged error
    /// keeps its innermost line.
    pub fn at_line(self, line: &Arc<Line>) -> Self {
        match self {
            tagged @ GCodeError::AtLine { .. } => tagged,
            other => GCodeError::AtLine {
                source: Box::new(other),
                line: Arc::clone(line),
            },
        }
    }

    /// The underlying error with any line tagging removed.
    pub fn kind(&self) -> &GCodeError {
        match self {
            GCodeError::AtLine { source, .. } => source.kind(),
            other => other,
        }
    }

    pub fn line(&self) -> Option<&Arc<Line>> {
        match self {
            GCodeError::AtLine { line, .. } => Some(line),
            _ => None,
        }
    }

    /// Internal failures may leave shared state inconsistent and halt the host;
    /// everything else is a structured command error that only aborts the job.
    pub fn is_internal(&self) -> bool {
        matches!(self.kind(), GCodeError::Internal(_) | GCodeError::Io(_))
    }

    /// Human readable message including the line backtrace, if any.
    pub fn report(&self) -> String {
        match self.line() {
            Some(line) => format!("{}. Backtrace:\n{}", self, line.backtrace()),
            None => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcode::{Line, LineOrigin};

    #[test]
    fn at_line_keeps_innermost_line() {
        let outer = Line::new("OUTER", LineOrigin::Script { number: 1 }, None);
        let inner = Line::new(
            "G1 X1",
            LineOrigin::Macro { name: "OUTER".into(), number: 2 },
            Some(outer.clone()),
        );
        let err = GCodeError::command("boom").at_line(&inner).at_line(&outer);
        assert_eq!(err.line().map(|l| l.text()), Some("G1 X1"));
        assert!(matches!(err.kind(), GCodeError::Command(_)));
        assert!(!err.is_internal());
    }

    #[test]
    fn report_appends_backtrace() {
        let line = Line::new("M999", LineOrigin::Script { number: 3 }, None);
        let err = GCodeError::Internal("bad state".into()).at_line(&line);
        assert!(err.is_internal());
        assert_eq!(
            err.report(),
            "Internal error: bad state. Backtrace:\n  - script:3: M999"
        );
    }
}
