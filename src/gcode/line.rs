use std::fmt;
use std::sync::{Arc, OnceLock};

use super::parser::{Command, parse_line};

/// Where a [`Line`] came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOrigin {
    /// Byte offset of the line start within a file.
    File { name: Arc<str>, offset: u64 },
    /// 1-based line number within an ad hoc script.
    Script { number: usize },
    /// 1-based line number within a rendered macro body.
    Macro { name: String, number: usize },
}

impl fmt::Display for LineOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineOrigin::File { name, offset } => write!(f, "{}@{}", name, offset),
            LineOrigin::Script { number } => write!(f, "script:{}", number),
            LineOrigin::Macro { name, number } => write!(f, "{}:{}", name, number),
        }
    }
}

/// One line of G-code together with its provenance.
///
/// Lines produced by a macro expansion keep a reference to the line that
/// invoked the macro, so a failing line can report the full chain of
/// invocations that led to it. The parsed command is computed lazily and
/// cached.
#[derive(Debug)]
pub struct Line {
    text: String,
    origin: LineOrigin,
    parent: Option<Arc<Line>>,
    command: OnceLock<Option<Command>>,
}

impl Line {
    pub fn new(text: &str, origin: LineOrigin, parent: Option<Arc<Line>>) -> Arc<Self> {
        Arc::new(Self {
            text: text.trim().to_string(),
            origin,
            parent,
            command: OnceLock::new(),
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn origin(&self) -> &LineOrigin {
        &self.origin
    }

    pub fn parent(&self) -> Option<&Arc<Line>> {
        self.parent.as_ref()
    }

    pub fn command(&self) -> Option<&Command> {
        self.command.get_or_init(|| parse_line(&self.text)).as_ref()
    }

    pub fn name(&self) -> Option<&str> {
        self.command().map(Command::name)
    }

    /// This line followed by each invoking line, innermost first.
    pub fn ancestors(&self) -> impl Iterator<Item = &Line> {
        std::iter::successors(Some(self), |line| line.parent.as_deref())
    }

    pub fn backtrace(&self) -> String {
        self.ancestors()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  - {}: {}", self.origin, self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backtrace_lists_innermost_first() {
        let file = Line::new(
            "OUTER",
            LineOrigin::File { name: "part.gcode".into(), offset: 120 },
            None,
        );
        let outer = Line::new(
            "INNER",
            LineOrigin::Macro { name: "OUTER".into(), number: 1 },
            Some(file),
        );
        let inner = Line::new(
            "G1 X1",
            LineOrigin::Macro { name: "INNER".into(), number: 3 },
            Some(outer),
        );
        assert_eq!(
            inner.backtrace(),
            "  - INNER:3: G1 X1\n  - OUTER:1: INNER\n  - part.gcode@120: OUTER"
        );
        assert_eq!(inner.ancestors().count(), 3);
    }

    #[test]
    fn command_is_cached() {
        let line = Line::new("  G28 ; home  ", LineOrigin::Script { number: 1 }, None);
        assert_eq!(line.text(), "G28 ; home");
        assert_eq!(line.name(), Some("G28"));
        assert!(std::ptr::eq(line.command().unwrap(), line.command().unwrap()));
    }
}
