use async_trait::async_trait;
use std::sync::Arc;

use super::LineSource;
use crate::error::GCodeError;
use crate::gcode::{Line, LineOrigin};

/// Serves lines out of an in-memory script, such as a rendered macro body.
///
/// Positions count characters, with one extra for each line terminator.
pub struct StringSource {
    lines: Vec<String>,
    next: usize,
    pos: u64,
    macro_name: Option<String>,
    parent: Option<Arc<Line>>,
}

impl StringSource {
    pub fn new(script: &str) -> Self {
        Self {
            lines: script.split('\n').map(str::to_string).collect(),
            next: 0,
            pos: 0,
            macro_name: None,
            parent: None,
        }
    }

    /// A rendered macro body; lines are tagged with the macro name and the invoking line.
    pub fn for_macro(name: &str, script: &str, parent: Option<Arc<Line>>) -> Self {
        Self {
            macro_name: Some(name.to_string()),
            parent,
            ..Self::new(script)
        }
    }

    fn origin(&self, number: usize) -> LineOrigin {
        match &self.macro_name {
            Some(name) => LineOrigin::Macro {
                name: name.clone(),
                number,
            },
            None => LineOrigin::Script { number },
        }
    }
}

fn line_len(line: &str) -> u64 {
    line.chars().count() as u64 + 1
}

#[async_trait]
impl LineSource for StringSource {
    async fn next_line(&mut self) -> Result<Option<Arc<Line>>, GCodeError> {
        let Some(raw) = self.lines.get(self.next) else {
            return Ok(None);
        };
        self.pos += line_len(raw);
        self.next += 1;
        let origin = self.origin(self.next);
        Ok(Some(Line::new(raw, origin, self.parent.clone())))
    }

    fn pos(&self) -> u64 {
        self.pos
    }

    /// Restart at the first line starting at or after `pos`.
    async fn seek(&mut self, pos: u64) -> Result<(), GCodeError> {
        let mut start = 0;
        let mut index = 0;
        while index < self.lines.len() && start < pos {
            start += line_len(&self.lines[index]);
            index += 1;
        }
        self.next = index;
        self.pos = start;
        Ok(())
    }

    async fn close(&mut self) {
        self.lines.clear();
        self.next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn numbers_lines_and_counts_positions() {
        let mut source = StringSource::for_macro("PRIME", "G92 E0\nG1 E10", None);
        let first = source.next_line().await.unwrap().unwrap();
        assert_eq!(first.to_string(), "  - PRIME:1: G92 E0");
        assert_eq!(source.pos(), 7);
        let second = source.next_line().await.unwrap().unwrap();
        assert_eq!(second.to_string(), "  - PRIME:2: G1 E10");
        assert!(source.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn seek_restarts_at_line_boundary() {
        let mut source = StringSource::new("A\nBB\nC");
        source.seek(2).await.unwrap();
        assert_eq!(source.next_line().await.unwrap().unwrap().text(), "BB");
        source.seek(3).await.unwrap();
        assert_eq!(source.pos(), 5);
        assert_eq!(source.next_line().await.unwrap().unwrap().text(), "C");
        source.seek(0).await.unwrap();
        assert_eq!(source.next_line().await.unwrap().unwrap().text(), "A");
        source.close().await;
        assert!(source.next_line().await.unwrap().is_none());
    }
}
