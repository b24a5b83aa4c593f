use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::GCodeError;
use crate::expander::MacroExpander;
use crate::gcode::Line;

/// Expanded view of an open file with lookahead and one step of pushback.
///
/// The print loop pulls a line before it knows whether it may dispatch it;
/// when it may not, [`FileCursor::backoff`] hands the same line back on the
/// next pull.
pub struct FileCursor {
    expander: MacroExpander,
    current: Option<Arc<Line>>,
    /// Lines read ahead, each with the base position before it was read.
    peeked: VecDeque<(Arc<Line>, u64)>,
    backed_off: bool,
}

impl FileCursor {
    pub fn new(expander: MacroExpander) -> Self {
        Self {
            expander,
            current: None,
            peeked: VecDeque::new(),
            backed_off: false,
        }
    }

    pub async fn next_line(&mut self) -> Result<Option<Arc<Line>>, GCodeError> {
        if self.backed_off {
            self.backed_off = false;
            return Ok(self.current.clone());
        }
        let line = match self.peeked.pop_front() {
            Some((line, _)) => Some(line),
            None => self.expander.next_line().await?,
        };
        self.current = line.clone();
        Ok(line)
    }

    /// The most recently consumed line. Before anything has been consumed,
    /// reads ahead one line without consuming it.
    pub async fn current(&mut self) -> Result<Option<Arc<Line>>, GCodeError> {
        if self.current.is_some() {
            return Ok(self.current.clone());
        }
        self.fill(1).await?;
        Ok(self.peeked.front().map(|(line, _)| Arc::clone(line)))
    }

    /// Make the next pull return the current line again. Backing off twice
    /// without a pull in between, or before anything was consumed, fails.
    pub fn backoff(&mut self) -> Result<(), GCodeError> {
        if self.backed_off {
            return Err(GCodeError::Internal("cannot back off more than one line".into()));
        }
        if self.current.is_none() {
            return Err(GCodeError::Internal("cannot back off before the first line".into()));
        }
        self.backed_off = true;
        Ok(())
    }

    /// Position of the next unconsumed line; lookahead does not move it.
    pub fn pos(&self) -> u64 {
        self.peeked
            .front()
            .map_or_else(|| self.expander.pos(), |&(_, pos)| pos)
    }

    pub async fn seek(&mut self, pos: u64) -> Result<(), GCodeError> {
        self.current = None;
        self.peeked.clear();
        self.backed_off = false;
        self.expander.seek(pos).await
    }

    pub async fn close(&mut self) {
        self.current = None;
        self.peeked.clear();
        self.backed_off = false;
        self.expander.close().await;
    }

    /// Up to `count` upcoming lines. They stay queued for later pulls.
    pub async fn lookahead(&mut self, count: usize) -> Result<Vec<Arc<Line>>, GCodeError> {
        self.fill(count).await?;
        Ok(self
            .peeked
            .iter()
            .take(count)
            .map(|(line, _)| Arc::clone(line))
            .collect())
    }

    async fn fill(&mut self, count: usize) -> Result<(), GCodeError> {
        while self.peeked.len() < count {
            let pos = self.expander.pos();
            match self.expander.next_line().await? {
                Some(line) => self.peeked.push_back((line, pos)),
                None => break,
            }
        }
        Ok(())
    }
}
