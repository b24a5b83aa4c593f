use async_trait::async_trait;
use std::sync::Arc;

use super::LineSource;
use crate::error::GCodeError;
use crate::gcode::Line;

/// Drops lines that carry no command (blank or comment-only).
pub struct CommentFilter<S> {
    inner: S,
}

impl<S: LineSource> CommentFilter<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: LineSource> LineSource for CommentFilter<S> {
    async fn next_line(&mut self) -> Result<Option<Arc<Line>>, GCodeError> {
        while let Some(line) = self.inner.next_line().await? {
            if line.command().is_some() {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }

    fn pos(&self) -> u64 {
        self.inner.pos()
    }

    async fn seek(&mut self, pos: u64) -> Result<(), GCodeError> {
        self.inner.seek(pos).await
    }

    async fn close(&mut self) {
        self.inner.close().await
    }
}
