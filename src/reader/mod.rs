//! Line sources: files, in-memory scripts and the comment filter that wraps them.

mod comment_filter;
mod file;
mod string;

pub use comment_filter::CommentFilter;
pub use file::FileSource;
pub use string::StringSource;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::GCodeError;
use crate::gcode::Line;

/// A resumable, seekable sequence of [`Line`]s.
#[async_trait]
pub trait LineSource: Send {
    /// Pull the next line, `Ok(None)` once the source is exhausted.
    async fn next_line(&mut self) -> Result<Option<Arc<Line>>, GCodeError>;

    /// Offset of the next line to be read.
    fn pos(&self) -> u64;

    async fn seek(&mut self, pos: u64) -> Result<(), GCodeError>;

    /// Release the underlying resource. Safe to call more than once.
    async fn close(&mut self);
}

#[async_trait]
impl<S: LineSource + ?Sized> LineSource for Box<S> {
    async fn next_line(&mut self) -> Result<Option<Arc<Line>>, GCodeError> {
        (**self).next_line().await
    }

    fn pos(&self) -> u64 {
        (**self).pos()
    }

    async fn seek(&mut self, pos: u64) -> Result<(), GCodeError> {
        (**self).seek(pos).await
    }

    async fn close(&mut self) {
        (**self).close().await
    }
}
