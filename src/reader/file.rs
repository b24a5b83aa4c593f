use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

use super::LineSource;
use crate::error::GCodeError;
use crate::gcode::{Line, LineOrigin};

/// Reads a G-code file line by line, tracking the byte offset of each line.
pub struct FileSource {
    path: PathBuf,
    name: Arc<str>,
    reader: Option<BufReader<File>>,
    parent: Option<Arc<Line>>,
    pos: u64,
    buf: Vec<u8>,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, GCodeError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        let name: Arc<str> = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string())
            .into();
        Ok(Self {
            path,
            name,
            reader: Some(BufReader::new(file)),
            parent: None,
            pos: 0,
            buf: Vec::with_capacity(256),
        })
    }

    /// Name shown in backtraces for lines of this file.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.into();
        self
    }

    /// Attach every produced line to the line that included this file.
    pub fn with_parent(mut self, parent: Arc<Line>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_none()
    }
}

#[async_trait]
impl LineSource for FileSource {
    async fn next_line(&mut self) -> Result<Option<Arc<Line>>, GCodeError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        self.buf.clear();
        let offset = self.pos;
        let read = reader.read_until(b'\n', &mut self.buf).await?;
        if read == 0 {
            return Ok(None);
        }
        self.pos += read as u64;
        let text = String::from_utf8_lossy(&self.buf);
        Ok(Some(Line::new(
            &text,
            LineOrigin::File {
                name: Arc::clone(&self.name),
                offset,
            },
            self.parent.clone(),
        )))
    }

    fn pos(&self) -> u64 {
        self.pos
    }

    async fn seek(&mut self, pos: u64) -> Result<(), GCodeError> {
        let reader = self.reader.as_mut().ok_or_else(|| {
            GCodeError::Internal(format!("seek on closed file {}", self.path.display()))
        })?;
        reader.seek(SeekFrom::Start(pos)).await?;
        self.pos = pos;
        Ok(())
    }

    async fn close(&mut self) {
        if self.reader.take().is_some() {
            tracing::debug!("Closed {}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn tracks_offsets_and_seeks() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(tmp, "G28\nG1 X1\r\nM400").unwrap();
        let mut source = FileSource::open(tmp.path()).await.unwrap();

        let first = source.next_line().await.unwrap().unwrap();
        assert_eq!(first.text(), "G28");
        assert_eq!(source.pos(), 4);
        let second = source.next_line().await.unwrap().unwrap();
        assert_eq!(second.text(), "G1 X1");
        assert!(matches!(second.origin(), LineOrigin::File { offset: 4, .. }));
        let third = source.next_line().await.unwrap().unwrap();
        assert_eq!(third.text(), "M400");
        assert!(source.next_line().await.unwrap().is_none());

        source.seek(4).await.unwrap();
        assert_eq!(source.next_line().await.unwrap().unwrap().text(), "G1 X1");

        source.close().await;
        source.close().await;
        assert!(source.is_closed());
        assert!(source.next_line().await.unwrap().is_none());
        assert!(source.seek(0).await.is_err());
    }
}
