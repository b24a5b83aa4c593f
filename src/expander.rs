//! Depth-first macro expansion over a line source.
//!
//! The expander pulls from the innermost active frame first. A line that
//! invokes a macro is replaced by the rendered body, which may itself invoke
//! further macros; `SDCARD_PRINT_FILE ... INCLUDE=1` splices another file in
//! the same way. When a frame runs dry it is popped and the parent resumes.

use async_stream::stream;
use futures_core::Stream;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::dispatch::Dispatcher;
use crate::error::GCodeError;
use crate::file_manager::FileInfo;
use crate::gcode::{Command, Line};
use crate::macros::MacroDefinition;
use crate::reader::{CommentFilter, FileSource, LineSource, StringSource};

pub const PRINT_FILE_COMMAND: &str = "SDCARD_PRINT_FILE";

#[derive(Debug, Clone, PartialEq, Eq)]
enum FrameKind {
    Macro(String),
    Include(PathBuf),
}

impl FrameKind {
    fn describe(&self) -> String {
        match self {
            FrameKind::Macro(name) => format!("Macro {}", name),
            FrameKind::Include(path) => format!("File '{}'", path.display()),
        }
    }
}

struct Frame {
    source: Box<dyn LineSource>,
    kind: FrameKind,
}

pub struct MacroExpander {
    base: Box<dyn LineSource>,
    base_path: Option<PathBuf>,
    stack: Vec<Frame>,
    dispatcher: Arc<Dispatcher>,
}

impl MacroExpander {
    /// Expand lines from `base`. Comment-only lines are dropped.
    pub fn new(base: impl LineSource + 'static, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            base: Box::new(CommentFilter::new(base)),
            base_path: None,
            stack: Vec::new(),
            dispatcher,
        }
    }

    pub async fn for_file(file: &FileInfo, dispatcher: Arc<Dispatcher>) -> Result<Self, GCodeError> {
        let source = FileSource::open(&file.path).await?.with_name(&file.name);
        let mut expander = Self::new(source, dispatcher);
        expander.base_path = Some(tokio::fs::canonicalize(&file.path).await?);
        Ok(expander)
    }

    pub fn for_script(script: &str, dispatcher: Arc<Dispatcher>) -> Self {
        Self::new(StringSource::new(script), dispatcher)
    }

    /// Number of active expansion frames.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Position of the base source; expansion frames do not advance it.
    pub fn pos(&self) -> u64 {
        self.base.pos()
    }

    pub async fn next_line(&mut self) -> Result<Option<Arc<Line>>, GCodeError> {
        loop {
            let Some(line) = self.pull().await? else {
                return Ok(None);
            };
            let Some(command) = line.command() else {
                continue;
            };
            if command.name() == PRINT_FILE_COMMAND && command.flag("INCLUDE") {
                self.push_include(&line, command)
                    .await
                    .map_err(|e| e.at_line(&line))?;
                continue;
            }
            if let Some(definition) = self.dispatcher.macros().lookup(command.name()).await {
                self.push_macro(&line, command, &definition)
                    .map_err(|e| e.at_line(&line))?;
                continue;
            }
            return Ok(Some(line));
        }
    }

    /// Next raw line from the innermost frame, popping exhausted frames.
    async fn pull(&mut self) -> Result<Option<Arc<Line>>, GCodeError> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return self.base.next_line().await;
            };
            if let Some(line) = frame.source.next_line().await? {
                return Ok(Some(line));
            }
            if let Some(mut finished) = self.stack.pop() {
                finished.source.close().await;
                debug!("Finished {}", finished.kind.describe());
            }
        }
    }

    fn check_recursion(&self, kind: &FrameKind) -> Result<(), GCodeError> {
        let in_base = match kind {
            FrameKind::Include(path) => self.base_path.as_ref() == Some(path),
            FrameKind::Macro(_) => false,
        };
        if in_base || self.stack.iter().any(|frame| &frame.kind == kind) {
            return Err(GCodeError::Recursion(kind.describe()));
        }
        Ok(())
    }

    fn push_macro(
        &mut self,
        line: &Arc<Line>,
        command: &Command,
        definition: &MacroDefinition,
    ) -> Result<(), GCodeError> {
        let kind = FrameKind::Macro(definition.alias().to_string());
        self.check_recursion(&kind)?;
        let context = definition.render_context(command);
        let script = self
            .dispatcher
            .templates()
            .render(definition.alias(), definition.template(), &context)?;
        debug!("Expanding {} at depth {}", definition.alias(), self.stack.len() + 1);
        let source = StringSource::for_macro(definition.alias(), &script, Some(Arc::clone(line)));
        self.stack.push(Frame {
            source: Box::new(CommentFilter::new(source)),
            kind,
        });
        Ok(())
    }

    async fn push_include(&mut self, line: &Arc<Line>, command: &Command) -> Result<(), GCodeError> {
        let filename = command.require("FILENAME")?;
        let file = self.dispatcher.files().resolve(filename, true).await?;
        let kind = FrameKind::Include(tokio::fs::canonicalize(&file.path).await?);
        self.check_recursion(&kind)?;
        let source = FileSource::open(&file.path)
            .await?
            .with_name(&file.name)
            .with_parent(Arc::clone(line));
        debug!("Including {} at depth {}", file.name, self.stack.len() + 1);
        self.stack.push(Frame {
            source: Box::new(CommentFilter::new(source)),
            kind,
        });
        Ok(())
    }

    async fn clear_stack(&mut self) {
        while let Some(mut frame) = self.stack.pop() {
            frame.source.close().await;
        }
    }

    /// Reposition the base source. Any expansion in progress is abandoned.
    pub async fn seek(&mut self, pos: u64) -> Result<(), GCodeError> {
        self.clear_stack().await;
        self.base.seek(pos).await
    }

    pub async fn close(&mut self) {
        self.clear_stack().await;
        self.base.close().await;
    }

    /// Consume the expander as a stream of lines. The stream ends after the
    /// first error.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<Arc<Line>, GCodeError>> + Send {
        stream! {
            loop {
                match self.next_line().await {
                    Ok(Some(line)) => yield Ok(line),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
            self.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_manager::FileManager;
    use crate::macros::HandlebarsEngine;

    async fn dispatcher_with(macros: &[(&str, &str)]) -> Arc<Dispatcher> {
        let dispatcher = Dispatcher::new(FileManager::new("."), Arc::new(HandlebarsEngine::new()));
        for (name, body) in macros {
            dispatcher
                .load_macro(MacroDefinition::new(name, body).unwrap())
                .await
                .unwrap();
        }
        dispatcher
    }

    async fn collect(expander: &mut MacroExpander) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = expander.next_line().await.unwrap() {
            out.push(line.text().to_string());
        }
        out
    }

    #[tokio::test]
    async fn test_depth_first_expansion() {
        let d = dispatcher_with(&[("A", "B\nC"), ("B", "X")]).await;
        let mut expander = MacroExpander::for_script("A\nD", d);
        assert_eq!(collect(&mut expander).await, vec!["X", "C", "D"]);
        assert_eq!(expander.depth(), 0);
    }

    #[tokio::test]
    async fn test_recursion_detected() {
        let d = dispatcher_with(&[("A", "B"), ("B", "A")]).await;
        let mut expander = MacroExpander::for_script("A", d);
        let err = expander.next_line().await.unwrap_err();
        assert!(matches!(err.kind(), GCodeError::Recursion(m) if m == "Macro A"));
        assert_eq!(err.to_string(), "Macro A called recursively");
        let backtrace = err.line().unwrap().backtrace();
        assert_eq!(backtrace, "  - B:1: A\n  - A:1: B\n  - script:1: A");
    }

    #[tokio::test]
    async fn test_params_reach_template() {
        let d = dispatcher_with(&[("MOVE", "G1 X{{params.X}} F{{params.SPEED}}")]).await;
        let mut expander = MacroExpander::for_script("MOVE X=5 SPEED=300", d);
        assert_eq!(collect(&mut expander).await, vec!["G1 X5 F300"]);
    }

    #[tokio::test]
    async fn test_seek_clears_expansion() {
        let d = dispatcher_with(&[("M", "G1 X1\nG1 X2")]).await;
        let mut expander = MacroExpander::for_script("M\nG28", d);
        assert_eq!(expander.next_line().await.unwrap().unwrap().text(), "G1 X1");
        assert_eq!(expander.depth(), 1);
        expander.seek(2).await.unwrap();
        assert_eq!(expander.depth(), 0);
        assert_eq!(expander.next_line().await.unwrap().unwrap().text(), "G28");
    }

    #[tokio::test]
    async fn test_include_guard_sees_through_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(
            dir.path().join("self.gcode"),
            "G28\nSDCARD_PRINT_FILE FILENAME=sub/../self.gcode INCLUDE=1\n",
        )
        .unwrap();
        let d = Dispatcher::new(FileManager::new(dir.path()), Arc::new(HandlebarsEngine::new()));
        let file = d.files().resolve("self.gcode", true).await.unwrap();
        let mut expander = MacroExpander::for_file(&file, d).await.unwrap();
        assert_eq!(expander.next_line().await.unwrap().unwrap().text(), "G28");
        let err = expander.next_line().await.unwrap_err();
        assert!(matches!(err.kind(), GCodeError::Recursion(_)));
        assert_eq!(expander.depth(), 0);
    }

    #[tokio::test]
    async fn test_comments_inside_macros_dropped() {
        let d = dispatcher_with(&[("M", "; hello\n\nG4 P1")]).await;
        let mut expander = MacroExpander::for_script("M ; call", d);
        assert_eq!(collect(&mut expander).await, vec!["G4 P1"]);
    }
}
