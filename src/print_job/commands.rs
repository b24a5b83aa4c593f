//! Job control commands (M20-M30, SDCARD_*) bound to a [`PrintEngine`].

use async_trait::async_trait;
use std::sync::{Arc, Weak};

use super::{EngineInner, PrintEngine};
use crate::dispatch::{CommandHandler, Dispatcher};
use crate::error::GCodeError;
use crate::gcode::Command;

#[derive(Debug, Clone, Copy)]
enum JobCommand {
    ListFiles,
    InitCard,
    SelectFile,
    StartResume,
    Pause,
    SetPosition,
    ReportStatus,
    WriteUnsupported,
    ResetFile,
    PrintFile,
}

const COMMANDS: &[(&str, JobCommand, Option<&str>)] = &[
    ("M20", JobCommand::ListFiles, None),
    ("M21", JobCommand::InitCard, None),
    ("M23", JobCommand::SelectFile, None),
    ("M24", JobCommand::StartResume, None),
    ("M25", JobCommand::Pause, None),
    ("M26", JobCommand::SetPosition, None),
    ("M27", JobCommand::ReportStatus, None),
    ("M28", JobCommand::WriteUnsupported, None),
    ("M29", JobCommand::WriteUnsupported, None),
    ("M30", JobCommand::WriteUnsupported, None),
    (
        "SDCARD_RESET_FILE",
        JobCommand::ResetFile,
        Some("Clears a loaded SD File. Stops the print if necessary"),
    ),
    (
        "SDCARD_PRINT_FILE",
        JobCommand::PrintFile,
        Some("Loads a SD file and starts the print. May include files in subdirectories."),
    ),
];

/// Handlers hold the engine weakly so the command table does not keep it alive.
struct JobCommandHandler {
    engine: Weak<EngineInner>,
    kind: JobCommand,
}

impl PrintEngine {
    /// Install the job control commands on the dispatcher.
    pub fn register_commands(&self) {
        for (name, kind, description) in COMMANDS {
            let handler = JobCommandHandler {
                engine: Arc::downgrade(&self.inner),
                kind: *kind,
            };
            self.inner
                .dispatcher
                .register_command(name, Arc::new(handler), *description);
        }
    }
}

#[async_trait]
impl CommandHandler for JobCommandHandler {
    async fn handle(&self, dispatcher: &Arc<Dispatcher>, command: &Command) -> Result<(), GCodeError> {
        let inner = self
            .engine
            .upgrade()
            .ok_or_else(|| GCodeError::Internal("print engine is gone".into()))?;
        let engine = PrintEngine { inner };
        match self.kind {
            JobCommand::ListFiles => {
                let files = dispatcher
                    .files()
                    .list_files(false)
                    .await
                    .map_err(|_| GCodeError::command("Unable to get file list"))?;
                dispatcher.respond_raw("Begin file list");
                for file in files {
                    dispatcher.respond_raw(&format!("{} {}", file.name, file.size));
                }
                dispatcher.respond_raw("End file list");
            }
            JobCommand::InitCard => dispatcher.respond_raw("SD card ok"),
            JobCommand::SelectFile => {
                let filename = command.raw_params().trim();
                let filename = filename.strip_prefix('/').unwrap_or(filename);
                engine.load_file(filename, false).await?;
            }
            JobCommand::StartResume => engine.resume().await?,
            JobCommand::Pause => engine.pause().await,
            JobCommand::SetPosition => {
                let pos = command
                    .get_parsed::<u64>("S")?
                    .ok_or_else(|| GCodeError::command("Error on 'M26': missing S"))?;
                engine.seek(pos).await?;
            }
            JobCommand::ReportStatus => {
                let status = engine.status().await;
                if status.file_path.is_none() {
                    dispatcher.respond_raw("Not SD printing.");
                } else {
                    dispatcher.respond_raw(&format!(
                        "SD printing byte {}/{}",
                        status.file_position, status.file_size
                    ));
                }
            }
            JobCommand::WriteUnsupported => {
                return Err(GCodeError::command("SD write not supported"));
            }
            JobCommand::ResetFile => engine.reset_file().await?,
            JobCommand::PrintFile => {
                if engine.is_active() {
                    return Err(GCodeError::Busy);
                }
                let filename = command.require("FILENAME")?;
                engine.load_file(filename, true).await?;
                engine.resume().await?;
            }
        }
        Ok(())
    }
}
