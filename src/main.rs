// src/main.rs - gcode-loader command line
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use std::path::Path;
use std::sync::Arc;

use krusty_loader::config::{LoaderConfig, load_config};
use krusty_loader::print_stats::PrintStatsTracker;
use krusty_loader::{
    Command, CommandHandler, Dispatcher, EngineOptions, GCodeError, JobState, MacroExpander,
    PrintEngine,
};

#[derive(Parser)]
#[command(name = "gcode-loader", version, about = "List, expand and stream G-code files")]
struct Cli {
    /// Loader configuration (TOML). Defaults apply when the file is missing.
    #[arg(short, long, default_value = "loader.toml")]
    config: String,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// List printable files
    List {
        #[arg(short, long)]
        recursive: bool,
    },
    /// Print the fully expanded lines of a file
    Expand { file: String },
    /// Stream a file through the print loop; Ctrl-C cancels
    Print { file: String },
}

/// Stand-in motion backend: echoes every command it receives.
struct EchoBackend;

#[async_trait]
impl CommandHandler for EchoBackend {
    async fn handle(&self, _dispatcher: &Arc<Dispatcher>, command: &Command) -> Result<(), GCodeError> {
        println!("{}", command);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_writer(std::io::stderr)
        .init();

    let config = if Path::new(&cli.config).exists() {
        tracing::info!("Loading configuration from: {}", cli.config);
        load_config(&cli.config)?
    } else {
        tracing::info!("No configuration at {}, using defaults", cli.config);
        LoaderConfig::default()
    };

    let dispatcher = Dispatcher::from_config(&config);
    dispatcher.set_default_handler(Arc::new(EchoBackend));
    let engine = PrintEngine::new(
        Arc::clone(&dispatcher),
        Arc::new(PrintStatsTracker::new()),
        EngineOptions::from(&config.loader),
    );
    engine.register_commands();
    dispatcher.load_macro_configs(&config.macros).await?;

    match cli.command {
        CliCommand::List { recursive } => {
            for file in dispatcher.files().list_files(recursive).await? {
                println!("{} {}", file.name, file.size);
            }
        }
        CliCommand::Expand { file } => {
            let file = dispatcher.files().resolve(&file, true).await?;
            let expander = MacroExpander::for_file(&file, Arc::clone(&dispatcher)).await?;
            let lines = expander.into_stream();
            tokio::pin!(lines);
            while let Some(line) = lines.next().await {
                println!("{}", line?.text());
            }
        }
        CliCommand::Print { file } => {
            let _watcher = engine.watch_shutdown();
            let mut responses = dispatcher.subscribe();
            let echo = tokio::spawn(async move {
                while let Ok(message) = responses.recv().await {
                    eprintln!("{}", message);
                }
            });

            engine.load_file(&file, true).await?;
            engine.resume().await?;
            tokio::select! {
                _ = engine.wait() => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted, cancelling print");
                    engine.cancel().await;
                }
            }

            let status = engine.status().await;
            tracing::info!("Final state {:?} at {}/{} bytes", engine.state(), status.file_position, status.file_size);
            echo.abort();
            if let JobState::Error(message) = engine.state() {
                return Err(message.into());
            }
        }
    }

    Ok(())
}
