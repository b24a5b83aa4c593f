// src/lib.rs - G-code loading, macro expansion and print job streaming
pub mod config;
pub mod cursor;
pub mod dispatch;
pub mod error;
pub mod expander;
pub mod file_manager;
pub mod gcode;
pub mod macros;
pub mod print_job;
pub mod print_stats;
pub mod reader;

pub use dispatch::{CommandHandler, Dispatcher};
pub use error::GCodeError;
pub use expander::MacroExpander;
pub use gcode::{Command, Line, parse_line};
pub use print_job::{EngineOptions, JobState, PrintEngine, PrintStatus};
