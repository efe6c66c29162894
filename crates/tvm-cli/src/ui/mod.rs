//! UI Module - terminal output concerns
//!
//! - [`theme`] - Colors, icons and size formatting
//! - [`progress`] - Progress line formatting
//! - [`output`] - The pipeline reporter and error printing
//! - [`table`] - Tables for installed versions and sources

pub mod output;
pub mod progress;
pub mod table;
pub mod theme;

pub use output::TerminalReporter;
pub use theme::Theme;
