//! Command-line and interactive command handling

pub mod interactive;
pub mod parser;

// Re-exports (used by main.rs)
pub use interactive::InteractiveCommand;
pub use parser::*;
