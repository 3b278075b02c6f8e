//! Command-line interface

pub mod args;
pub mod builtins;
pub mod commands;

pub use args::{Cli, Commands};
