//! Command-line interface

pub mod args;
pub mod commands;
mod debugger;

pub use args::{Cli, Commands};
