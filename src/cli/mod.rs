//! Command-line interface

pub mod args;
pub mod commands;

pub use args::{Args, SnapshotCommand, SubCommand};
pub use commands::Context;
