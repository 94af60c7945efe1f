//! Subcommand implementations.

mod build;
mod list;

pub use build::{cmd_build, BuildArgs};
pub use list::{cmd_list, ListArgs};
