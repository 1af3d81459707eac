//! Use cases behind each `dacfg` sub-command.

pub mod commands;
pub mod watch;
