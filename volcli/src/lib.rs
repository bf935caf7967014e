//! Operator command line for the config store: policies, volumes, mounts and
//! the global settings.

pub mod cli;
pub mod commands;
