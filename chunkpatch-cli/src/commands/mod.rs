//! CLI command implementations.

pub mod check;
pub mod common;
pub mod config;
pub mod disk;
pub mod init;
pub mod patch;
