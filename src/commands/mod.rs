//! CLI command implementations.
//!
//! Each submodule implements one sandvault subcommand, with formatting
//! and core logic kept apart from IO where that makes it testable.

pub mod hash;
pub mod init;
pub mod purge;
pub mod serve;
pub mod status;
