//! Embedded templates written by `sandvault init`.

/// Default `sandvault.toml` configuration.
pub(crate) const SANDVAULT_TOML: &str = include_str!("sandvault.toml");

/// Keeps process state out of version control.
pub(crate) const STATE_GITIGNORE: &str = "*\n";
