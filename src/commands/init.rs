//! `sandvault init`: scaffold a config file and the local state directory.
//!
//! Deciding what to write is pure (`plan`); touching the disk happens in
//! `apply` through caller-supplied closures so tests never need a tempdir.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::CONFIG_FILE;
use crate::templates;

/// Scaffolds into the current directory.
pub(crate) fn run(force: bool) -> Result<()> {
    let root = std::env::current_dir().context("Failed to get current directory")?;
    info!(root = %root.display(), force, "scaffolding sandvault project");

    let scaffold = scaffold();
    let steps = plan(&scaffold, force, |rel| root.join(rel).exists());
    apply(
        &steps,
        |dir| {
            fs::create_dir_all(root.join(dir))
                .with_context(|| format!("Failed to create directory: {}", dir.display()))
        },
        |rel, body| {
            fs::write(root.join(rel), body)
                .with_context(|| format!("Failed to write {}", rel.display()))
        },
    )?;

    print!("{}", render(&steps));
    Ok(())
}

struct Artifact {
    path: PathBuf,
    body: &'static str,
    purpose: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Create,
    Replace,
    /// Present on disk and `--force` was not given.
    Keep,
}

struct Step<'a> {
    artifact: &'a Artifact,
    action: Action,
}

fn scaffold() -> Vec<Artifact> {
    vec![
        Artifact {
            path: PathBuf::from(CONFIG_FILE),
            body: templates::SANDVAULT_TOML,
            purpose: "Coordinator configuration",
        },
        Artifact {
            path: PathBuf::from(".sandvault/.gitignore"),
            body: templates::STATE_GITIGNORE,
            purpose: "Keeps sandbox state and backup records out of git",
        },
    ]
}

fn plan<'a>(
    scaffold: &'a [Artifact],
    force: bool,
    present: impl Fn(&Path) -> bool,
) -> Vec<Step<'a>> {
    scaffold
        .iter()
        .map(|artifact| {
            let action = match (present(&artifact.path), force) {
                (false, _) => Action::Create,
                (true, true) => Action::Replace,
                (true, false) => Action::Keep,
            };
            Step { artifact, action }
        })
        .collect()
}

fn apply(
    steps: &[Step<'_>],
    mkdir: impl Fn(&Path) -> Result<()>,
    mut write: impl FnMut(&Path, &str) -> Result<()>,
) -> Result<()> {
    for step in steps.iter().filter(|s| s.action != Action::Keep) {
        let path = &step.artifact.path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            mkdir(parent)?;
        }
        write(path, step.artifact.body)?;
    }
    Ok(())
}

fn render(steps: &[Step<'_>]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "\n{} sandvault initialized successfully!\n",
        "✓".green().bold()
    );

    for step in steps {
        let path = step.artifact.path.display().to_string();
        let line = match step.action {
            Action::Create => format!("  {} {} - {}", "+".green(), path.cyan(), step.artifact.purpose),
            Action::Replace => format!("  {} {} (overwritten)", "↻".blue(), path),
            Action::Keep => format!(
                "  {} {} (already exists, use --force to overwrite)",
                "⊘".yellow(),
                path
            ),
        };
        let _ = writeln!(out, "{line}");
    }

    let _ = writeln!(out, "\n{}", "Next steps:".yellow().bold());
    let _ = writeln!(
        out,
        "  1. Export {} and {} for the durable store",
        "SANDVAULT_STORE_ACCESS_KEY".cyan(),
        "SANDVAULT_STORE_SECRET_KEY".cyan()
    );
    let _ = writeln!(
        out,
        "  2. Choose a provider and sandbox template in {}",
        CONFIG_FILE.cyan()
    );
    let _ = writeln!(
        out,
        "  3. Start {} and send JSON requests on stdin",
        "sandvault serve".green()
    );
    out
}
