use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;

use crate::config::{expand_path, Config};
use crate::store::{BackupRecord, FileMetadataStore, ProjectMetadata};

/// Prints every project that has a backup on record.
pub async fn run(config: &Config) -> Result<()> {
    let store = FileMetadataStore::new(expand_path(&config.metadata.path)?);
    let records = store.records().await?;
    print!("{}", format_records(&records));
    Ok(())
}

fn format_records(records: &[BackupRecord]) -> String {
    let mut out = String::new();

    if records.is_empty() {
        let _ = writeln!(out, "\n{} No projects have been backed up yet.", "ℹ".blue());
        let _ = writeln!(out, "  Run {} to start coordinating.", "sandvault serve".green());
        return out;
    }

    let _ = writeln!(out, "\n{}", "━".repeat(60).dimmed());
    let _ = writeln!(out, "{}", "   Backed-up projects".yellow().bold());
    let _ = writeln!(out, "{}", "━".repeat(60).dimmed());

    let user_width = records.iter().map(|r| r.user_id.len()).max().unwrap_or(0).max(4);
    let project_width = records
        .iter()
        .map(|r| r.project_id.len())
        .max()
        .unwrap_or(0)
        .max(7);

    let _ = writeln!(
        out,
        "  {:user_width$}  {:project_width$}  {}",
        "USER".dimmed(),
        "PROJECT".dimmed(),
        "LAST BACKUP".dimmed()
    );
    for record in records {
        let _ = writeln!(
            out,
            "  {:user_width$}  {:project_width$}  {}",
            record.user_id,
            record.project_id.cyan(),
            record
                .last_backup_at
                .format("%Y-%m-%d %H:%M:%S UTC")
                .to_string()
                .green()
        );
    }
    let _ = writeln!(out, "{}", "━".repeat(60).dimmed());
    let _ = writeln!(out, "  {} projects", records.len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_format_empty() {
        let out = format_records(&[]);
        assert!(out.contains("No projects"));
    }

    #[test]
    fn test_format_records() {
        let records = vec![BackupRecord {
            user_id: "alice".to_string(),
            project_id: "landing-page".to_string(),
            path: "/mnt/sandvault/alice/landing-page".to_string(),
            last_backup_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap(),
        }];
        let out = format_records(&records);
        assert!(out.contains("alice"));
        assert!(out.contains("landing-page"));
        assert!(out.contains("2026-03-01 12:30:00 UTC"));
        assert!(out.contains("1 projects"));
    }
}
