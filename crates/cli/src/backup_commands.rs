use std::path::PathBuf;

use {
    anyhow::{Context, Result},
    clap::Subcommand,
    recordseal_vault::{Backup, BackupKind, RecordVault, validate_backup},
};

#[derive(Subcommand)]
pub enum BackupAction {
    /// Snapshot all stored records.
    Create {
        /// auto, manual or pre-migration.
        #[arg(long, default_value = "manual")]
        kind: String,
    },
    /// List stored backups, newest first.
    List,
    /// Write a backup to a file.
    Export {
        path: PathBuf,
        /// Backup id; defaults to the latest backup.
        #[arg(long)]
        id: Option<String>,
    },
    /// Validate a backup file and restore its records.
    Import { path: PathBuf },
    /// Check a backup file's checksum without restoring it.
    Validate { path: PathBuf },
}

pub async fn handle_backup(action: BackupAction, vault: &RecordVault) -> Result<()> {
    match action {
        BackupAction::Create { kind } => {
            let kind: BackupKind = kind.parse()?;
            let backup = vault.create_backup(kind).await?;
            println!("Created {} backup {} ({} records).", backup.kind, backup.id, backup.count);
        },
        BackupAction::List => {
            let backups = vault.list_backups().await?;
            if backups.is_empty() {
                println!("No backups.");
            }
            for b in &backups {
                let status = if validate_backup(b) {
                    "ok"
                } else {
                    "INVALID"
                };
                println!("  {}  {:<13}  {:>5} records  {status}", b.id, b.kind.as_str(), b.count);
            }
        },
        BackupAction::Export { path, id } => {
            let backup = vault.export_backup_to_file(id.as_deref(), &path).await?;
            println!("Exported backup {} to {}.", backup.id, path.display());
        },
        BackupAction::Import { path } => {
            let restored = vault.restore_backup_from_file(&path).await?;
            println!("Restored {restored} records from {}.", path.display());
        },
        BackupAction::Validate { path } => {
            let raw = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let backup: Backup = serde_json::from_slice(&raw)
                .with_context(|| format!("{} is not a backup file", path.display()))?;
            if validate_backup(&backup) {
                println!("Backup {} is valid ({} records).", backup.id, backup.count);
            } else {
                eprintln!("Backup {} failed checksum validation.", backup.id);
                std::process::exit(1);
            }
        },
    }
    Ok(())
}
