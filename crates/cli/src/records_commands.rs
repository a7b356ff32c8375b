use std::path::PathBuf;

use {
    anyhow::{Context, Result, bail},
    clap::Subcommand,
    recordseal_vault::RecordVault,
    serde_json::Value,
};

#[derive(Subcommand)]
pub enum RecordAction {
    /// Encrypt and store a record (JSON object with an `id`).
    Put {
        /// Inline JSON record.
        #[arg(long, conflicts_with = "file")]
        json: Option<String>,
        /// Read the record from a JSON file.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Decrypt and print a record.
    Get { id: String },
    /// List record ids and whether each is encrypted.
    List,
    /// Delete a record.
    Delete { id: String },
}

pub async fn handle_records(action: RecordAction, vault: &RecordVault) -> Result<()> {
    match action {
        RecordAction::Put { json, file } => {
            let raw = match (json, file) {
                (Some(json), _) => json,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => bail!("pass --json or --file"),
            };
            let record: Value = serde_json::from_str(&raw).context("record is not valid JSON")?;
            let saved = vault.save_record(&record).await?;
            println!("Saved record {} ({}).", saved.id()?, saved.envelope.algorithm);
        },
        RecordAction::Get { id } => match vault.load_record(&id).await? {
            Some(loaded) => {
                for warning in &loaded.warnings {
                    eprintln!("warning: {warning}");
                }
                if !loaded.encrypted {
                    eprintln!("note: record {id} is not encrypted yet");
                }
                println!("{}", serde_json::to_string_pretty(&loaded.record)?);
            },
            None => bail!("record {id} not found"),
        },
        RecordAction::List => {
            let records = vault.load_all_records().await?;
            if records.is_empty() {
                println!("No records.");
            }
            for loaded in &records {
                let id = loaded
                    .record
                    .get("id")
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "?".into());
                let state = if loaded.encrypted {
                    "encrypted"
                } else {
                    "plaintext"
                };
                println!("  {id}  {state}");
            }
        },
        RecordAction::Delete { id } => {
            if vault.delete_record(&id).await? {
                println!("Deleted record {id}.");
            } else {
                println!("Record {id} not found.");
            }
        },
    }
    Ok(())
}
