mod backup_commands;
mod config_commands;
mod records_commands;

use std::{path::PathBuf, sync::Arc};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    recordseal_config::RecordsealConfig,
    recordseal_metrics::{MetricsRecorderConfig, init_metrics},
    recordseal_vault::{InitOutcome, MigrationProgress, RecordVault, RunStatus},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "recordseal", about = "recordseal: encrypted record store tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery of recordseal.toml).
    #[arg(long, global = true, env = "RECORDSEAL_CONFIG")]
    config: Option<PathBuf>,

    /// Database file (overrides `storage.database_path`).
    #[arg(long, global = true, env = "RECORDSEAL_DB")]
    database: Option<PathBuf>,

    /// Print collected metrics in Prometheus format on exit.
    #[arg(long, global = true, default_value_t = false)]
    metrics: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the device master key, or health-check the existing one.
    Init,
    /// Read-only report on keys, records, migration and backups.
    Diagnose {
        /// Emit the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Encrypt any remaining plaintext records.
    Migrate,
    /// Delete all key material. Records encrypted under it become unreadable.
    Reset {
        /// Confirm the irreversible reset.
        #[arg(long)]
        yes: bool,
    },
    /// Record management.
    Records {
        #[command(subcommand)]
        action: records_commands::RecordAction,
    },
    /// Backup management.
    Backup {
        #[command(subcommand)]
        action: backup_commands::BackupAction,
    },
    /// Configuration inspection.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<RecordsealConfig> {
    let mut config = match &cli.config {
        Some(path) => recordseal_config::load_config(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => recordseal_config::discover_and_load(),
    };
    if let Some(db) = &cli.database {
        config.storage.database_path = Some(db.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);

    let metrics = init_metrics(MetricsRecorderConfig {
        enabled: cli.metrics,
        ..Default::default()
    })?;

    info!(version = env!("CARGO_PKG_VERSION"), "recordseal starting");

    let config = load_config(&cli)?;
    let result = run(cli.command, &config).await;

    if cli.metrics {
        eprintln!("{}", metrics.render());
    }
    result
}

/// Inspect the store without creating or changing anything.
async fn diagnose(config: &RecordsealConfig, json: bool) -> anyhow::Result<()> {
    let path = recordseal_config::default_database_path(config);
    let Some(vault) = RecordVault::open_read_only(config)
        .await
        .context("opening record store read-only")?
    else {
        println!("No database at {}.", path.display());
        return Ok(());
    };

    let report = vault.diagnose().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let k = &report.keys;
        println!("capability supported: {}", k.capability_supported);
        println!("key exists:           {}", k.key_exists);
        println!("key well-formed:      {}", k.key_well_formed);
        println!("salt exists:          {}", k.salt_exists);
        println!("unwrap succeeds:      {}", k.unwrap_succeeds);
        if let Some(strategy) = k.unwrap_strategy {
            println!("unwrap strategy:      {strategy}");
        }
        if let Some(status) = report.migration {
            println!("migration:            {status:?}");
        }
        println!(
            "records:              {} ({} encrypted)",
            report.records_total, report.records_encrypted
        );
        println!("backups:              {}", report.backups);
        for problem in k.problems.iter().chain(&report.problems) {
            println!("problem: {problem}");
        }
    }
    Ok(())
}

async fn run(command: Commands, config: &RecordsealConfig) -> anyhow::Result<()> {
    if let Commands::Config { action } = command {
        return config_commands::handle_config(action, config);
    }

    if let Commands::Diagnose { json } = command {
        return diagnose(config, json).await;
    }

    let vault = RecordVault::open(config)
        .await
        .context("opening record store")?
        .with_migration_progress(Arc::new(|p: &MigrationProgress| {
            eprintln!("  migrated {}/{} ({} errors)", p.processed, p.total, p.errors);
        }));

    match command {
        Commands::Init => match vault.ensure_key_system_ready().await? {
            InitOutcome::Created => println!("Master key created."),
            InitOutcome::Existing => println!("Master key present and healthy."),
            InitOutcome::Recreated => println!("Unusable master key replaced with a new one."),
        },
        Commands::Diagnose { .. } => {},
        Commands::Migrate => {
            let report = vault.run_migration_if_needed().await?;
            match report.status {
                RunStatus::AlreadyCompleted => println!("Migration already completed."),
                RunStatus::AlreadyRunning => println!("Migration is already running."),
                RunStatus::Completed | RunStatus::Incomplete => {
                    println!(
                        "Migrated {} of {} records, {} errors.",
                        report.migrated, report.total, report.errors
                    );
                    for e in &report.error_details {
                        println!(
                            "  {}: {} (after {} attempts{})",
                            e.record_id.as_deref().unwrap_or("?"),
                            e.message,
                            e.attempts,
                            if e.transient {
                                ", will retry"
                            } else {
                                ""
                            }
                        );
                    }
                },
            }
        },
        Commands::Reset { yes } => {
            if !yes {
                eprintln!(
                    "Refusing to reset without --yes. All records encrypted under the current key \
                     will become permanently unreadable."
                );
                std::process::exit(1);
            }
            vault.reset_key_system(true).await?;
            println!("Key system reset.");
        },
        Commands::Records { action } => records_commands::handle_records(action, &vault).await?,
        Commands::Backup { action } => backup_commands::handle_backup(action, &vault).await?,
        Commands::Config { .. } => {},
    }
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, clap::CommandFactory};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn database_flag_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("x.db");
        let cli = Cli::try_parse_from([
            "recordseal",
            "--database",
            db.to_str().unwrap(),
            "diagnose",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.storage.database_path, Some(db));
    }

    #[tokio::test]
    async fn diagnose_does_not_create_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("state").join("x.db");
        let mut config = RecordsealConfig::default();
        config.storage.database_path = Some(db.clone());

        diagnose(&config, true).await.unwrap();
        assert!(!db.exists());
        assert!(!dir.path().join("state").exists());
    }

    #[test]
    fn reset_parses_confirmation() {
        let cli = Cli::try_parse_from(["recordseal", "reset", "--yes"]).unwrap();
        assert!(matches!(cli.command, Commands::Reset { yes: true }));
    }
}
