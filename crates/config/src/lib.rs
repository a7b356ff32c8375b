//! Configuration loading and validation for recordseal.
//!
//! Config file: `recordseal.toml` (or `.json`), searched in `./` then the
//! user config directory. Supports `${ENV_VAR}` substitution in all values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{
        config_dir, data_dir, default_database_path, discover_and_load, find_config_file,
        load_config,
    },
    schema::{
        BackupConfig, FieldsConfig, KeysConfig, MigrationConfig, RecordsealConfig, StorageConfig,
        MIN_KDF_ITERATIONS,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
