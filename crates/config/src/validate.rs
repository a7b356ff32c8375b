//! Semantic validation of a loaded configuration.

use crate::schema::{MIN_KDF_ITERATIONS, RecordsealConfig};

/// Record keys owned by the encryption envelope; they cannot be declared
/// sensitive because the envelope itself lives under them.
const RESERVED_FIELDS: &[&str] = &["id", "envelope", "encryptedData", "checksum"];

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation finding.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. `keys.kdf_iterations`
    pub path: String,
    pub message: String,
}

/// Outcome of [`validate`].
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    fn error(&mut self, path: &str, message: impl Into<String>) {
        self.push(Severity::Error, path, message);
    }

    fn warning(&mut self, path: &str, message: impl Into<String>) {
        self.push(Severity::Warning, path, message);
    }

    fn push(&mut self, severity: Severity, path: &str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path: path.to_string(),
            message: message.into(),
        });
    }
}

/// Check a configuration for values the encryption core cannot honor.
#[must_use]
pub fn validate(config: &RecordsealConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    if config.keys.kdf_iterations < MIN_KDF_ITERATIONS {
        result.error(
            "keys.kdf_iterations",
            format!(
                "{} iterations is below the minimum of {MIN_KDF_ITERATIONS}",
                config.keys.kdf_iterations
            ),
        );
    }
    if config.keys.cache_ttl_secs == 0 {
        result.warning(
            "keys.cache_ttl_secs",
            "a zero TTL disables the key cache; every access re-derives the wrapping key",
        );
    }
    if config.keys.client_id.trim().is_empty() {
        result.error("keys.client_id", "client id must not be empty");
    }

    if config.migration.max_attempts == 0 {
        result.error("migration.max_attempts", "at least one attempt is required");
    }
    if config.migration.progress_every == 0 {
        result.error("migration.progress_every", "progress cadence must be positive");
    }

    if config.backup.retention == 0 {
        result.error(
            "backup.retention",
            "retention of zero would delete the pre-migration safety backup",
        );
    }

    let fields = &config.fields;
    if fields.list_field.trim().is_empty() {
        result.error("fields.list_field", "list field name must not be empty");
    }
    for name in fields.sensitive.iter().chain(std::iter::once(&fields.list_field)) {
        if RESERVED_FIELDS.contains(&name.as_str()) {
            result.error(
                "fields.sensitive",
                format!("`{name}` is reserved for the encryption envelope"),
            );
        }
    }
    if fields.sensitive.contains(&fields.list_field) {
        result.error(
            "fields.list_field",
            format!(
                "`{}` cannot be both a sensitive field and the list field",
                fields.list_field
            ),
        );
    }

    result
}
