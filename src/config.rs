//! Project configuration.
//!
//! [`LockstepConfig`] is loaded from `lockstep.toml` (optional) and
//! `LOCKSTEP__*` environment variables. It answers the two questions the
//! migration subsystem asks of its environment: which database URL belongs to
//! an environment, and where the migration files live.
//!
//! ```toml
//! [project]
//! name = "billing"
//!
//! [migrations]
//! directory = "supabase/migrations"
//! format = "sql"
//!
//! [environments.local]
//! url_env = "DATABASE_URL"
//!
//! [environments.production]
//! url_secret = "billing_database_url"
//! ```

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "lockstep.toml";

/// Directory Docker mounts secrets into
const SECRETS_DIR: &str = "/run/secrets";

#[derive(Debug, Clone, Deserialize)]
pub struct LockstepConfig {
    pub project: ProjectSettings,
    #[serde(default)]
    pub migrations: MigrationSettings,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentSettings>,
    /// Environments on which destructive operations are always refused
    #[serde(default = "default_protected_environments")]
    pub protected_environments: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectSettings {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationSettings {
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// `sql` (direct executor) or `supabase` (delegated executor)
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_tracking_table")]
    pub tracking_table: String,
    #[serde(default = "default_tracking_schema")]
    pub tracking_schema: String,
    /// Force the delegated executor even with `format = "sql"`
    #[serde(default)]
    pub use_supabase_cli: bool,
    #[serde(default = "default_lock_timeout_seconds")]
    pub lock_timeout_seconds: u64,
    #[serde(default)]
    pub drift_policy: DriftPolicy,
    /// Supabase CLI executable, when it is not `supabase` on `PATH`
    #[serde(default)]
    pub supabase_binary: Option<String>,
}

/// What `apply` does when an applied migration's file no longer matches its recorded checksum
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftPolicy {
    /// Report the drift and continue
    #[default]
    Warn,
    /// Refuse to apply anything until the drift is resolved
    Block,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentSettings {
    /// Inline database URL
    #[serde(default)]
    pub url: Option<String>,
    /// Name of the environment variable holding the URL
    #[serde(default)]
    pub url_env: Option<String>,
    /// Name of the Docker secret holding the URL
    #[serde(default)]
    pub url_secret: Option<String>,
    /// Mark this environment as production regardless of its name
    #[serde(default)]
    pub production: bool,
}

fn default_directory() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_format() -> String {
    "sql".to_string()
}

fn default_tracking_table() -> String {
    "schema_migrations".to_string()
}

fn default_tracking_schema() -> String {
    "public".to_string()
}

fn default_lock_timeout_seconds() -> u64 {
    60
}

fn default_protected_environments() -> Vec<String> {
    vec!["production".to_string()]
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            format: default_format(),
            tracking_table: default_tracking_table(),
            tracking_schema: default_tracking_schema(),
            use_supabase_cli: false,
            lock_timeout_seconds: default_lock_timeout_seconds(),
            drift_policy: DriftPolicy::default(),
            supabase_binary: None,
        }
    }
}

impl LockstepConfig {
    /// Build a configuration in code, with default migration settings
    #[must_use]
    pub fn new(project_name: impl Into<String>, migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            project: ProjectSettings {
                name: project_name.into(),
            },
            migrations: MigrationSettings {
                directory: migrations_dir.into(),
                ..MigrationSettings::default()
            },
            environments: BTreeMap::new(),
            protected_environments: default_protected_environments(),
        }
    }

    /// Register an environment with an inline URL
    #[must_use]
    pub fn with_environment_url(mut self, environment: &str, url: impl Into<String>) -> Self {
        self.environments.insert(
            environment.to_string(),
            EnvironmentSettings {
                url: Some(url.into()),
                ..EnvironmentSettings::default()
            },
        );
        self
    }

    /// Load from `lockstep.toml` in the working directory, falling back to env vars
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if neither source yields a valid configuration.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Load from the given file (optional) layered under `LOCKSTEP__*` env vars
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration cannot be built or is missing
    /// required keys such as `project.name`.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix("LOCKSTEP").separator("__"));

        let settings = match builder.build() {
            Ok(cfg) => cfg,
            Err(err) => {
                if path.exists() {
                    log::warn!(
                        "Failed to load {}, falling back to environment only: {err}",
                        path.display()
                    );
                }
                Config::builder()
                    .add_source(Environment::with_prefix("LOCKSTEP").separator("__"))
                    .build()
                    .map_err(|env_err| {
                        ConfigError::Message(format!(
                            "Failed to load configuration from file and env: {err}, then env-only error: {env_err}"
                        ))
                    })?
            }
        };

        settings.try_deserialize::<LockstepConfig>().map_err(|e| {
            ConfigError::Message(format!("Lockstep configuration is invalid: {e}"))
        })
    }

    /// Database URL for `environment`, if one is configured and resolvable
    ///
    /// Resolution order: inline `url`, then the variable named by `url_env`,
    /// then the Docker secret named by `url_secret`.
    #[must_use]
    pub fn database_url(&self, environment: &str) -> Option<String> {
        let settings = self.environments.get(environment)?;

        if let Some(url) = settings.url.as_ref().filter(|u| !u.trim().is_empty()) {
            return Some(url.clone());
        }

        if let Some(var) = &settings.url_env {
            return std::env::var(var).ok().filter(|u| !u.trim().is_empty());
        }

        if let Some(secret) = &settings.url_secret {
            let secret_path = Path::new(SECRETS_DIR).join(secret);
            return std::fs::read_to_string(secret_path)
                .ok()
                .map(|contents| contents.trim().to_string())
                .filter(|u| !u.is_empty());
        }

        None
    }

    /// Directory holding the migration files
    #[must_use]
    pub fn migrations_directory(&self) -> &Path {
        &self.migrations.directory
    }

    /// Whether `environment` is a designated production environment
    #[must_use]
    pub fn is_production(&self, environment: &str) -> bool {
        self.protected_environments.iter().any(|e| e == environment)
            || self
                .environments
                .get(environment)
                .is_some_and(|settings| settings.production)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = LockstepConfig::new("app", "db/migrations");
        assert_eq!(config.migrations.format, "sql");
        assert_eq!(config.migrations.tracking_table, "schema_migrations");
        assert_eq!(config.migrations.tracking_schema, "public");
        assert_eq!(config.migrations.lock_timeout_seconds, 60);
        assert_eq!(config.migrations.drift_policy, DriftPolicy::Warn);
        assert!(config.migrations.supabase_binary.is_none());
        assert_eq!(config.migrations_directory(), Path::new("db/migrations"));
    }

    #[test]
    fn test_database_url_missing_environment() {
        let config = LockstepConfig::new("app", "migrations");
        assert_eq!(config.database_url("local"), None);
    }

    #[test]
    fn test_database_url_inline() {
        let config = LockstepConfig::new("app", "migrations")
            .with_environment_url("local", "postgres://localhost/app");
        assert_eq!(
            config.database_url("local").as_deref(),
            Some("postgres://localhost/app")
        );
    }

    #[test]
    fn test_database_url_from_unset_variable() {
        let mut config = LockstepConfig::new("app", "migrations");
        config.environments.insert(
            "staging".to_string(),
            EnvironmentSettings {
                url_env: Some("LOCKSTEP_TEST_SURELY_UNSET_VARIABLE".to_string()),
                ..EnvironmentSettings::default()
            },
        );
        assert_eq!(config.database_url("staging"), None);
    }

    #[test]
    fn test_is_production() {
        let mut config = LockstepConfig::new("app", "migrations");
        assert!(config.is_production("production"));
        assert!(!config.is_production("staging"));

        config.environments.insert(
            "prod-eu".to_string(),
            EnvironmentSettings {
                production: true,
                ..EnvironmentSettings::default()
            },
        );
        assert!(config.is_production("prod-eu"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockstep.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[project]
name = "billing"

[migrations]
directory = "supabase/migrations"
format = "supabase"
drift_policy = "block"
supabase_binary = "/opt/supabase/bin/supabase"

[environments.local]
url = "postgres://localhost/billing"
"#
        )
        .unwrap();

        let config = LockstepConfig::load_from(&path).unwrap();
        assert_eq!(config.project.name, "billing");
        assert_eq!(config.migrations.format, "supabase");
        assert_eq!(config.migrations.drift_policy, DriftPolicy::Block);
        assert_eq!(config.migrations.supabase_binary.as_deref(), Some("/opt/supabase/bin/supabase"));
        assert_eq!(config.migrations.tracking_table, "schema_migrations");
        assert_eq!(
            config.database_url("local").as_deref(),
            Some("postgres://localhost/billing")
        );
    }
}
