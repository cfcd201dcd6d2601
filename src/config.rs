//! Configuration file parsing
//!
//! Reads clean-db-structure.toml configuration files.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strum_macros::{Display, EnumString};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// How the `schema_migrations` seed block is ordered.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase", try_from = "RawOrder")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MigrationsOrder {
    /// Leave the block exactly as dumped.
    #[default]
    Off,
    /// Sort versions ascending. Versions are fixed-width timestamps, so this
    /// is chronological order.
    #[strum(to_string = "ascending", serialize = "asc")]
    Ascending,
    /// A reproducible pseudo-random order, derived from the set of versions.
    Jumbled,
}

impl MigrationsOrder {
    pub fn is_enabled(self) -> bool {
        self != MigrationsOrder::Off
    }
}

/// Accepts either a mode name or a boolean (`true` = ascending, `false` = off).
#[derive(Deserialize)]
#[serde(untagged)]
enum RawOrder {
    Flag(bool),
    Named(String),
}

impl TryFrom<RawOrder> for MigrationsOrder {
    type Error = String;

    fn try_from(raw: RawOrder) -> Result<Self, Self::Error> {
        match raw {
            RawOrder::Flag(true) => Ok(MigrationsOrder::Ascending),
            RawOrder::Flag(false) => Ok(MigrationsOrder::Off),
            RawOrder::Named(name) => name.parse().map_err(|_| {
                format!(
                    "invalid order_schema_migrations_values '{}'. Valid values: off, ascending, jumbled, true, false",
                    name
                )
            }),
        }
    }
}

/// Options controlling which passes run over a dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CleanOptions {
    /// Ordering applied to the `schema_migrations` seed block
    #[serde(default)]
    pub order_schema_migrations_values: MigrationsOrder,

    /// Move `CREATE INDEX` statements directly after their `CREATE TABLE`
    #[serde(default)]
    pub indexes_after_tables: bool,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub dump: DumpConfig,

    #[serde(default)]
    pub clean: CleanOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DumpConfig {
    /// Schema dump to clean when no path is given on the command line
    #[serde(default = "default_dump_path")]
    pub path: PathBuf,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            path: default_dump_path(),
        }
    }
}

fn default_dump_path() -> PathBuf {
    PathBuf::from("db/structure.sql")
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.dump.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "dump.path must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
