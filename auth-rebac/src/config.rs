//! Engine configuration.
//!
//! Sources are layered with the `config` crate: built-in defaults, then an
//! optional YAML file, then `REBAC_`-prefixed environment variables
//! (`REBAC_STORE__BACKEND=postgres`). `DATABASE_URL` fills in the store URL
//! when nothing else set one.
//!
//! Environment values stay strings; serde parses the numeric fields from them.
//! `schema.expected_version` keeps its text as written, so `1.0` in YAML or in
//! `REBAC_SCHEMA__EXPECTED_VERSION` stays `"1.0"` and never becomes `"1"`.

use crate::check::DEFAULT_MAX_DEPTH;
use crate::error::{RebacError, Result};
use config::{Config, Environment, File, FileFormat};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lowest accepted recursion bound
pub const MIN_MAX_DEPTH: u32 = 8;

pub const DEFAULT_CONFIG_FILE: &str = "rebac.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RebacConfig {
    pub schema: SchemaConfig,
    pub engine: EngineConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Schema document (`.yaml`, `.json` or `.authz`); the bundled notes
    /// schema is used when unset
    pub path: Option<PathBuf>,

    /// Version the deployment expects to find; checked against the document
    #[serde(deserialize_with = "version_string")]
    pub expected_version: Option<String>,
}

/// Accept a version written as a string or as a bare YAML number
fn version_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct VersionVisitor;

    impl<'de> Visitor<'de> for VersionVisitor {
        type Value = Option<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a schema version such as \"1.0\"")
        }

        fn visit_none<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D: Deserializer<'de>>(
            self,
            deserializer: D,
        ) -> std::result::Result<Self::Value, D::Error> {
            deserializer.deserialize_any(self)
        }

        fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<Self::Value, E> {
            Ok(Some(value.to_string()))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> std::result::Result<Self::Value, E> {
            Ok(Some(value.to_string()))
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<Self::Value, E> {
            Ok(Some(value.to_string()))
        }

        // `{:?}` keeps the fractional part: 1.0 -> "1.0"
        fn visit_f64<E: de::Error>(self, value: f64) -> std::result::Result<Self::Value, E> {
            Ok(Some(format!("{:?}", value)))
        }
    }

    deserializer.deserialize_option(VersionVisitor)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_depth: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            database_url: None,
            max_connections: 10,
            max_retries: 3,
            retry_base_delay_ms: 50,
        }
    }
}

impl StoreConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl RebacConfig {
    /// Load from an explicit file (must exist) or `rebac.yaml` if present,
    /// then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false),
        };

        let settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("REBAC")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let mut config: RebacConfig = settings.try_deserialize()?;
        if config.store.database_url.is_none() {
            config.store.database_url = std::env::var("DATABASE_URL").ok();
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document without consulting files or the environment
    pub fn from_yaml_str(document: &str) -> Result<Self> {
        let config: RebacConfig = Config::builder()
            .add_source(File::from_str(document, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_depth < MIN_MAX_DEPTH {
            return Err(RebacError::Config(format!(
                "engine.max_depth must be at least {}, got {}",
                MIN_MAX_DEPTH, self.engine.max_depth
            )));
        }

        if self.store.backend == StoreBackend::Postgres {
            match self.store.database_url.as_deref() {
                Some(url) if !url.trim().is_empty() => {}
                _ => {
                    return Err(RebacError::Config(
                        "store.database_url (or DATABASE_URL) is required for the postgres backend"
                            .to_string(),
                    ))
                }
            }
            if self.store.max_connections == 0 {
                return Err(RebacError::Config(
                    "store.max_connections must be positive".to_string(),
                ));
            }
        }

        Ok(())
    }
}
