//! Writer settings using Figment.
//!
//! Settings are loaded from:
//! 1. `config/nxswriter.toml` (or an explicit path)
//! 2. Environment variables prefixed with `NXSWRITER_`, nested keys separated by `__`
//!
//! Every key has a default, so an absent file yields a working in-memory setup.
//!
//! # Example
//! ```no_run
//! use nexus_writer::config::WriterSettings;
//!
//! let settings = WriterSettings::load()?;
//! settings.validate()?;
//! println!("backend: {}", settings.storage.backend);
//! # Ok::<(), nexus_writer::error::WriterError>(())
//! ```

use crate::error::{WriterError, WriterResult};
use crate::sources::database::Rows;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default settings file location.
pub const DEFAULT_SETTINGS_PATH: &str = "config/nxswriter.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "NXSWRITER_";

/// Top-level writer settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterSettings {
    /// Logging settings
    pub logging: LoggingSettings,
    /// File backend settings
    pub storage: StorageSettings,
    /// Phase execution settings
    pub runner: RunnerSettings,
    /// Simulated device attributes: device name → attribute name → value
    pub devices: HashMap<String, HashMap<String, serde_json::Value>>,
    /// Static databases: database name → query → rows
    pub databases: HashMap<String, HashMap<String, Rows>>,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (pretty, compact, json)
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// File backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Backend name (memory or hdf5)
    pub backend: String,
    /// Directory relative file names are resolved against
    pub output_dir: PathBuf,
    /// Replace existing files
    pub overwrite: bool,
}

impl StorageSettings {
    /// Resolve a file name against the output directory.
    pub fn resolve(&self, file_name: &str) -> PathBuf {
        let path = Path::new(file_name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.output_dir.join(path)
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            output_dir: PathBuf::from("."),
            overwrite: false,
        }
    }
}

/// Phase execution configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Maximum simultaneous node tasks per phase (0 = unbounded)
    pub max_concurrency: usize,
    /// Timeout applied to every data source read
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            read_timeout: Duration::from_secs(5),
        }
    }
}

impl WriterSettings {
    /// Load settings from the default file and the environment.
    pub fn load() -> WriterResult<Self> {
        Self::load_from(DEFAULT_SETTINGS_PATH)
    }

    /// Load settings from a specific file path and the environment.
    ///
    /// A missing file is not an error; defaults fill every gap.
    pub fn load_from<P: AsRef<Path>>(path: P) -> WriterResult<Self> {
        Ok(Figment::from(Serialized::defaults(WriterSettings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Validate settings after loading.
    pub fn validate(&self) -> WriterResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(WriterError::SettingsValidation(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(WriterError::SettingsValidation(format!(
                "Invalid logging.format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            )));
        }

        let valid_backends = ["memory", "hdf5"];
        if !valid_backends.contains(&self.storage.backend.as_str()) {
            return Err(WriterError::SettingsValidation(format!(
                "Invalid storage.backend '{}'. Must be one of: {}",
                self.storage.backend,
                valid_backends.join(", ")
            )));
        }

        if self.runner.read_timeout.is_zero() {
            return Err(WriterError::SettingsValidation(
                "runner.read_timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn defaults_are_valid() {
        let settings = WriterSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.storage.backend, "memory");
        assert_eq!(settings.runner.read_timeout, Duration::from_secs(5));
    }

    #[test]
    #[serial]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = WriterSettings::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, WriterSettings::default());
    }

    #[test]
    #[serial]
    fn loads_toml_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nxswriter.toml");
        std::fs::write(
            &path,
            r#"
[logging]
level = "debug"

[storage]
backend = "memory"
output_dir = "/data/scans"

[runner]
max_concurrency = 4
read_timeout = "250ms"

[devices."sys/tg_test/1"]
double_scalar = 1.5
spectrum = [1, 2, 3]

[databases.beamline]
"SELECT energy FROM scans" = [[8.05]]
"#,
        )
        .unwrap();

        let settings = WriterSettings::load_from(&path).unwrap();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.runner.max_concurrency, 4);
        assert_eq!(settings.runner.read_timeout, Duration::from_millis(250));
        assert_eq!(
            settings.devices["sys/tg_test/1"]["spectrum"],
            serde_json::json!([1, 2, 3])
        );
        assert_eq!(settings.databases["beamline"]["SELECT energy FROM scans"].len(), 1);
        assert_eq!(
            settings.storage.resolve("scan.nxs"),
            PathBuf::from("/data/scans/scan.nxs")
        );
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        std::env::set_var("NXSWRITER_STORAGE__OVERWRITE", "true");
        let dir = tempfile::tempdir().unwrap();
        let settings = WriterSettings::load_from(dir.path().join("absent.toml"));
        std::env::remove_var("NXSWRITER_STORAGE__OVERWRITE");
        assert!(settings.unwrap().storage.overwrite);
    }

    #[test]
    #[serial]
    fn rejects_invalid_values() {
        let mut settings = WriterSettings::default();
        settings.logging.level = "verbose".into();
        assert!(matches!(settings.validate(), Err(WriterError::SettingsValidation(_))));

        let mut settings = WriterSettings::default();
        settings.storage.backend = "netcdf".into();
        assert!(settings.validate().is_err());

        let mut settings = WriterSettings::default();
        settings.runner.read_timeout = Duration::ZERO;
        assert!(settings.validate().is_err());
    }
}
