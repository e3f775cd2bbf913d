//! Runtime configuration
//!
//! Layering: built-in defaults, optional TOML file, `TASKMEM_*` environment
//! variables, then command-line overrides applied by the binary.

use crate::error::TaskmemResult;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SEGMENT_NAME: &str = "task_shared_memory";
pub const DEFAULT_LOG_FILE: &str = "task_log.txt";
pub const DEFAULT_CONFIG_FILE: &str = "taskmem.toml";
pub const ENV_PREFIX: &str = "TASKMEM";

// Variables handed to spawned copies so they rendezvous with their spawner.
pub const SEGMENT_NAME_ENV: &str = "TASKMEM_SEGMENT_NAME";
pub const LOG_FILE_ENV: &str = "TASKMEM_LOG_FILE";
pub const COPY_WORK_ENV: &str = "TASKMEM_COPY_WORK_MS";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub segment_name: String,
    pub log_file: PathBuf,
    pub counter_interval_ms: u64,
    pub logger_interval_ms: u64,
    pub spawner_interval_ms: u64,
    pub leader_retry_ms: u64,
    pub copy_work_ms: u64,
    pub spawn_copies: bool,
    pub reclaim_dead_leader: bool,
    #[serde(default)]
    pub log_level: Option<String>,
    /// Extra file receiving diagnostic logs.
    #[serde(default)]
    pub diag_log: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            segment_name: DEFAULT_SEGMENT_NAME.to_string(),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            counter_interval_ms: 300,
            logger_interval_ms: 1000,
            spawner_interval_ms: 3000,
            leader_retry_ms: 10,
            copy_work_ms: 2000,
            spawn_copies: true,
            reclaim_dead_leader: true,
            log_level: None,
            diag_log: None,
        }
    }
}

impl Settings {
    /// Loads settings from `file` (optional unless `required`) and the environment.
    pub fn load(file: Option<&Path>, required: bool) -> TaskmemResult<Self> {
        let defaults = Settings::default();
        let mut builder = Config::builder()
            .set_default("segment_name", defaults.segment_name)?
            .set_default("log_file", defaults.log_file.to_string_lossy().into_owned())?
            .set_default("counter_interval_ms", defaults.counter_interval_ms)?
            .set_default("logger_interval_ms", defaults.logger_interval_ms)?
            .set_default("spawner_interval_ms", defaults.spawner_interval_ms)?
            .set_default("leader_retry_ms", defaults.leader_retry_ms)?
            .set_default("copy_work_ms", defaults.copy_work_ms)?
            .set_default("spawn_copies", defaults.spawn_copies)?
            .set_default("reclaim_dead_leader", defaults.reclaim_dead_leader)?;

        let path = file.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        builder = builder.add_source(File::from(path).required(required));

        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Settings>()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> TaskmemResult<()> {
        crate::core::SegmentName::new(self.segment_name.as_str())?;

        let intervals = [
            ("counter_interval_ms", self.counter_interval_ms),
            ("logger_interval_ms", self.logger_interval_ms),
            ("spawner_interval_ms", self.spawner_interval_ms),
            ("leader_retry_ms", self.leader_retry_ms),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(crate::error::errors::validation_error(
                    format!("{field} must be greater than zero"),
                    Some(field.to_string()),
                    Some(value.to_string()),
                ));
            }
        }
        Ok(())
    }

    pub fn counter_interval(&self) -> Duration {
        Duration::from_millis(self.counter_interval_ms)
    }

    pub fn logger_interval(&self) -> Duration {
        Duration::from_millis(self.logger_interval_ms)
    }

    pub fn spawner_interval(&self) -> Duration {
        Duration::from_millis(self.spawner_interval_ms)
    }

    pub fn leader_retry(&self) -> Duration {
        Duration::from_millis(self.leader_retry_ms)
    }

    pub fn copy_work(&self) -> Duration {
        Duration::from_millis(self.copy_work_ms)
    }

    /// Environment passed to spawned copies.
    pub fn child_env(&self) -> Vec<(String, String)> {
        vec![
            (SEGMENT_NAME_ENV.to_string(), self.segment_name.clone()),
            (
                LOG_FILE_ENV.to_string(),
                self.log_file.to_string_lossy().into_owned(),
            ),
            (COPY_WORK_ENV.to_string(), self.copy_work_ms.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn defaults_match_documented_intervals() {
        let settings = Settings::load(Some(Path::new("/nonexistent/taskmem.toml")), false).unwrap();
        assert_eq!(settings.segment_name, DEFAULT_SEGMENT_NAME);
        assert_eq!(settings.counter_interval(), Duration::from_millis(300));
        assert_eq!(settings.logger_interval(), Duration::from_secs(1));
        assert_eq!(settings.spawner_interval(), Duration::from_secs(3));
        assert_eq!(settings.leader_retry(), Duration::from_millis(10));
        assert_eq!(settings.copy_work(), Duration::from_secs(2));
        assert!(settings.spawn_copies);
    }

    #[test]
    #[serial]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "segment_name = \"from_file\"\ncounter_interval_ms = 5").unwrap();

        let settings = Settings::load(Some(file.path()), true).unwrap();
        assert_eq!(settings.segment_name, "from_file");
        assert_eq!(settings.counter_interval_ms, 5);
        assert_eq!(settings.logger_interval_ms, 1000);
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        std::env::set_var(SEGMENT_NAME_ENV, "from_env");
        std::env::set_var("TASKMEM_SPAWN_COPIES", "false");
        let settings = Settings::load(Some(Path::new("/nonexistent/taskmem.toml")), false);
        std::env::remove_var(SEGMENT_NAME_ENV);
        std::env::remove_var("TASKMEM_SPAWN_COPIES");

        let settings = settings.unwrap();
        assert_eq!(settings.segment_name, "from_env");
        assert!(!settings.spawn_copies);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let settings = Settings {
            counter_interval_ms: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn child_env_carries_rendezvous_settings() {
        let settings = Settings {
            segment_name: "demo".to_string(),
            ..Settings::default()
        };
        let env = settings.child_env();
        assert!(env.contains(&(SEGMENT_NAME_ENV.to_string(), "demo".to_string())));
        assert!(env.contains(&(COPY_WORK_ENV.to_string(), "2000".to_string())));
    }
}
