use super::types::*;
use crate::error_handling::types::ConfigError;
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line arguments.
///
/// Everything except the configuration file is optional and, when present,
/// overrides the matching value from the file.
#[derive(Parser, Debug, Clone)]
#[command(name = "flowmaster")]
#[command(version)]
#[command(about = "Master side of the probe flow collection service")]
pub struct Args {
    /// Path to the TOML configuration file
    pub config_file: PathBuf,

    /// Override `listener.socket_path`
    #[arg(long)]
    pub socket_path: Option<PathBuf>,

    /// Override `database.url`
    #[arg(long, env = "FLOWMASTER_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Override `log_level`
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Complete runtime configuration.
///
/// Loaded from a TOML file; every section may be omitted and falls back to
/// its defaults.
///
/// ```toml
/// log_level = "debug"
///
/// [database]
/// url = "sqlite:///var/lib/flowmaster/db.sqlite3?mode=rwc"
///
/// [flow]
/// workers = 8
/// ```
#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub listener: ListenerConfig,
    pub database: DatabaseConfig,
    pub frontend: FrontendConfig,
    pub flow: FlowConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: String::from("info"),
            listener: ListenerConfig::default(),
            database: DatabaseConfig::default(),
            frontend: FrontendConfig::default(),
            flow: FlowConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the file named in `args` and applies the command-line overrides.
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(&args.config_file)?;
        if let Some(path) = &args.socket_path {
            config.listener.socket_path = path.clone();
        }
        if let Some(url) = &args.database_url {
            config.database.url = url.clone();
        }
        if let Some(level) = &args.log_level {
            config.log_level = level.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listener.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingValue("listener.socket_path".into()));
        }
        if self.database.url.is_empty() {
            return Err(ConfigError::MissingValue("database.url".into()));
        }
        if self.flow.workers == 0 {
            return Err(ConfigError::NotInRange("flow.workers must be at least 1".into()));
        }
        if self.flow.reconcile_interval_secs == 0 {
            return Err(ConfigError::NotInRange(
                "flow.reconcile_interval_secs must be at least 1".into(),
            ));
        }
        if self.frontend.enabled && self.frontend.port == 0 {
            return Err(ConfigError::NotInRange("frontend.port must not be 0".into()));
        }
        if self.log_level.parse::<log::LevelFilter>().is_err() {
            return Err(ConfigError::NotInRange(format!(
                "log_level {:?} is not one of off, error, warn, info, debug, trace",
                self.log_level
            )));
        }
        Ok(())
    }

    /// Level from `log_level`; only meaningful on a validated config.
    pub fn log_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.flow.reconcile_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.database.retry_delay_ms, 1000);
        assert_eq!(config.database.clock_refresh_secs, 600);
        assert_eq!(config.reconcile_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml(
            r#"
            log_level = "debug"

            [listener]
            socket_path = "/run/flowmaster.sock"

            [flow]
            workers = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.log_filter(), log::LevelFilter::Debug);
        assert_eq!(config.listener.socket_path, PathBuf::from("/run/flowmaster.sock"));
        assert_eq!(config.flow.workers, 2);
        assert_eq!(config.flow.plugin, "flow");
        assert_eq!(config.flow.reconcile_interval_secs, 60);
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        let err = Config::from_toml("log_level = \"chatty\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::NotInRange(msg) if msg.contains("chatty")));
        assert!(Config::from_toml("log_level = \"TRACE\"\n").is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = Config::from_toml("[flow]\nworkers = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::NotInRange(_)));
    }

    #[test]
    fn test_bad_toml_rejected() {
        let err = Config::from_toml("[flow\n").unwrap_err();
        assert!(matches!(err, ConfigError::TomlError(_)));
    }

    #[test]
    fn test_args_override_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[database]\nurl = \"sqlite://a.sqlite3\"").unwrap();

        let args = Args::try_parse_from([
            "flowmaster",
            file.path().to_str().unwrap(),
            "--database-url",
            "sqlite://b.sqlite3",
            "--log-level",
            "trace",
        ])
        .unwrap();
        let config = Config::from_args(&args).unwrap();
        assert_eq!(config.database.url, "sqlite://b.sqlite3");
        assert_eq!(config.log_filter(), log::LevelFilter::Trace);
    }
}
