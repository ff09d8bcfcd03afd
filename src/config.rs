//! Type-safe configuration loader using the `config` crate,
//! with manual environment-variable overrides for core settings.

use config::{Config, ConfigBuilder, ConfigError, File};
use config::builder::DefaultState;
use serde::Deserialize;
use std::{env, fmt, path::PathBuf, time::Duration};
use url::Url;

/// Top-level process settings loaded from `Config.toml`
/// and then overridden (where applicable) by environment variables.
///
/// These are process settings only. The user-editable exporter settings
/// (authorization, custom metrics) live in [`crate::store`].
#[derive(Deserialize, Clone)]
pub struct Settings {
    /// HTTP bind address for the scrape & health endpoints
    pub server_bind: String,

    /// Base URL of the HarperDB operations API
    pub harperdb_url: String,

    /// Operations API credentials
    pub harperdb_username: String,
    pub harperdb_password: String,

    /// HarperDB analytics aggregation period (e.g. "10m").
    /// Every scrape queries a window of 1.5x this period.
    #[serde(with = "humantime_serde")]
    pub aggregate_period: Duration,

    /// Timeout applied to every operations API call
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Upper bound on waiting for the cluster ping before it is left out
    #[serde(with = "humantime_serde")]
    pub cluster_ping_timeout: Duration,

    /// Where the exporter settings JSON is persisted
    pub settings_path: PathBuf,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("server_bind", &self.server_bind)
            .field("harperdb_url", &self.harperdb_url)
            .field("harperdb_username", &self.harperdb_username)
            .field("harperdb_password", &"<redacted>")
            .field("aggregate_period", &self.aggregate_period)
            .field("request_timeout", &self.request_timeout)
            .field("cluster_ping_timeout", &self.cluster_ping_timeout)
            .field("settings_path", &self.settings_path)
            .finish()
    }
}

fn with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("server_bind", "0.0.0.0:9926")?
        .set_default("harperdb_url", "http://localhost:9925")?
        .set_default("harperdb_username", "HDB_ADMIN")?
        .set_default("harperdb_password", "")?
        .set_default("aggregate_period", "10m")?
        .set_default("request_timeout", "30s")?
        .set_default("cluster_ping_timeout", "40s")?
        .set_default("settings_path", "exporter-settings.json")
}

impl Settings {
    /// Load settings from `Config.toml` (if present),
    /// then apply any overrides from these environment variables:
    ///
    /// - `APP__SERVER_BIND`
    /// - `APP__HARPERDB_URL`
    /// - `APP__HARPERDB_USERNAME`
    /// - `APP__HARPERDB_PASSWORD`
    /// - `APP__AGGREGATE_PERIOD`
    /// - `APP__REQUEST_TIMEOUT`
    /// - `APP__CLUSTER_PING_TIMEOUT`
    /// - `APP__SETTINGS_PATH`
    pub fn new() -> Result<Self, ConfigError> {
        // 1) Defaults, then Config.toml on top
        let cfg = with_defaults()?
            .add_source(File::with_name("Config").required(false))
            .build()?;

        let mut settings = Self::from_config(cfg)?;

        // 2) Manual overrides for core settings
        if let Ok(val) = env::var("APP__SERVER_BIND") {
            settings.server_bind = val;
        }
        if let Ok(val) = env::var("APP__HARPERDB_URL") {
            settings.harperdb_url = val;
        }
        if let Ok(val) = env::var("APP__HARPERDB_USERNAME") {
            settings.harperdb_username = val;
        }
        if let Ok(val) = env::var("APP__HARPERDB_PASSWORD") {
            settings.harperdb_password = val;
        }
        if let Ok(val) = env::var("APP__AGGREGATE_PERIOD") {
            settings.aggregate_period = parse_duration(&val)?;
        }
        if let Ok(val) = env::var("APP__REQUEST_TIMEOUT") {
            settings.request_timeout = parse_duration(&val)?;
        }
        if let Ok(val) = env::var("APP__CLUSTER_PING_TIMEOUT") {
            settings.cluster_ping_timeout = parse_duration(&val)?;
        }
        if let Ok(val) = env::var("APP__SETTINGS_PATH") {
            settings.settings_path = PathBuf::from(val);
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Deserialize from an already-built `Config` layered over the defaults.
    pub fn from_config(cfg: Config) -> Result<Self, ConfigError> {
        let layered = with_defaults()?.add_source(cfg).build()?;
        let settings: Settings = layered.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parsed operations API URL.
    pub fn operations_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.harperdb_url).map_err(|e| ConfigError::Foreign(Box::new(e)))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.operations_url()?;
        if self.aggregate_period.is_zero() {
            return Err(ConfigError::Message(
                "`aggregate_period` must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn parse_duration(val: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(val).map_err(|e| ConfigError::Foreign(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn load(toml: &str) -> Result<Settings, ConfigError> {
        let cfg = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        Settings::from_config(cfg)
    }

    #[test]
    fn empty_file_yields_defaults() {
        let settings = load("").unwrap();
        assert_eq!(settings.server_bind, "0.0.0.0:9926");
        assert_eq!(settings.aggregate_period, Duration::from_secs(600));
        assert_eq!(settings.cluster_ping_timeout, Duration::from_secs(40));
        assert_eq!(settings.settings_path, PathBuf::from("exporter-settings.json"));
    }

    #[test]
    fn humantime_values_are_parsed() {
        let settings = load(
            r#"
            aggregate_period = "1m"
            request_timeout = "5s"
            harperdb_url = "https://db.internal:9925"
            "#,
        )
        .unwrap();
        assert_eq!(settings.aggregate_period, Duration::from_secs(60));
        assert_eq!(settings.request_timeout, Duration::from_secs(5));
        assert_eq!(settings.operations_url().unwrap().port(), Some(9925));
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(load(r#"harperdb_url = "not a url""#).is_err());
    }

    #[test]
    fn zero_period_is_rejected() {
        assert!(load(r#"aggregate_period = "0s""#).is_err());
    }

    #[test]
    fn debug_output_hides_password() {
        let settings = load(r#"harperdb_password = "hunter2""#).unwrap();
        let printed = format!("{settings:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }
}
