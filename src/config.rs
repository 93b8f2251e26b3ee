//! Configuration file handling

use std::{
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use clap::ValueEnum;
use eyre::Context;
use reqwest::Url;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::geo::{GeoProvider, default_providers};

/// Status page of a ka9q-web instance running on the same machine.
const DEFAULT_STATUS_URL: &str = "http://localhost:8081/status";

/// Configuration object
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub upstream: UpstreamTable,
    #[serde(default)]
    pub storage: StorageTable,
    #[serde(default)]
    pub geo: GeoTable,
    #[serde(default)]
    pub network: NetworkTable,
    #[serde(default)]
    pub logging: LoggingTable,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct UpstreamTable {
    /// URL of the ka9q-web `/status` page
    #[serde(default = "default_status_url", deserialize_with = "deserialize_url")]
    pub status_url: Url,

    /// Seconds to wait between polls
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "deserialize_interval"
    )]
    pub poll_interval: Duration,

    /// Seconds to wait for the status page
    #[serde(default = "default_fetch_timeout", deserialize_with = "deserialize_seconds")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StorageTable {
    /// SQLite database holding connection history and the geolocation cache
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Number of closed connections to keep
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GeoTable {
    /// Seconds to wait for each geolocation provider
    #[serde(default = "default_geo_timeout", deserialize_with = "deserialize_seconds")]
    pub timeout: Duration,

    /// Geolocation APIs, in the order they're tried
    #[serde(default = "default_providers")]
    pub providers: Vec<GeoProvider>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct NetworkTable {
    /// Address/port to serve the read-only API on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LoggingTable {
    /// Log verbosity
    #[serde(default = "default_verbosity")]
    pub verbosity: Verbosity,

    /// File to print logs to in addition to the console
    pub log_file: Option<PathBuf>,
}

// This type exists so clap and serde can figure out what variants are available for the verbosity
// option. `LevelFilter` only has Display and FromStr implementations, which don't give clap a list
// of possible values.
#[derive(ValueEnum, Clone, Debug, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Off,
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<Verbosity> for LevelFilter {
    fn from(val: Verbosity) -> Self {
        match val {
            Verbosity::Off => LevelFilter::OFF,
            Verbosity::Trace => LevelFilter::TRACE,
            Verbosity::Debug => LevelFilter::DEBUG,
            Verbosity::Info => LevelFilter::INFO,
            Verbosity::Warn => LevelFilter::WARN,
            Verbosity::Error => LevelFilter::ERROR,
        }
    }
}

impl Default for UpstreamTable {
    fn default() -> Self {
        UpstreamTable {
            status_url: default_status_url(),
            poll_interval: default_poll_interval(),
            timeout: default_fetch_timeout(),
        }
    }
}

impl Default for StorageTable {
    fn default() -> Self {
        StorageTable {
            db_path: default_db_path(),
            history_limit: default_history_limit(),
        }
    }
}

impl Default for GeoTable {
    fn default() -> Self {
        GeoTable {
            timeout: default_geo_timeout(),
            providers: default_providers(),
        }
    }
}

impl Default for NetworkTable {
    fn default() -> Self {
        NetworkTable {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for LoggingTable {
    fn default() -> Self {
        LoggingTable {
            verbosity: default_verbosity(),
            log_file: None,
        }
    }
}

/// Get default status page URL.
fn default_status_url() -> Url {
    Url::parse(DEFAULT_STATUS_URL).unwrap()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_geo_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/ka9q-web/admin.db")
}

fn default_history_limit() -> u32 {
    500
}

/// Only listen locally by default; the API has no authentication of its own.
fn default_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 8082))
}

/// Get default log level.
fn default_verbosity() -> Verbosity {
    if cfg!(debug_assertions) {
        Verbosity::Debug
    } else {
        Verbosity::Info
    }
}

// Deserialize a `Url` from a string value
fn deserialize_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let url = Url::parse(&s).map_err(de::Error::custom)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(de::Error::custom("URL must use http or https"));
    }
    Ok(url)
}

// Deserialize a `Duration` from a (possibly fractional) number of seconds
fn deserialize_seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Whole(u64),
        Fractional(f64),
    }

    match Seconds::deserialize(deserializer)? {
        Seconds::Whole(secs) => Ok(Duration::from_secs(secs)),
        Seconds::Fractional(secs) => {
            Duration::try_from_secs_f64(secs).map_err(de::Error::custom)
        }
    }
}

// Deserialize a non-zero `Duration` from a number of seconds
fn deserialize_interval<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let interval = deserialize_seconds(deserializer)?;
    if interval.is_zero() {
        return Err(de::Error::custom("interval must be greater than zero"));
    }
    Ok(interval)
}

impl Config {
    /// Load configuration from the given TOML file.
    ///
    /// A missing file is not an error; every setting has a default.
    pub async fn parse_from_file(path: &Path) -> eyre::Result<Self> {
        let file_contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Config::default()),
            Err(err) => {
                return Err(err).wrap_err_with(|| format!("Failed to read {}", path.display()));
            }
        };
        toml::from_str(&file_contents).wrap_err("Failed to load configuration file")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::{Config, Verbosity};

    #[test]
    fn test_full_config() {
        let config: Config = toml::from_str(indoc! {r#"
            [upstream]
            status-url = "http://sdr.example.net:8081/status"
            poll-interval = 2.5
            timeout = 4

            [storage]
            db-path = "/tmp/watch.db"
            history-limit = 50

            [geo]
            timeout = 1

            [[geo.providers]]
            name = "only"
            url = "https://geo.example/{ip}"
            city-field = "town"
            country-field = "/country/iso"

            [network]
            listen-addr = "0.0.0.0:9000"

            [logging]
            verbosity = "warn"
            log-file = "/var/log/watch.log"
        "#})
        .unwrap();

        assert_eq!(
            config.upstream.status_url.as_str(),
            "http://sdr.example.net:8081/status"
        );
        assert_eq!(config.upstream.poll_interval, Duration::from_millis(2500));
        assert_eq!(config.upstream.timeout, Duration::from_secs(4));
        assert_eq!(config.storage.db_path.to_str(), Some("/tmp/watch.db"));
        assert_eq!(config.storage.history_limit, 50);
        assert_eq!(config.geo.timeout, Duration::from_secs(1));
        assert_eq!(config.geo.providers.len(), 1);
        assert_eq!(config.geo.providers[0].country_field, "/country/iso");
        assert_eq!(config.network.listen_addr.port(), 9000);
        assert_eq!(config.logging.verbosity, Verbosity::Warn);
        assert!(config.logging.log_file.is_some());
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("[storage]\nhistory-limit = 10\n").unwrap();
        assert_eq!(config.storage.history_limit, 10);
        assert_eq!(
            config.upstream.status_url.as_str(),
            "http://localhost:8081/status"
        );
        assert_eq!(config.upstream.poll_interval, Duration::from_secs(5));
        assert_eq!(config.upstream.timeout, Duration::from_secs(10));
        assert_eq!(config.geo.timeout, Duration::from_secs(5));
        assert_eq!(
            config
                .geo
                .providers
                .iter()
                .map(|p| p.name.as_str())
                .collect::<Vec<_>>(),
            vec!["ipapi.co", "geojs.io", "ip-api.com"]
        );
        assert!(config.network.listen_addr.ip().is_loopback());
        assert_eq!(config.network.listen_addr.port(), 8082);
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(toml::from_str::<Config>("[upstream]\nstatus-uri = \"http://x/\"\n").is_err());
        assert!(toml::from_str::<Config>("[upstream]\nstatus-url = \"ftp://x/\"\n").is_err());
        assert!(toml::from_str::<Config>("[upstream]\npoll-interval = -1\n").is_err());
        assert!(toml::from_str::<Config>("[upstream]\npoll-interval = 0\n").is_err());
        assert!(toml::from_str::<Config>("[upstream]\npoll-interval = 0.0\n").is_err());
        assert!(toml::from_str::<Config>("[upstream]\npoll-interval = 0.5\n").is_ok());
        assert!(toml::from_str::<Config>("[logging]\nverbosity = \"loud\"\n").is_err());
        assert!(toml::from_str::<Config>("[[geo.providers]]\nname = \"x\"\n").is_err());
    }

    #[tokio::test]
    async fn test_parse_from_file() {
        let dir = TempDir::new().unwrap();

        let missing = Config::parse_from_file(&dir.path().join("missing.toml"))
            .await
            .unwrap();
        assert_eq!(missing.storage.history_limit, 500);

        let path = dir.path().join("watch.toml");
        tokio::fs::write(&path, "[storage]\nhistory-limit = 7\n")
            .await
            .unwrap();
        let config = Config::parse_from_file(&path).await.unwrap();
        assert_eq!(config.storage.history_limit, 7);

        tokio::fs::write(&path, "[storage\n").await.unwrap();
        assert!(Config::parse_from_file(&path).await.is_err());
    }
}
