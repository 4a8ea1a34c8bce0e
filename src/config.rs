use serde::{Deserialize, Deserializer};
use std::path::Path;

use crate::error::ConfigError;
use crate::pipeline::aggregator::AggregatorConfig;
use crate::pipeline::detector::DetectorConfig;
use crate::pipeline::sink::SinkConfig;
use crate::pipeline::source::SourceConfig;
use crate::transport::TransportConfig;

/// Video used by the built-in chain when none is given.
pub const DEFAULT_VIDEO: &str = "file://example_video!loop";

/// Per-stage settings, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FilterConfig {
    Source(SourceConfig),
    Detector(DetectorConfig),
    Aggregator(AggregatorConfig),
    Sink(SinkConfig),
}

impl FilterConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            FilterConfig::Source(_) => "source",
            FilterConfig::Detector(_) => "detector",
            FilterConfig::Aggregator(_) => "aggregator",
            FilterConfig::Sink(_) => "sink",
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(address) => vec![address],
        OneOrMany::Many(addresses) => addresses,
    })
}

/// One stage as written in the topology file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StageSpec {
    pub name: String,
    #[serde(default, deserialize_with = "one_or_many")]
    pub sources: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub outputs: Vec<String>,
    pub filter: FilterConfig,
}

impl StageSpec {
    pub fn new(name: &str, sources: &str, outputs: Option<&str>, filter: FilterConfig) -> Self {
        Self {
            name: name.to_string(),
            sources: vec![sources.to_string()],
            outputs: outputs.map(str::to_string).into_iter().collect(),
            filter,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

impl Configuration {
    /// Reads a TOML topology. `VIDFLOW_`-prefixed variables override it,
    /// with `__` between nested keys (`VIDFLOW_TRANSPORT__QUEUE_DEPTH=4`).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("VIDFLOW")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Source, detection, aggregation and display chained over local TCP.
    pub fn default_chain(video: &str) -> Self {
        Self {
            transport: TransportConfig::default(),
            stages: vec![
                StageSpec::new(
                    "source",
                    video,
                    Some("tcp://*:5550"),
                    FilterConfig::Source(SourceConfig::default()),
                ),
                StageSpec::new(
                    "detector",
                    "tcp://localhost:5550",
                    Some("tcp://*:5552"),
                    FilterConfig::Detector(DetectorConfig::default()),
                ),
                StageSpec::new(
                    "aggregator",
                    "tcp://localhost:5552",
                    Some("tcp://*:5554"),
                    FilterConfig::Aggregator(AggregatorConfig::default()),
                ),
                StageSpec::new(
                    "sink",
                    "tcp://localhost:5554",
                    None,
                    FilterConfig::Sink(SinkConfig::default()),
                ),
            ],
        }
    }

    /// Points the first stage at `video`.
    pub fn with_video(mut self, video: &str) -> Self {
        if let Some(first) = self.stages.first_mut() {
            first.sources = vec![video.to_string()];
        }
        self
    }
}

/// Database connection settings, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub connect_timeout_secs: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            user: "postgres".to_string(),
            password: String::new(),
            host: "localhost".to_string(),
            port: 5432,
            dbname: "postgres".to_string(),
            connect_timeout_secs: 5,
        }
    }
}

impl PostgresConfig {
    /// Reads `user`, `password`, `host`, `port` and `dbname`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let port = match lookup("port") {
            Some(port) => port
                .trim()
                .parse::<u16>()
                .map_err(|e| ConfigError::invalid("port", format!("'{port}': {e}")))?,
            None => defaults.port,
        };
        Ok(Self {
            user: lookup("user").unwrap_or(defaults.user),
            password: lookup("password").unwrap_or(defaults.password),
            host: lookup("host").unwrap_or(defaults.host),
            port,
            dbname: lookup("dbname").unwrap_or(defaults.dbname),
            connect_timeout_secs: defaults.connect_timeout_secs,
        })
    }
}
