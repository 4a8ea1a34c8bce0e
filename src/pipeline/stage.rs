use async_trait::async_trait;
use std::sync::Arc;

use super::aggregator::AggregatorFilter;
use super::detector::DetectorFilter;
use super::filter::Filter;
use super::sink::SinkFilter;
use super::source::SourceFilter;
use crate::capability::{ObjectDetector, PostgresConnector, StoreConnector};
use crate::common::Frame;
use crate::config::{FilterConfig, PostgresConfig};
use crate::error::{ConfigError, FilterError, SetupError};

/// External collaborators handed to stages when they are built.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub postgres: PostgresConfig,
    /// Replaces the Postgres store of every aggregator.
    pub store: Option<Arc<dyn StoreConnector>>,
    /// Replaces the configured backend of every detector.
    pub detector: Option<Arc<dyn ObjectDetector>>,
}

/// The closed set of stage kinds.
pub enum Stage {
    Source(SourceFilter),
    Detector(DetectorFilter),
    Aggregator(AggregatorFilter),
    Sink(SinkFilter),
}

impl Stage {
    pub fn from_config(config: &FilterConfig, capabilities: &Capabilities) -> Result<Self, ConfigError> {
        Ok(match config {
            FilterConfig::Source(source) => Stage::Source(SourceFilter::new(source.clone())),
            FilterConfig::Detector(detector) => Stage::Detector(match &capabilities.detector {
                Some(backend) => DetectorFilter::with_detector(detector.clone(), backend.clone()),
                None => DetectorFilter::new(detector.clone()),
            }),
            FilterConfig::Aggregator(aggregator) => {
                let connector: Option<Arc<dyn StoreConnector>> = if !aggregator.persistence {
                    None
                } else if let Some(store) = &capabilities.store {
                    Some(store.clone())
                } else {
                    Some(Arc::new(PostgresConnector::new(
                        capabilities.postgres.clone(),
                        aggregator.table.clone(),
                    )?))
                };
                Stage::Aggregator(AggregatorFilter::new(aggregator.clone(), connector))
            }
            FilterConfig::Sink(sink) => Stage::Sink(SinkFilter::new(sink.clone())),
        })
    }
}

#[async_trait]
impl Filter for Stage {
    async fn setup(&mut self) -> Result<(), SetupError> {
        match self {
            Stage::Source(filter) => filter.setup().await,
            Stage::Detector(filter) => filter.setup().await,
            Stage::Aggregator(filter) => filter.setup().await,
            Stage::Sink(filter) => filter.setup().await,
        }
    }

    async fn process(&mut self, frame: Frame) -> Result<Frame, FilterError> {
        match self {
            Stage::Source(filter) => filter.process(frame).await,
            Stage::Detector(filter) => filter.process(frame).await,
            Stage::Aggregator(filter) => filter.process(frame).await,
            Stage::Sink(filter) => filter.process(frame).await,
        }
    }

    async fn teardown(&mut self) {
        match self {
            Stage::Source(filter) => filter.teardown().await,
            Stage::Detector(filter) => filter.teardown().await,
            Stage::Aggregator(filter) => filter.teardown().await,
            Stage::Sink(filter) => filter.teardown().await,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Stage::Source(filter) => filter.kind(),
            Stage::Detector(filter) => filter.kind(),
            Stage::Aggregator(filter) => filter.kind(),
            Stage::Sink(filter) => filter.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::aggregator::AggregatorConfig;
    use crate::pipeline::detector::DetectorConfig;

    #[test]
    fn kinds_follow_configuration() {
        let capabilities = Capabilities::default();
        let configs = [
            FilterConfig::Source(Default::default()),
            FilterConfig::Detector(DetectorConfig::default()),
            FilterConfig::Aggregator(AggregatorConfig {
                persistence: false,
                ..AggregatorConfig::default()
            }),
            FilterConfig::Sink(Default::default()),
        ];
        for config in &configs {
            let stage = Stage::from_config(config, &capabilities).unwrap();
            assert_eq!(stage.kind(), config.kind());
        }
    }

    #[test]
    fn unsafe_table_name_is_rejected() {
        let config = FilterConfig::Aggregator(AggregatorConfig {
            table: "events; --".to_string(),
            ..AggregatorConfig::default()
        });
        assert!(matches!(
            Stage::from_config(&config, &Capabilities::default()),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
