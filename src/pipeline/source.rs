use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::filter::Filter;
use crate::common::Frame;
use crate::error::{ConfigError, FilterError, SetupError};

/// Metadata key holding the identity stamp of each frame.
pub const META_KEY: &str = "meta";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Upper bound on frames per second. Unpaced when unset.
    pub max_fps: Option<f32>,
}

/// Stamps each ingested frame with `{id, ts, seq}` and paces the stream.
pub struct SourceFilter {
    config: SourceConfig,
    interval: Option<Duration>,
    next_due: Option<Instant>,
    seq: u64,
}

impl SourceFilter {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            interval: None,
            next_due: None,
            seq: 0,
        }
    }

    async fn pace(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };
        if let Some(due) = self.next_due {
            tokio::time::sleep_until(due).await;
        }
        self.next_due = Some(Instant::now() + interval);
    }
}

#[async_trait]
impl Filter for SourceFilter {
    async fn setup(&mut self) -> Result<(), SetupError> {
        self.interval = match self.config.max_fps {
            None => None,
            Some(fps) if fps.is_finite() && fps > 0.0 => Some(Duration::from_secs_f32(1.0 / fps)),
            Some(fps) => {
                return Err(ConfigError::invalid("max_fps", format!("{fps} is not a positive rate")).into());
            }
        };
        Ok(())
    }

    async fn process(&mut self, mut frame: Frame) -> Result<Frame, FilterError> {
        self.pace().await;
        frame.data_mut().insert(
            META_KEY.to_string(),
            json!({
                "id": Uuid::new_v4().to_string(),
                "ts": Utc::now().timestamp_millis(),
                "seq": self.seq,
            }),
        );
        self.seq += 1;
        Ok(frame)
    }

    fn kind(&self) -> &'static str {
        "source"
    }
}
