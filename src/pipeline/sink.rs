use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

use super::filter::Filter;
use super::source::META_KEY;
use crate::common::{Frame, OBJECTS_KEY};
use crate::error::{ConfigError, FilterError, SetupError};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// PNG overwritten with the latest frame every `snapshot_every` frames.
    pub snapshot: Option<PathBuf>,
    pub snapshot_every: u64,
    pub log_every: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            snapshot: None,
            snapshot_every: 30,
            log_every: 30,
        }
    }
}

/// End of the chain: reports throughput and keeps a snapshot of what it saw.
pub struct SinkFilter {
    config: SinkConfig,
    received: u64,
    window_start: Option<Instant>,
}

impl SinkFilter {
    pub fn new(config: SinkConfig) -> Self {
        Self {
            config,
            received: 0,
            window_start: None,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    fn report(&mut self, frame: &Frame) {
        let now = Instant::now();
        let fps = self
            .window_start
            .map(|start| self.config.log_every as f64 / now.duration_since(start).as_secs_f64())
            .unwrap_or_default();
        self.window_start = Some(now);

        let objects = frame
            .data()
            .get(OBJECTS_KEY)
            .and_then(|objects| objects.as_array())
            .map_or(0, Vec::len);
        let seq = frame
            .data()
            .get(META_KEY)
            .and_then(|meta| meta.get("seq"))
            .and_then(|seq| seq.as_u64());
        info!(
            "Displayed {} frame(s), {:.1} fps, last {}x{} with {} object(s), seq {:?}",
            self.received,
            fps,
            frame.width(),
            frame.height(),
            objects,
            seq
        );
    }

    async fn snapshot(&self, frame: &Frame, path: PathBuf) {
        let image = frame.rgb_image();
        let saved = tokio::task::spawn_blocking(move || image.save(&path)).await;
        match saved {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to write snapshot: {}", e),
            Err(e) => warn!("Snapshot task failed: {}", e),
        }
    }
}

#[async_trait]
impl Filter for SinkFilter {
    async fn setup(&mut self) -> Result<(), SetupError> {
        if self.config.log_every == 0 {
            return Err(ConfigError::invalid("log_every", "must be greater than zero").into());
        }
        if self.config.snapshot_every == 0 {
            return Err(ConfigError::invalid("snapshot_every", "must be greater than zero").into());
        }
        if let Some(path) = &self.config.snapshot {
            info!("Writing snapshots to {}", path.display());
        }
        self.window_start = Some(Instant::now());
        Ok(())
    }

    async fn process(&mut self, frame: Frame) -> Result<Frame, FilterError> {
        self.received += 1;
        if self.received % self.config.log_every == 0 {
            self.report(&frame);
        }
        if let Some(path) = self.config.snapshot.clone()
            && self.received % self.config.snapshot_every == 0
        {
            self.snapshot(&frame, path).await;
        }
        Ok(frame)
    }

    async fn teardown(&mut self) {
        info!("Displayed {} frame(s) in total", self.received);
    }

    fn kind(&self) -> &'static str {
        "sink"
    }
}
