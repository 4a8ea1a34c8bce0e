use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::timeout::error::Elapsed;
use tower::{Service, ServiceExt};
use tracing::{debug, info, warn};

use super::filter::Filter;
use crate::capability::{
    BoxDetectionService, CommandDetector, FixedDetector, NoopDetector, ObjectDetector,
    detection_service,
};
use crate::common::{Detection, Frame};
use crate::error::{ConfigError, FilterError, SetupError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorBackend {
    #[default]
    None,
    Fixed,
    Command,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub backend: DetectorBackend,
    /// Program and arguments for the `command` backend.
    pub command: Vec<String>,
    /// Detections reported for every frame by the `fixed` backend.
    pub objects: Vec<Detection>,
    pub timeout_ms: Option<u64>,
    /// Log every frame's detections at info level.
    pub debug: bool,
}

/// Writes the detector's findings to `objects`, replacing anything there.
pub struct DetectorFilter {
    config: DetectorConfig,
    detector: Option<Arc<dyn ObjectDetector>>,
    service: Option<BoxDetectionService>,
}

impl DetectorFilter {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            detector: None,
            service: None,
        }
    }

    /// Uses `detector` instead of the configured backend.
    pub fn with_detector(config: DetectorConfig, detector: Arc<dyn ObjectDetector>) -> Self {
        Self {
            config,
            detector: Some(detector),
            service: None,
        }
    }

    fn build_detector(&self) -> Result<Arc<dyn ObjectDetector>, SetupError> {
        Ok(match self.config.backend {
            DetectorBackend::None => Arc::new(NoopDetector),
            DetectorBackend::Fixed => Arc::new(FixedDetector::new(self.config.objects.clone())),
            DetectorBackend::Command => Arc::new(CommandDetector::new(&self.config.command)?),
        })
    }
}

#[async_trait]
impl Filter for DetectorFilter {
    async fn setup(&mut self) -> Result<(), SetupError> {
        if self.config.timeout_ms == Some(0) {
            return Err(ConfigError::invalid("timeout_ms", "must be greater than zero").into());
        }
        let detector = match &self.detector {
            Some(detector) => detector.clone(),
            None => self.build_detector()?,
        };
        info!("Detecting objects with the {} backend", detector.name());
        let timeout = self.config.timeout_ms.map(Duration::from_millis);
        self.service = Some(detection_service(detector, timeout));
        Ok(())
    }

    async fn process(&mut self, mut frame: Frame) -> Result<Frame, FilterError> {
        let service = self
            .service
            .as_mut()
            .ok_or_else(|| FilterError::Fatal("detector used before setup".to_string()))?;

        let started = Instant::now();
        let image = frame.rgb_image();
        let result = match service.ready().await {
            Ok(ready) => ready.call(image).await,
            Err(e) => Err(e),
        };
        let objects = match result {
            Ok(objects) => objects,
            Err(e) if e.is::<Elapsed>() => {
                warn!("Detection timed out, forwarding frame without objects");
                Vec::new()
            }
            Err(e) => {
                warn!("Detection failed, forwarding frame without objects: {}", e);
                Vec::new()
            }
        };

        debug!(
            "Detected {} object(s) in {:?}",
            objects.len(),
            started.elapsed()
        );
        if self.config.debug {
            info!("Detected objects: {:?}", objects);
        }
        frame.set_objects(&objects)?;
        Ok(frame)
    }

    fn kind(&self) -> &'static str {
        "detector"
    }
}
