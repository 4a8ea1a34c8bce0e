use async_trait::async_trait;
use image::{ImageFormat, RgbImage};
use std::io::Cursor;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tower::timeout::TimeoutLayer;
use tower::util::BoxService;
use tower::{BoxError, Service, ServiceBuilder};
use tracing::debug;

use crate::common::Detection;
use crate::error::{DetectError, SetupError};

/// Finds objects in an RGB image.
#[async_trait]
pub trait ObjectDetector: Send + Sync {
    async fn detect(&self, image: Arc<RgbImage>) -> Result<Vec<Detection>, DetectError>;

    fn name(&self) -> &'static str;
}

/// Reports nothing. Useful to run the pipeline without a model.
pub struct NoopDetector;

#[async_trait]
impl ObjectDetector for NoopDetector {
    async fn detect(&self, _image: Arc<RgbImage>) -> Result<Vec<Detection>, DetectError> {
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Reports the same detections for every image.
pub struct FixedDetector {
    objects: Vec<Detection>,
}

impl FixedDetector {
    pub fn new(objects: Vec<Detection>) -> Self {
        Self { objects }
    }
}

#[async_trait]
impl ObjectDetector for FixedDetector {
    async fn detect(&self, _image: Arc<RgbImage>) -> Result<Vec<Detection>, DetectError> {
        Ok(self.objects.clone())
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// Runs an external program per image. The image is written to its stdin
/// as PNG, and it must print a JSON list of `{"class", "confidence"}` objects.
pub struct CommandDetector {
    program: String,
    args: Vec<String>,
}

impl CommandDetector {
    pub fn new(command: &[String]) -> Result<Self, SetupError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| SetupError::Capability("detector command is empty".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl ObjectDetector for CommandDetector {
    async fn detect(&self, image: Arc<RgbImage>) -> Result<Vec<Detection>, DetectError> {
        let png = tokio::task::spawn_blocking(move || {
            let mut png = Vec::new();
            image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
            Ok::<_, DetectError>(png)
        })
        .await
        .map_err(|e| DetectError::Other(e.to_string()))??;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(DetectError::Spawn)?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DetectError::Other("detector stdin unavailable".to_string()))?;

        let feed = async move {
            stdin.write_all(&png).await?;
            stdin.shutdown().await
        };
        let (_, output) = tokio::try_join!(feed, child.wait_with_output())?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(DetectError::Failed(output.status, stderr));
        }
        let objects: Vec<Detection> = serde_json::from_slice(&output.stdout)?;
        debug!("{} reported {} object(s)", self.program, objects.len());
        Ok(objects)
    }

    fn name(&self) -> &'static str {
        "command"
    }
}

/// Tower adapter so a detector can be layered (timeouts) like any service.
#[derive(Clone)]
pub struct DetectionService {
    inner: Arc<dyn ObjectDetector>,
}

impl DetectionService {
    pub fn new(inner: Arc<dyn ObjectDetector>) -> Self {
        Self { inner }
    }
}

impl Service<Arc<RgbImage>> for DetectionService {
    type Response = Vec<Detection>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, image: Arc<RgbImage>) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move { inner.detect(image).await.map_err(BoxError::from) })
    }
}

pub type BoxDetectionService = BoxService<Arc<RgbImage>, Vec<Detection>, BoxError>;

pub fn detection_service(
    detector: Arc<dyn ObjectDetector>,
    timeout: Option<Duration>,
) -> BoxDetectionService {
    let service = ServiceBuilder::new()
        .option_layer(timeout.map(TimeoutLayer::new))
        .service(DetectionService::new(detector));
    BoxService::new(service)
}
