use async_trait::async_trait;

use crate::common::Frame;
use crate::error::{FilterError, SetupError};

/// Per-stage hooks driven by a [`StageRuntime`](super::runtime::StageRuntime).
///
/// `process` runs strictly one frame at a time. A non-fatal [`FilterError`]
/// drops only the current frame; a fatal one stops the stage.
#[async_trait]
pub trait Filter: Send {
    /// Runs once before the first frame.
    async fn setup(&mut self) -> Result<(), SetupError> {
        Ok(())
    }

    async fn process(&mut self, frame: Frame) -> Result<Frame, FilterError>;

    /// Runs once after the last frame, on clean stops and faults alike.
    async fn teardown(&mut self) {}

    fn kind(&self) -> &'static str;
}
