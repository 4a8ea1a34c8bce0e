use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::Frame;
use crate::error::FilterError;

/// Metadata key under which detections travel.
pub const OBJECTS_KEY: &str = "objects";

/// One object recognized in a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class_label: String,
    pub confidence: f64,
}

impl Detection {
    pub fn new(class_label: impl Into<String>, confidence: f64) -> Self {
        Self {
            class_label: class_label.into(),
            confidence,
        }
    }
}

impl Frame {
    /// Detections stored by the detection stage.
    pub fn objects(&self) -> Result<Vec<Detection>, FilterError> {
        let value = self
            .data()
            .get(OBJECTS_KEY)
            .ok_or(FilterError::MissingMetadata(OBJECTS_KEY))?;
        Ok(Vec::<Detection>::deserialize(value)?)
    }

    /// Replaces whatever detections the frame carried.
    pub fn set_objects(&mut self, objects: &[Detection]) -> Result<(), FilterError> {
        let value = serde_json::to_value(objects)?;
        self.data_mut().insert(OBJECTS_KEY.to_string(), value);
        Ok(())
    }

    pub fn clear_objects(&mut self) {
        self.data_mut()
            .insert(OBJECTS_KEY.to_string(), Value::Array(Vec::new()));
    }
}
