pub mod detect;
pub mod persistence;

pub use detect::{
    BoxDetectionService, CommandDetector, DetectionService, FixedDetector, NoopDetector,
    ObjectDetector, detection_service,
};
pub use persistence::{CountChangeEvent, EventStore, PostgresConnector, StoreConnector};
