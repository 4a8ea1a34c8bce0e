use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::filter::Filter;
use super::overlay::{TextStyle, draw_text};
use crate::capability::{CountChangeEvent, EventStore, StoreConnector};
use crate::common::{Detection, Frame};
use crate::error::{FilterError, SetupError};

pub const PERSON_CLASS: &str = "person";
/// Person detections at or below this confidence are ignored.
pub const PERSON_MIN_CONFIDENCE: f64 = 0.7;
/// Table the count change events are inserted into.
pub const DEFAULT_TABLE: &str = "openfilter_example";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Record person count changes. Turning it off also skips connecting.
    pub persistence: bool,
    pub table: String,
    /// Log every frame's summary at info level.
    pub debug: bool,
    #[serde(flatten)]
    pub style: TextStyle,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            persistence: true,
            table: DEFAULT_TABLE.to_string(),
            debug: false,
            style: TextStyle::default(),
        }
    }
}

/// Counts detections per class in first-seen order, skipping weak person hits.
pub fn count_classes(objects: &[Detection]) -> IndexMap<String, usize> {
    let mut counts = IndexMap::new();
    for object in objects {
        if object.class_label == PERSON_CLASS && object.confidence <= PERSON_MIN_CONFIDENCE {
            continue;
        }
        *counts.entry(object.class_label.clone()).or_insert(0) += 1;
    }
    counts
}

/// `Objects: <total> | <class>: <count> | ...`
pub fn summary_text(counts: &IndexMap<String, usize>) -> String {
    let total: usize = counts.values().sum();
    let mut text = format!("Objects: {total}");
    for (class, count) in counts {
        text.push_str(&format!(" | {class}: {count}"));
    }
    text
}

async fn open_store(connector: Option<&Arc<dyn StoreConnector>>) -> Option<Box<dyn EventStore>> {
    let connector = connector?;
    match connector.connect().await {
        Ok(store) => Some(store),
        Err(e) => {
            error!("{}: {}", connector.describe(), e);
            None
        }
    }
}

/// Tracks the person count across frames, records each change and writes a
/// per-class summary onto the image.
pub struct AggregatorFilter {
    config: AggregatorConfig,
    connector: Option<Arc<dyn StoreConnector>>,
    store: Option<Box<dyn EventStore>>,
    last_observed_signal: i32,
}

impl AggregatorFilter {
    pub fn new(config: AggregatorConfig, connector: Option<Arc<dyn StoreConnector>>) -> Self {
        Self {
            config,
            connector,
            store: None,
            last_observed_signal: 0,
        }
    }

    pub fn last_observed_signal(&self) -> i32 {
        self.last_observed_signal
    }

    /// Whether count changes are currently being recorded.
    pub fn is_persisting(&self) -> bool {
        self.store.is_some()
    }

    async fn log_change(&mut self, current: i32, previous: i32) {
        if current == previous {
            return;
        }
        let Some(store) = self.store.as_mut() else {
            return;
        };
        let event = CountChangeEvent::between(previous, current);
        match store.append(&event).await {
            Ok(()) => info!("{}", event.notes),
            Err(e) => {
                error!("Failed to record person count change: {}", e);
                self.store = None;
                self.store = open_store(self.connector.as_ref()).await;
            }
        }
    }
}

#[async_trait]
impl Filter for AggregatorFilter {
    async fn setup(&mut self) -> Result<(), SetupError> {
        self.last_observed_signal = 0;
        self.store = open_store(self.connector.as_ref()).await;
        if self.connector.is_some() && self.store.is_none() {
            warn!("Persistence unavailable, person count changes will not be recorded");
        }
        Ok(())
    }

    async fn process(&mut self, mut frame: Frame) -> Result<Frame, FilterError> {
        let objects = frame.objects()?;
        let counts = count_classes(&objects);

        let current = counts
            .get(PERSON_CLASS)
            .map_or(0, |count| i32::try_from(*count).unwrap_or(i32::MAX));
        let previous = self.last_observed_signal;
        if current != previous {
            self.log_change(current, previous).await;
            self.last_observed_signal = current;
        }

        let text = summary_text(&counts);
        if self.config.debug {
            info!("{}", text);
        } else {
            debug!("{}", text);
        }
        let format = frame.format();
        draw_text(frame.image_mut(), &text, &self.config.style, format);
        Ok(frame)
    }

    async fn teardown(&mut self) {
        if self.store.take().is_some() {
            info!("Closed persistence connection");
        }
    }

    fn kind(&self) -> &'static str {
        "aggregator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::persistence::testing::{Journal, RecordingConnector};
    use image::RgbImage;

    fn detections(list: &[(&str, f64)]) -> Vec<Detection> {
        list.iter()
            .map(|(class, confidence)| Detection::new(*class, *confidence))
            .collect()
    }

    fn frame(list: &[(&str, f64)]) -> Frame {
        let mut frame = Frame::from_image(RgbImage::new(320, 48));
        frame.set_objects(&detections(list)).unwrap();
        frame
    }

    async fn aggregator() -> (AggregatorFilter, Journal) {
        let (connector, journal) = RecordingConnector::new();
        let mut filter = AggregatorFilter::new(
            AggregatorConfig::default(),
            Some(Arc::new(connector) as Arc<dyn StoreConnector>),
        );
        filter.setup().await.unwrap();
        (filter, journal)
    }

    #[test]
    fn only_weak_person_detections_are_excluded() {
        let counts = count_classes(&detections(&[
            ("person", 0.7),
            ("person", 0.71),
            ("car", 0.1),
            ("dog", 0.7),
            ("person", 0.2),
        ]));
        assert_eq!(counts.get("person"), Some(&1));
        assert_eq!(counts.get("car"), Some(&1));
        assert_eq!(counts.get("dog"), Some(&1));
    }

    #[test]
    fn total_equals_objects_minus_excluded() {
        let objects = detections(&[
            ("person", 0.9),
            ("person", 0.5),
            ("person", 0.3),
            ("car", 0.8),
            ("bus", 0.4),
        ]);
        let counts = count_classes(&objects);
        assert_eq!(counts.values().sum::<usize>(), objects.len() - 2);
    }

    #[test]
    fn counts_keep_first_seen_order() {
        let counts = count_classes(&detections(&[
            ("car", 0.9),
            ("person", 0.9),
            ("car", 0.9),
            ("bike", 0.9),
        ]));
        let order: Vec<&str> = counts.keys().map(String::as_str).collect();
        assert_eq!(order, vec!["car", "person", "bike"]);
    }

    #[test]
    fn summary_lists_every_class() {
        let mut counts = IndexMap::new();
        counts.insert("person".to_string(), 2);
        counts.insert("car".to_string(), 1);
        assert_eq!(summary_text(&counts), "Objects: 3 | person: 2 | car: 1");
        assert_eq!(summary_text(&IndexMap::new()), "Objects: 0");
    }

    #[test]
    fn mixed_confidence_scenario() {
        let counts = count_classes(&detections(&[
            ("person", 0.9),
            ("person", 0.5),
            ("car", 0.8),
        ]));
        assert_eq!(counts.get("person"), Some(&1));
        assert_eq!(counts.get("car"), Some(&1));
        assert_eq!(summary_text(&counts), "Objects: 2 | person: 1 | car: 1");
    }

    #[test]
    fn person_threshold_keeps_full_precision() {
        let objects: Vec<Detection> = serde_json::from_str(
            r#"[{"class":"person","confidence":0.7},{"class":"person","confidence":0.70000001}]"#,
        )
        .unwrap();
        let counts = count_classes(&objects);
        assert_eq!(counts.get("person"), Some(&1));

        let only_boundary = count_classes(&objects[..1]);
        assert_eq!(only_boundary.get("person"), None);
    }

    #[tokio::test]
    async fn count_change_records_one_event() {
        let (mut filter, journal) = aggregator().await;
        filter
            .process(frame(&[("person", 0.9), ("person", 0.8)]))
            .await
            .unwrap();
        assert_eq!(
            journal.events(),
            vec![CountChangeEvent {
                current_count: 2,
                notes: "Person count increased from 0 to 2".to_string(),
            }]
        );

        filter.process(frame(&[("person", 0.9)])).await.unwrap();
        assert_eq!(
            journal.events()[1].notes,
            "Person count decreased from 2 to 1"
        );
        assert_eq!(journal.events()[1].current_count, 1);
        assert_eq!(filter.last_observed_signal(), 1);
    }

    #[tokio::test]
    async fn other_classes_changing_records_nothing() {
        let (mut filter, journal) = aggregator().await;
        filter
            .process(frame(&[("person", 0.9), ("car", 0.9)]))
            .await
            .unwrap();
        filter
            .process(frame(&[("person", 0.9), ("dog", 0.9), ("dog", 0.9)]))
            .await
            .unwrap();
        assert_eq!(journal.attempts(), 1);
    }

    #[tokio::test]
    async fn identical_frames_record_once() {
        let (mut filter, journal) = aggregator().await;
        let input = frame(&[("person", 0.95)]);
        filter.process(input.clone()).await.unwrap();
        filter.process(input).await.unwrap();
        assert_eq!(journal.attempts(), 1);
    }

    #[tokio::test]
    async fn missing_database_still_annotates_and_forwards() {
        let (connector, journal) = RecordingConnector::unavailable();
        let mut filter = AggregatorFilter::new(
            AggregatorConfig::default(),
            Some(Arc::new(connector) as Arc<dyn StoreConnector>),
        );
        filter.setup().await.unwrap();
        assert!(!filter.is_persisting());

        let input = frame(&[("person", 0.9)]);
        let output = filter.process(input.clone()).await.unwrap();
        assert_ne!(output.image(), input.image());
        assert_eq!(output.objects().unwrap(), input.objects().unwrap());
        assert_eq!(journal.attempts(), 0);
        assert_eq!(filter.last_observed_signal(), 1);
    }

    #[tokio::test]
    async fn failed_write_is_dropped_and_connection_reopened() {
        let (mut filter, journal) = aggregator().await;
        journal.fail_next(1);
        filter.process(frame(&[("person", 0.9)])).await.unwrap();
        assert_eq!(journal.attempts(), 1);
        assert!(journal.events().is_empty());
        assert_eq!(journal.connects(), 2);
        assert_eq!(filter.last_observed_signal(), 1);

        filter.process(frame(&[])).await.unwrap();
        assert_eq!(
            journal.events(),
            vec![CountChangeEvent {
                current_count: 0,
                notes: "Person count decreased from 1 to 0".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn disabled_persistence_never_connects() {
        let mut filter = AggregatorFilter::new(AggregatorConfig::default(), None);
        filter.setup().await.unwrap();
        filter.process(frame(&[("person", 0.9)])).await.unwrap();
        assert!(!filter.is_persisting());
        assert_eq!(filter.last_observed_signal(), 1);
    }

    #[tokio::test]
    async fn published_frame_is_not_drawn_on() {
        let (mut filter, _journal) = aggregator().await;
        let published = frame(&[("car", 0.9)]);
        let untouched = published.image().clone();
        let output = filter.process(published.clone()).await.unwrap();
        assert_eq!(published.image(), &untouched);
        assert_ne!(output.image(), &untouched);
        assert_eq!(output.format(), published.format());
    }

    #[test]
    fn events_go_to_the_existing_table_by_default() {
        let config: AggregatorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.table, "openfilter_example");
        assert!(config.persistence);
        assert!(!config.debug);

        let config: AggregatorConfig =
            serde_json::from_str(r#"{"table": "counts", "debug": true}"#).unwrap();
        assert_eq!(config.table, "counts");
        assert!(config.debug);
    }

    #[tokio::test]
    async fn debug_summary_does_not_change_the_output() {
        let (connector, _journal) = RecordingConnector::new();
        let mut quiet = AggregatorFilter::new(
            AggregatorConfig::default(),
            Some(Arc::new(connector) as Arc<dyn StoreConnector>),
        );
        let mut verbose = AggregatorFilter::new(
            AggregatorConfig {
                debug: true,
                ..AggregatorConfig::default()
            },
            None,
        );
        quiet.setup().await.unwrap();
        verbose.setup().await.unwrap();

        let input = frame(&[("person", 0.9), ("car", 0.5)]);
        let a = quiet.process(input.clone()).await.unwrap();
        let b = verbose.process(input).await.unwrap();
        assert_eq!(a.image(), b.image());
    }

    #[tokio::test]
    async fn frame_without_objects_is_a_per_frame_error() {
        let (mut filter, journal) = aggregator().await;
        let err = filter
            .process(Frame::from_image(RgbImage::new(8, 8)))
            .await
            .unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(journal.attempts(), 0);
    }
}
