pub mod aggregator;
pub mod detector;
pub mod filter;
pub mod overlay;
pub mod runtime;
pub mod sink;
pub mod source;
pub mod stage;

pub use filter::Filter;
pub use runtime::{StageReport, StageRuntime, StageState};
pub use stage::{Capabilities, Stage};
