pub mod capability;
pub mod common;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod pipeline;
pub mod transport;

pub use common::{Detection, Frame, PixelFormat};
pub use coordinator::{Coordinator, CoordinatorBuilder, Topology, run_multi};
pub use error::{AppError, ConfigError, FilterError, SetupError, StageError, TransportError};
