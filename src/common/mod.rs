pub mod detection;
pub mod frame;

pub use detection::{Detection, OBJECTS_KEY};
pub use frame::{Frame, Metadata, PixelFormat};
