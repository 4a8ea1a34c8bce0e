mod reader;
mod writer;

pub use reader::FramedAsyncBufferedReader;
pub use writer::{FramedAsyncBufferedWriter, encode};

use crate::common::Frame;

// [length][tag][data], length is a little endian u32 covering tag and data
pub(crate) const FRAME_LENGTH_BYTES: usize = 4;
pub(crate) const TAG_FRAME: u8 = 1;
pub(crate) const TAG_END_OF_STREAM: u8 = 2;
// width, height, format, metadata length
pub(crate) const FRAME_HEADER_BYTES: usize = 4 + 4 + 1 + 4;
pub const MAX_MESSAGE_BYTES: usize = 256 * 1024 * 1024;

/// A message exchanged between endpoints.
#[derive(Debug, Clone)]
pub enum WireMessage {
    Frame(Frame),
    /// The producer stopped cleanly, nothing else follows.
    EndOfStream,
}
