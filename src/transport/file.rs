use image::ImageFormat;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tracing::{debug, info};

use super::Address;
use super::frame::{FramedAsyncBufferedReader, FramedAsyncBufferedWriter, WireMessage};
use crate::common::Frame;
use crate::error::TransportError;

/// Extension of recordings written by [`FileOutput`].
pub const RECORDING_EXTENSION: &str = "vfr";

enum Media {
    /// Still images decoded one per frame, in file name order.
    Images { paths: Vec<PathBuf>, next: usize },
    /// A stream of frames previously written by a file output.
    Recording {
        reader: Option<FramedAsyncBufferedReader<File>>,
    },
}

/// File backed source. With `!loop` it rewinds at end of stream forever.
pub struct FileInput {
    address: Address,
    path: PathBuf,
    looping: bool,
    media: Media,
    produced_this_pass: u64,
    finished: bool,
}

fn is_image(path: &Path) -> bool {
    ImageFormat::from_path(path).is_ok()
}

fn is_recording(path: &Path) -> bool {
    path.extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case(RECORDING_EXTENSION))
}

impl FileInput {
    pub async fn open(address: Address, path: PathBuf, looping: bool) -> Result<Self, TransportError> {
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(TransportError::Read)?;
        let media = if metadata.is_dir() {
            let mut paths = Vec::new();
            let mut entries = tokio::fs::read_dir(&path).await.map_err(TransportError::Read)?;
            while let Some(entry) = entries.next_entry().await.map_err(TransportError::Read)? {
                let candidate = entry.path();
                if is_image(&candidate) {
                    paths.push(candidate);
                }
            }
            if paths.is_empty() {
                return Err(TransportError::EmptySource(path));
            }
            paths.sort();
            info!("Reading {} image(s) from {}", paths.len(), path.display());
            Media::Images { paths, next: 0 }
        } else if is_image(&path) {
            Media::Images {
                paths: vec![path.clone()],
                next: 0,
            }
        } else if is_recording(&path) {
            info!("Replaying recording {}", path.display());
            Media::Recording { reader: None }
        } else {
            return Err(TransportError::UnsupportedMedia(path));
        };

        Ok(Self {
            address,
            path,
            looping,
            media,
            produced_this_pass: 0,
            finished: false,
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub async fn receive(&mut self) -> Result<Frame, TransportError> {
        loop {
            if self.finished {
                return Err(TransportError::EndOfStream);
            }
            let next = match &mut self.media {
                Media::Images { paths, next } => match paths.get(*next).cloned() {
                    Some(path) => {
                        *next += 1;
                        Some(decode_image(path).await?)
                    }
                    None => None,
                },
                Media::Recording { reader } => {
                    if reader.is_none() {
                        let file = File::open(&self.path).await.map_err(TransportError::Read)?;
                        *reader = Some(FramedAsyncBufferedReader::new(file));
                    }
                    match reader.as_mut() {
                        Some(open) => match open.read().await? {
                            Some(WireMessage::Frame(frame)) => Some(frame),
                            Some(WireMessage::EndOfStream) | None => None,
                        },
                        None => None,
                    }
                }
            };

            match next {
                Some(frame) => {
                    self.produced_this_pass += 1;
                    return Ok(frame);
                }
                None => self.rewind()?,
            }
        }
    }

    fn rewind(&mut self) -> Result<(), TransportError> {
        if !self.looping {
            self.finished = true;
            return Err(TransportError::EndOfStream);
        }
        if self.produced_this_pass == 0 {
            // looping over nothing would spin
            return Err(TransportError::EmptySource(self.path.clone()));
        }
        debug!(
            "Looping {} after {} frame(s)",
            self.path.display(),
            self.produced_this_pass
        );
        self.produced_this_pass = 0;
        match &mut self.media {
            Media::Images { next, .. } => *next = 0,
            Media::Recording { reader } => *reader = None,
        }
        Ok(())
    }
}

async fn decode_image(path: PathBuf) -> Result<Frame, TransportError> {
    tokio::task::spawn_blocking(move || match image::open(&path) {
        Ok(image) => Ok(Frame::from_image(image.to_rgb8())),
        Err(e) => Err(TransportError::Image(e, path)),
    })
    .await?
}

/// Writes frames to a recording that a file input can replay.
pub struct FileOutput {
    address: Address,
    writer: FramedAsyncBufferedWriter<File>,
}

impl FileOutput {
    pub async fn create(address: Address, path: &Path) -> Result<Self, TransportError> {
        let file = File::create(path).await.map_err(TransportError::Write)?;
        info!("Recording frames to {}", path.display());
        Ok(Self {
            address,
            writer: FramedAsyncBufferedWriter::new(file),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.writer.write(&WireMessage::Frame(frame)).await
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.writer.write(&WireMessage::EndOfStream).await {
            debug!("Could not finish recording {}: {}", self.address, e);
        }
        let _ = self.writer.shutdown().await;
    }
}
