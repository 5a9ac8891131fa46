//! Descriptor source seam: whatever turns a frame into face descriptors.
//!
//! The face model is opaque to the rest of the workspace. The daemon talks
//! to an inference sidecar; tests script detections directly.

use thiserror::Error;

use crate::types::{BoundingBox, Descriptor};

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("descriptor source unavailable: {0}")]
    Unavailable(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("malformed detection: {0}")]
    Malformed(String),
}

/// One face found in a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub descriptor: Descriptor,
    pub geometry: BoundingBox,
}

/// Produces zero or more face descriptors for a grayscale frame.
///
/// Called from a blocking worker thread; implementations may block.
pub trait DescriptorSource: Send {
    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, DescriptorError>;
}
