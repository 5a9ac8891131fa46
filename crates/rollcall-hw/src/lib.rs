//! rollcall-hw — Camera acquisition for the attendance scanner.
//!
//! Frames are delivered as 8-bit grayscale regardless of the negotiated
//! pixel format. The V4L2 backend is behind the `v4l2` feature; everything
//! else works against the [`CameraProvider`] / [`FrameSource`] traits.

pub mod camera;
pub mod frame;

pub use camera::{CameraError, CameraErrorKind, CameraProvider, FrameSource};
pub use frame::{Frame, FrameError};

#[cfg(feature = "v4l2")]
pub use camera::v4l2::{list_devices, DeviceInfo, V4lCamera, V4lCameraProvider};
