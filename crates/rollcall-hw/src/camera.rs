//! Camera acquisition: provider/source traits, error categories and the
//! V4L2 backend.

use std::io;

use thiserror::Error;

use crate::frame::Frame;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Coarse category reported to the operator when acquisition fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraErrorKind {
    Permission,
    NotFound,
    DeviceBusy,
    Unknown,
}

impl CameraErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraErrorKind::Permission => "permission",
            CameraErrorKind::NotFound => "not-found",
            CameraErrorKind::DeviceBusy => "device-busy",
            CameraErrorKind::Unknown => "unknown",
        }
    }
}

impl CameraError {
    pub fn kind(&self) -> CameraErrorKind {
        match self {
            CameraError::PermissionDenied(_) => CameraErrorKind::Permission,
            CameraError::DeviceNotFound(_) => CameraErrorKind::NotFound,
            CameraError::DeviceBusy(_) => CameraErrorKind::DeviceBusy,
            CameraError::CaptureFailed(_)
            | CameraError::FormatNegotiationFailed(_)
            | CameraError::StreamingNotSupported => CameraErrorKind::Unknown,
        }
    }

    /// Categorise an OS error raised while opening `device`.
    pub fn from_open_error(device: &str, err: &io::Error) -> Self {
        let detail = format!("{device}: {err}");
        match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EPERM) => return CameraError::PermissionDenied(detail),
            Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ENXIO) => {
                return CameraError::DeviceNotFound(detail)
            }
            Some(libc::EBUSY) => return CameraError::DeviceBusy(detail),
            _ => {}
        }
        match err.kind() {
            io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(detail),
            io::ErrorKind::NotFound => CameraError::DeviceNotFound(detail),
            _ => CameraError::CaptureFailed(detail),
        }
    }
}

/// An opened camera. Dropping it releases the device.
pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<Frame, CameraError>;
}

/// Opens the camera for one scan.
pub trait CameraProvider: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError>;
}

#[cfg(feature = "v4l2")]
pub mod v4l2 {
    use std::path::Path;

    use v4l::buffer::Type as BufType;
    use v4l::io::traits::CaptureStream;
    use v4l::prelude::*;
    use v4l::video::Capture;
    use v4l::FourCC;

    use super::{CameraError, CameraProvider, FrameSource};
    use crate::frame::{self, Frame};

    const CAPTURE_WIDTH: u32 = 640;
    const CAPTURE_HEIGHT: u32 = 480;

    /// Info about a discovered V4L2 device.
    #[derive(Debug, Clone)]
    pub struct DeviceInfo {
        pub path: String,
        pub name: String,
        pub driver: String,
        pub bus: String,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum PixelFormat {
        Yuyv,
        Grey,
        Y16,
    }

    /// V4L2 camera device handle.
    pub struct V4lCamera {
        device: Device,
        pub width: u32,
        pub height: u32,
        pub device_path: String,
        pixel_format: PixelFormat,
    }

    impl V4lCamera {
        /// Open a V4L2 capture device by path (e.g. "/dev/video0").
        pub fn open(device_path: &str) -> Result<Self, CameraError> {
            if !Path::new(device_path).exists() {
                return Err(CameraError::DeviceNotFound(device_path.to_string()));
            }

            let device = Device::with_path(device_path)
                .map_err(|e| CameraError::from_open_error(device_path, &e))?;

            let caps = device
                .query_caps()
                .map_err(|e| CameraError::from_open_error(device_path, &e))?;
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                return Err(CameraError::StreamingNotSupported);
            }

            let mut fmt = device.format().map_err(|e| {
                CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
            })?;
            fmt.fourcc = FourCC::new(b"YUYV");
            fmt.width = CAPTURE_WIDTH;
            fmt.height = CAPTURE_HEIGHT;

            let negotiated = device
                .set_format(&fmt)
                .map_err(|e| CameraError::from_open_error(device_path, &e))?;

            let fourcc = negotiated.fourcc;
            let pixel_format = if fourcc == FourCC::new(b"YUYV") {
                PixelFormat::Yuyv
            } else if fourcc == FourCC::new(b"GREY") {
                PixelFormat::Grey
            } else if fourcc == FourCC::new(b"Y16 ") {
                PixelFormat::Y16
            } else {
                return Err(CameraError::FormatNegotiationFailed(format!(
                    "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
                )));
            };

            tracing::info!(
                device = device_path,
                card = %caps.card,
                width = negotiated.width,
                height = negotiated.height,
                fourcc = ?fourcc,
                "camera opened"
            );

            Ok(Self {
                device,
                width: negotiated.width,
                height: negotiated.height,
                device_path: device_path.to_string(),
                pixel_format,
            })
        }

        fn to_grayscale(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
            let converted = match self.pixel_format {
                PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height),
                PixelFormat::Grey => frame::grey_to_grayscale(buf, self.width, self.height),
                PixelFormat::Y16 => frame::y16_to_grayscale(buf, self.width, self.height),
            };
            converted.map_err(|e| CameraError::CaptureFailed(e.to_string()))
        }
    }

    impl FrameSource for V4lCamera {
        fn capture(&mut self) -> Result<Frame, CameraError> {
            let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
                .map_err(|e| {
                    CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
                })?;

            let (buf, meta) = stream.next().map_err(|e| {
                CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}"))
            })?;

            let gray = self.to_grayscale(buf)?;
            Ok(Frame::from_gray(gray, self.width, self.height, meta.sequence))
        }
    }

    impl Drop for V4lCamera {
        fn drop(&mut self) {
            tracing::debug!(device = %self.device_path, "camera released");
        }
    }

    /// Opens a fixed V4L2 device path for every scan.
    pub struct V4lCameraProvider {
        device_path: String,
    }

    impl V4lCameraProvider {
        pub fn new(device_path: impl Into<String>) -> Self {
            Self {
                device_path: device_path.into(),
            }
        }
    }

    impl CameraProvider for V4lCameraProvider {
        fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
            Ok(Box::new(V4lCamera::open(&self.device_path)?))
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}
