//! knowyou-hw: Camera capture for the live recognition loop.
//!
//! Provides V4L2-based camera access and conversion of the negotiated
//! pixel format into RGB frames.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource, PixelFormat};
pub use frame::{Frame, FrameError};
