//! `ps3eye` - Userspace driver for the PS3 Eye camera
//!
//! Talks to the OV534 bridge and OV772x sensor over libusb: enumerates
//! cameras, uploads the sensor configuration, streams raw YUV422 video over
//! bulk transfers into a ring of frame buffers, and streams the four-channel
//! microphone array over isochronous transfers.
//!
//! # Example
//!
//! ```rust,ignore
//! use ps3eye::{CaptureSession, DeviceEnumerator};
//!
//! ps3eye::init_logging();
//! let mut enumerator = DeviceEnumerator::new();
//! for device in enumerator.list_devices(false) {
//!     let mut session = CaptureSession::new(device);
//!     session.init(640, 480, 60)?;
//!     session.start()?;
//!     while let Some(frame) = session.request_frame() {
//!         // 640 * 480 * 2 bytes of YUYV
//!     }
//! }
//! ```

pub mod audio;
pub mod capture;
pub mod config;
pub mod controls;
pub mod enumerate;
pub mod frame_assembler;
pub mod libusb;
pub mod mode;
pub mod registers;
pub mod replay;
pub mod session;
pub mod tables;
pub mod test_utils;
pub mod transfer;
pub mod usb;

pub use audio::Microphone;
pub use capture::{CaptureMetadata, PacketRecorder};
pub use config::CameraConfig;
pub use controls::{CameraControls, Control};
pub use enumerate::{DeviceEnumerator, EyeDevice};
pub use frame_assembler::{FrameAssembler, FrameReader};
pub use mode::{Resolution, VideoMode};
pub use replay::PacketReplay;
pub use session::{CameraDevice, CameraTransport, CaptureSession, SessionError, SessionState};
pub use transfer::{StreamError, StreamState};

/// Capture session over a real USB camera
pub type UsbCaptureSession = CaptureSession<std::sync::Arc<EyeDevice>>;

/// Initialize `env_logger` with an `info` default, overridable by `RUST_LOG`
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
