//! Capture session: one opened camera and its streaming lifecycle
//!
//! A [`CaptureSession`] walks the camera through
//! `Closed -> Opened -> Configured -> Streaming -> Opened -> Closed`.
//! [`init`](CaptureSession::init) resets the bridge and uploads the
//! calibration tables, [`start`](CaptureSession::start) programs the mode,
//! frame rate and controls before streaming, and frames are pulled with
//! [`is_new_frame`](CaptureSession::is_new_frame) /
//! [`get_frame`](CaptureSession::get_frame).
//!
//! The session is generic over [`CameraDevice`] so the whole sequence can be
//! driven against a mock in tests. The libusb implementation lives in
//! [`crate::usb`].
//!
//! # Example
//!
//! ```rust,ignore
//! let mut enumerator = DeviceEnumerator::new();
//! let device = enumerator.list_devices(false).pop().ok_or("no camera")?;
//!
//! let mut session = CaptureSession::new(device);
//! session.init(640, 480, 60)?;
//! session.start()?;
//! loop {
//!     if let Some(frame) = session.request_frame() {
//!         show(&frame);
//!     }
//! }
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::PacketRecorder;
use crate::config::CameraConfig;
use crate::controls::{CameraControls, Control};
use crate::frame_assembler::{AssemblerStats, FrameAssembler, FrameReader};
use crate::libusb::LibusbError;
use crate::mode::VideoMode;
use crate::registers::{ControlTransport, RegisterClient, REG_STREAM, STREAM_START, STREAM_STOP};
use crate::tables::{BRIDGE_INIT, SENSOR_INIT};
use crate::transfer::{PayloadSink, StreamError, StreamState, DEFAULT_DRAIN_TIMEOUT};

const REG_BRIDGE_RESET: u8 = 0xe7;
const REG_SENSOR_COM7: u8 = 0x12;
const REG_SENSOR_PID: u8 = 0x0a;
const REG_SENSOR_VER: u8 = 0x0b;
const REG_SENSOR_CLKRC: u8 = 0x11;
const REG_SENSOR_PLL: u8 = 0x0d;
const REG_BRIDGE_RATE: u8 = 0xe5;
/// SCCB bus address of the sensor
const SENSOR_ADDRESS: u8 = 0x42;

/// An opened camera as the session sees it
pub trait CameraTransport: ControlTransport + Send {
    /// Start streaming video payloads into `sink`, returning the endpoint used
    ///
    /// # Errors
    ///
    /// Returns the error that kept the stream from starting.
    fn start_video(
        &mut self,
        sink: Box<dyn PayloadSink>,
        drain_timeout: Duration,
    ) -> Result<u8, StreamError>;

    /// Cancel and drain the video stream; no-op when idle
    fn stop_video(&mut self);

    /// State of the video stream
    fn video_state(&self) -> StreamState;

    /// Dispatch pending transfer completions for up to `timeout`
    ///
    /// # Errors
    ///
    /// Returns the transport's event-handling error.
    fn handle_events(&self, timeout: Duration) -> Result<(), LibusbError>;
}

/// A camera that can be opened into a [`CameraTransport`]
pub trait CameraDevice {
    /// Transport produced by [`open`](Self::open)
    type Transport: CameraTransport;

    /// Open the camera and claim its video interface
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Open`] or [`SessionError::Claim`].
    fn open(&self) -> Result<Self::Transport, SessionError>;
}

impl<D: CameraDevice + ?Sized> CameraDevice for Arc<D> {
    type Transport = D::Transport;

    fn open(&self) -> Result<D::Transport, SessionError> {
        (**self).open()
    }
}

/// Errors that end a session operation
#[derive(Error, Debug)]
pub enum SessionError {
    /// The device could not be opened
    #[error("Failed to open device: {0}")]
    Open(LibusbError),
    /// An interface could not be claimed
    #[error("Failed to claim interface {0}: {1}")]
    Claim(u8, LibusbError),
    /// `start` was called before `init`
    #[error("Session is not configured")]
    NotConfigured,
    /// The video stream could not be started
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),
}

/// Lifecycle state of a [`CaptureSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No device handle
    Closed,
    /// Device open and interface claimed
    Opened,
    /// Calibration tables uploaded and a mode selected
    Configured,
    /// Video transfers in flight
    Streaming,
}

/// Video sink: feeds the assembler and optionally tees into a recorder
struct VideoSink {
    assembler: Arc<Mutex<FrameAssembler>>,
    recorder: Option<Arc<PacketRecorder>>,
}

impl PayloadSink for VideoSink {
    fn on_payload(&mut self, data: &[u8]) {
        if let Some(recorder) = &self.recorder {
            recorder.record_packet(data);
        }
        let frames = lock(&self.assembler).process_transfer(data);
        if let Some(recorder) = &self.recorder {
            recorder.record_frames(frames);
        }
    }
}

fn lock(assembler: &Mutex<FrameAssembler>) -> MutexGuard<'_, FrameAssembler> {
    assembler.lock().unwrap_or_else(|e| e.into_inner())
}

/// One camera, from open through streaming to close
pub struct CaptureSession<D: CameraDevice> {
    device: D,
    transport: Option<D::Transport>,
    regs: RegisterClient,
    mode: Option<VideoMode>,
    controls: CameraControls,
    state: SessionState,
    sensor_id: Option<u16>,
    assembler: Arc<Mutex<FrameAssembler>>,
    reader: FrameReader,
    drain_timeout: Duration,
    recorder: Option<Arc<PacketRecorder>>,
}

impl<D: CameraDevice> CaptureSession<D> {
    /// Wrap a device without opening it
    pub fn new(device: D) -> Self {
        Self {
            device,
            transport: None,
            regs: RegisterClient::new(),
            mode: None,
            controls: CameraControls::default(),
            state: SessionState::Closed,
            sensor_id: None,
            assembler: Arc::new(Mutex::new(FrameAssembler::new(0))),
            reader: FrameReader::new(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            recorder: None,
        }
    }

    /// Wrap a device with controls and drain timeout taken from `config`
    pub fn with_config(device: D, config: &CameraConfig) -> Self {
        let mut session = Self::new(device);
        session.apply_config(config);
        session
    }

    /// Adopt the controls and drain timeout of `config`
    ///
    /// Controls are pushed straight away if the device is open.
    pub fn apply_config(&mut self, config: &CameraConfig) {
        self.drain_timeout = config.drain_timeout();
        for control in config.controls.apply_order() {
            self.set_control(control);
        }
    }

    /// The wrapped device
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether video is streaming
    pub fn is_streaming(&self) -> bool {
        self.state == SessionState::Streaming
    }

    /// Mode selected by the last `init`
    pub fn mode(&self) -> Option<VideoMode> {
        self.mode
    }

    /// Cached control values
    pub fn controls(&self) -> &CameraControls {
        &self.controls
    }

    /// Sensor product/version word read during `init`
    pub fn sensor_id(&self) -> Option<u16> {
        self.sensor_id
    }

    /// Register operations that failed and were skipped
    pub fn soft_failures(&self) -> u64 {
        self.regs.soft_failures()
    }

    /// Drain bound used when stopping
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Set the drain bound used by the next `start`
    pub fn set_drain_timeout(&mut self, timeout: Duration) {
        self.drain_timeout = timeout;
    }

    /// Tee raw video payloads into `recorder` from the next `start` on
    pub fn set_recorder(&mut self, recorder: Option<Arc<PacketRecorder>>) {
        self.recorder = recorder;
    }

    /// Open the device and claim its video interface; no-op if open
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Open`] or [`SessionError::Claim`].
    pub fn open(&mut self) -> Result<(), SessionError> {
        if self.transport.is_none() {
            self.transport = Some(self.device.open()?);
            self.state = SessionState::Opened;
        }
        Ok(())
    }

    /// Open the camera, pick a mode and upload the calibration tables
    ///
    /// Register failures along the way are logged and skipped; only
    /// opening and claiming can fail.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Open`] or [`SessionError::Claim`].
    pub fn init(&mut self, width: u32, height: u32, fps: u8) -> Result<(), SessionError> {
        self.stop();
        self.open()?;
        let Some(transport) = self.transport.as_mut() else {
            return Err(SessionError::NotConfigured);
        };
        let regs = &mut self.regs;

        let mode = VideoMode::select(width, height, fps);
        log::info!(
            "Selected {}x{} @ {} fps (requested {}x{} @ {})",
            mode.width(),
            mode.height(),
            mode.fps,
            width,
            height,
            fps
        );
        self.mode = Some(mode);
        *lock(&self.assembler) = FrameAssembler::new(mode.frame_size());
        self.reader = FrameReader::new();

        // Reset the bridge, then the sensor
        regs.bridge_write(transport, REG_BRIDGE_RESET, 0x3a);
        regs.bridge_write(transport, REG_STREAM, 0x08);
        thread::sleep(Duration::from_millis(100));
        regs.bridge_write(transport, crate::registers::REG_ADDRESS, SENSOR_ADDRESS);
        regs.sensor_write(transport, REG_SENSOR_COM7, 0x80);
        thread::sleep(Duration::from_millis(10));

        // The first read of each id register returns stale data
        regs.sensor_read(transport, REG_SENSOR_PID);
        let high = regs.sensor_read(transport, REG_SENSOR_PID);
        regs.sensor_read(transport, REG_SENSOR_VER);
        let low = regs.sensor_read(transport, REG_SENSOR_VER);
        let sensor_id = u16::from_be_bytes([high, low]);
        log::debug!("Sensor ID: {:04x}", sensor_id);
        self.sensor_id = Some(sensor_id);

        regs.write_bridge_table(transport, BRIDGE_INIT);
        regs.set_led(transport, true);
        regs.write_sensor_table(transport, SENSOR_INIT);
        regs.bridge_write(transport, REG_STREAM, STREAM_STOP);
        regs.set_led(transport, false);

        self.state = SessionState::Configured;
        Ok(())
    }

    /// Program the mode, rate and controls and start streaming; no-op if streaming
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConfigured`] before `init`, or the
    /// [`StreamError`] that kept the transfers from starting.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Streaming {
            return Ok(());
        }
        let mode = self.mode.ok_or(SessionError::NotConfigured)?;
        let Some(transport) = self.transport.as_mut() else {
            return Err(SessionError::NotConfigured);
        };
        let regs = &mut self.regs;

        regs.write_bridge_table(transport, mode.resolution.bridge_start());
        regs.write_sensor_table(transport, mode.resolution.sensor_start());

        let rate = mode.rate_entry();
        log::debug!("Frame rate {} fps: {:?}", rate.fps, rate);
        regs.sensor_write(transport, REG_SENSOR_CLKRC, rate.r11);
        regs.sensor_write(transport, REG_SENSOR_PLL, rate.r0d);
        regs.bridge_write(transport, REG_BRIDGE_RATE, rate.re5);

        for control in self.controls.apply_order() {
            self.controls.push(control, regs, transport);
        }

        regs.set_led(transport, true);
        regs.bridge_write(transport, REG_STREAM, STREAM_START);

        lock(&self.assembler).reset();
        let sink = VideoSink {
            assembler: Arc::clone(&self.assembler),
            recorder: self.recorder.clone(),
        };
        match transport.start_video(Box::new(sink), self.drain_timeout) {
            Ok(endpoint) => {
                if let Some(recorder) = &self.recorder {
                    recorder.set_endpoint(endpoint);
                }
                self.state = SessionState::Streaming;
                log::info!(
                    "Streaming {}x{} from endpoint 0x{:02x}",
                    mode.width(),
                    mode.height(),
                    endpoint
                );
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to start video: {}", e);
                regs.bridge_write(transport, REG_STREAM, STREAM_STOP);
                regs.set_led(transport, false);
                Err(e.into())
            }
        }
    }

    /// Drain the transfers and stop the sensor; no-op unless streaming
    pub fn stop(&mut self) {
        if self.state != SessionState::Streaming {
            return;
        }
        if let Some(transport) = self.transport.as_mut() {
            transport.stop_video();
            self.regs.bridge_write(transport, REG_STREAM, STREAM_STOP);
            self.regs.set_led(transport, false);
        }
        self.state = SessionState::Opened;
        log::info!("Streaming stopped");
    }

    /// Stop streaming and release the device
    pub fn close(&mut self) {
        self.stop();
        if self.transport.take().is_some() {
            log::info!("Session closed");
        }
        self.state = SessionState::Closed;
    }

    /// State of the video transfer stream
    ///
    /// Reports [`StreamState::Failed`] after a disconnect or fatal transfer error.
    pub fn stream_state(&self) -> StreamState {
        self.transport
            .as_ref()
            .map(|t| t.video_state())
            .unwrap_or(StreamState::Stopped)
    }

    /// Dispatch pending transfer completions on the calling thread
    ///
    /// Completions are normally handled by a background thread; this lets a
    /// host loop drive them as well.
    ///
    /// # Errors
    ///
    /// Returns the transport's event-handling error.
    pub fn update(&self, timeout: Duration) -> Result<(), LibusbError> {
        match &self.transport {
            Some(transport) => transport.handle_events(timeout),
            None => Ok(()),
        }
    }

    // ---------------------------------------------------------------------
    // Frames
    // ---------------------------------------------------------------------

    /// Whether a frame newer than the last one taken is available
    pub fn is_new_frame(&self) -> bool {
        self.reader.is_new_frame(&lock(&self.assembler))
    }

    /// Copy out the latest completed frame, marking it as seen
    pub fn get_frame(&mut self) -> Option<Vec<u8>> {
        let assembler = lock(&self.assembler);
        self.reader.get_frame(&assembler).map(<[u8]>::to_vec)
    }

    /// Copy out the latest frame only if it has not been seen yet
    pub fn request_frame(&mut self) -> Option<Vec<u8>> {
        let assembler = lock(&self.assembler);
        self.reader.request_frame(&assembler).map(<[u8]>::to_vec)
    }

    /// Run `f` on the latest new frame without copying it
    ///
    /// The assembler is locked while `f` runs, so keep it short.
    pub fn with_frame<R>(&mut self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let assembler = lock(&self.assembler);
        self.reader.request_frame(&assembler).map(f)
    }

    /// Reassembly counters
    pub fn assembler_stats(&self) -> AssemblerStats {
        lock(&self.assembler).stats()
    }

    // ---------------------------------------------------------------------
    // Controls
    // ---------------------------------------------------------------------

    /// Cache a control value and write it if the device is open
    pub fn set_control(&mut self, control: Control) {
        self.controls.set(control);
        if let Some(transport) = self.transport.as_mut() {
            self.controls.push(control, &mut self.regs, transport);
        }
    }

    /// Enable or disable automatic gain and exposure
    pub fn set_auto_gain(&mut self, on: bool) {
        self.set_control(Control::AutoGain(on));
    }

    /// Enable or disable automatic white balance
    pub fn set_auto_white_balance(&mut self, on: bool) {
        self.set_control(Control::AutoWhiteBalance(on));
    }

    /// Set the analog gain
    pub fn set_gain(&mut self, val: u8) {
        self.set_control(Control::Gain(val));
    }

    /// Set the exposure
    pub fn set_exposure(&mut self, val: u8) {
        self.set_control(Control::Exposure(val));
    }

    /// Set the noise filter strength
    pub fn set_sharpness(&mut self, val: u8) {
        self.set_control(Control::Sharpness(val));
    }

    /// Set the hue
    pub fn set_hue(&mut self, val: u8) {
        self.set_control(Control::Hue(val));
    }

    /// Set the brightness
    pub fn set_brightness(&mut self, val: u8) {
        self.set_control(Control::Brightness(val));
    }

    /// Set the contrast
    pub fn set_contrast(&mut self, val: u8) {
        self.set_control(Control::Contrast(val));
    }

    /// Set the red channel balance
    pub fn set_red_balance(&mut self, val: u8) {
        self.set_control(Control::RedBalance(val));
    }

    /// Set the blue channel balance
    pub fn set_blue_balance(&mut self, val: u8) {
        self.set_control(Control::BlueBalance(val));
    }

    /// Set horizontal and vertical mirroring
    pub fn set_flip(&mut self, horizontal: bool, vertical: bool) {
        self.set_control(Control::Flip {
            horizontal,
            vertical,
        });
    }

    /// Automatic gain and exposure
    pub fn auto_gain(&self) -> bool {
        self.controls.auto_gain
    }

    /// Automatic white balance
    pub fn auto_white_balance(&self) -> bool {
        self.controls.auto_white_balance
    }

    /// Analog gain
    pub fn gain(&self) -> u8 {
        self.controls.gain
    }

    /// Exposure
    pub fn exposure(&self) -> u8 {
        self.controls.exposure
    }

    /// Noise filter strength
    pub fn sharpness(&self) -> u8 {
        self.controls.sharpness
    }

    /// Hue
    pub fn hue(&self) -> u8 {
        self.controls.hue
    }

    /// Brightness
    pub fn brightness(&self) -> u8 {
        self.controls.brightness
    }

    /// Contrast
    pub fn contrast(&self) -> u8 {
        self.controls.contrast
    }

    /// Red channel balance
    pub fn red_balance(&self) -> u8 {
        self.controls.red_balance
    }

    /// Blue channel balance
    pub fn blue_balance(&self) -> u8 {
        self.controls.blue_balance
    }

    /// Horizontal and vertical mirroring
    pub fn flip(&self) -> (bool, bool) {
        (self.controls.flip_horizontal, self.controls.flip_vertical)
    }
}

impl<D: CameraDevice> Drop for CaptureSession<D> {
    fn drop(&mut self) {
        self.close();
    }
}
