//! Camera transport over a real libusb device handle
//!
//! [`UsbTransport`] owns the opened camera: control transfers go straight to
//! the handle, video streams through a bulk [`TransferPool`] whose callbacks
//! are driven by an [`EventPump`] thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::enumerate::EyeDevice;
use crate::libusb::{LibusbError, TransferType, UsbContext, UsbDeviceHandle};
use crate::registers::ControlTransport;
use crate::session::{CameraDevice, CameraTransport, SessionError};
use crate::transfer::{PayloadSink, StreamError, StreamState, TransferPool};

/// Interface carrying the bridge registers and the video endpoint
pub const VIDEO_INTERFACE: u8 = 0;

/// Size of each bulk video transfer
pub const VIDEO_TRANSFER_SIZE: usize = 16384;

/// How long one event-handling call may block
const EVENT_POLL: Duration = Duration::from_millis(100);

/// Clear a stall left on `endpoint` by an earlier session
///
/// Failure is logged and streaming goes ahead anyway.
fn clear_stall(
    endpoint: u8,
    clear: impl FnOnce(u8) -> Result<(), LibusbError>,
) -> bool {
    match clear(endpoint) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Failed to clear halt on endpoint 0x{:02x}: {}", endpoint, e);
            false
        }
    }
}

/// Background thread running libusb event handling
///
/// Completion callbacks of every pool on the context run on this thread.
pub struct EventPump {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventPump {
    /// Start handling events for `ctx`
    ///
    /// # Errors
    ///
    /// Returns the spawn error if the thread cannot be created.
    pub fn start(ctx: Arc<UsbContext>) -> Result<Self, std::io::Error> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("ps3eye-events".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    if let Err(e) = ctx.handle_events_timeout(EVENT_POLL) {
                        log::error!("Event loop error: {}", e);
                        break;
                    }
                }
                log::debug!("Event loop exiting");
            })?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Signal the thread and wait for it to exit
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Event thread panicked");
            }
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.stop();
    }
}

/// An opened camera with interface 0 claimed
pub struct UsbTransport {
    // Field order matters: the pool must go before the pump and the handle
    video: Option<TransferPool>,
    pump: Option<EventPump>,
    handle: UsbDeviceHandle,
    last_state: StreamState,
}

impl UsbTransport {
    /// Open `device` and claim the video interface
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Open`] or [`SessionError::Claim`].
    pub fn open(device: &EyeDevice) -> Result<Self, SessionError> {
        let mut handle = device.usb_device().open().map_err(SessionError::Open)?;
        handle
            .claim_interface(i32::from(VIDEO_INTERFACE))
            .map_err(|e| SessionError::Claim(VIDEO_INTERFACE, e))?;
        log::info!(
            "Opened camera at bus {} address {}",
            device.bus_number(),
            device.address()
        );
        Ok(Self {
            video: None,
            pump: None,
            handle,
            last_state: StreamState::Stopped,
        })
    }

    /// The underlying device handle
    pub fn handle(&self) -> &UsbDeviceHandle {
        &self.handle
    }
}

impl ControlTransport for UsbTransport {
    fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, LibusbError> {
        self.handle
            .control_transfer(request_type, request, value, index, data, timeout)
    }
}

impl CameraTransport for UsbTransport {
    fn start_video(
        &mut self,
        sink: Box<dyn PayloadSink>,
        drain_timeout: Duration,
    ) -> Result<u8, StreamError> {
        if self.video.is_some() {
            return Err(StreamError::AlreadyRunning);
        }
        let endpoint = self
            .handle
            .find_endpoint(VIDEO_INTERFACE, None, TransferType::Bulk)?
            .ok_or(StreamError::NoEndpoint(TransferType::Bulk, VIDEO_INTERFACE))?;
        log::debug!(
            "Video endpoint 0x{:02x}, max packet {}",
            endpoint.address,
            endpoint.max_packet_size
        );

        clear_stall(endpoint.address, |ep| self.handle.clear_halt(ep));

        let pump = EventPump::start(Arc::clone(self.handle.context()))?;
        // SAFETY: the pool is stored in `self.video`, which is dropped before `self.handle`
        let mut pool =
            unsafe { TransferPool::bulk(&self.handle, endpoint.address, VIDEO_TRANSFER_SIZE, sink)? };
        pool.set_drain_timeout(drain_timeout);
        pool.start()?;

        self.pump = Some(pump);
        self.video = Some(pool);
        Ok(endpoint.address)
    }

    fn stop_video(&mut self) {
        if let Some(mut pool) = self.video.take() {
            pool.stop();
            self.last_state = pool.state();
        }
        if let Some(mut pump) = self.pump.take() {
            pump.stop();
        }
    }

    fn video_state(&self) -> StreamState {
        match &self.video {
            Some(pool) => pool.state(),
            None => self.last_state,
        }
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), LibusbError> {
        self.handle.context().handle_events_timeout(timeout)
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.stop_video();
        if let Err(e) = self.handle.release_interface(i32::from(VIDEO_INTERFACE)) {
            log::debug!("Failed to release interface {}: {}", VIDEO_INTERFACE, e);
        }
    }
}

impl CameraDevice for EyeDevice {
    type Transport = UsbTransport;

    fn open(&self) -> Result<UsbTransport, SessionError> {
        UsbTransport::open(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_stall_targets_endpoint() {
        let mut cleared = None;
        assert!(clear_stall(0x81, |ep| {
            cleared = Some(ep);
            Ok(())
        }));
        assert_eq!(cleared, Some(0x81));
    }

    #[test]
    fn test_clear_stall_failure_is_not_fatal() {
        assert!(!clear_stall(0x81, |_| Err(LibusbError::Pipe)));
        assert!(!clear_stall(0x81, |_| Err(LibusbError::NoDevice)));
    }
}
