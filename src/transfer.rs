//! Asynchronous USB transfer pools
//!
//! A [`TransferPool`] keeps a small fixed number of bulk or isochronous
//! transfers in flight against one endpoint. Every completed transfer hands
//! its bytes to a [`PayloadSink`] and is resubmitted from inside the
//! completion callback, so the pool size stays constant while streaming.
//!
//! Shutdown goes through a [`TransferTracker`]: stopping sets a flag under
//! the tracker's lock, cancels everything, and waits until each transfer
//! has come back through its callback. Resubmission also happens under
//! that lock, so a transfer can never slip past a cancel.
//!
//! Callbacks run on whichever thread drives libusb event handling (see
//! [`crate::usb::EventPump`]).

use std::mem::ManuallyDrop;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::libusb::{check, LibusbError, TransferStatus, TransferType, UsbContext, UsbDeviceHandle};

/// Number of transfers kept in flight per stream
pub const NUM_TRANSFERS: usize = 2;

/// Default bound on how long stopping waits for cancelled transfers
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(2000);

/// Receives the raw bytes of completed transfers
///
/// Called on the event-handling thread. For isochronous streams every
/// successfully received packet is delivered separately.
pub trait PayloadSink: Send {
    /// Handle one payload
    fn on_payload(&mut self, data: &[u8]);
}

impl<F: FnMut(&[u8]) + Send> PayloadSink for F {
    fn on_payload(&mut self, data: &[u8]) {
        self(data)
    }
}

/// Observable state of a transfer stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    /// No transfers in flight
    Stopped,
    /// Transfers are being resubmitted continuously
    Streaming,
    /// A stop was requested and transfers are draining
    Stopping,
    /// A transfer completed with a fatal status and the stream shut itself down
    Failed(TransferStatus),
}

/// Errors that prevent a stream from starting
#[derive(Error, Debug)]
pub enum StreamError {
    /// No suitable endpoint in the active configuration
    #[error("No {0:?} endpoint on interface {1}")]
    NoEndpoint(TransferType, u8),
    /// `libusb_alloc_transfer` returned null
    #[error("Failed to allocate transfer")]
    AllocFailed,
    /// The stream is already running
    #[error("Stream already running")]
    AlreadyRunning,
    /// The underlying USB call failed
    #[error("USB error: {0}")]
    Usb(#[from] LibusbError),
    /// The event-handling thread could not be started
    #[error("Failed to spawn event thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result of trying to resubmit a completed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resubmit {
    /// The transfer is back in flight
    Resubmitted,
    /// A stop is pending; the transfer was retired instead
    Retired,
    /// Submission failed; the stream is now failed
    Failed,
}

#[derive(Debug)]
struct TrackerState {
    outstanding: usize,
    stopping: bool,
    state: StreamState,
}

/// Outstanding-transfer counter and shutdown flag shared with the callbacks
#[derive(Debug)]
pub struct TransferTracker {
    inner: Mutex<TrackerState>,
    drained: Condvar,
}

impl Default for TransferTracker {
    fn default() -> Self {
        Self {
            inner: Mutex::new(TrackerState {
                outstanding: 0,
                stopping: false,
                state: StreamState::Stopped,
            }),
            drained: Condvar::new(),
        }
    }
}

impl TransferTracker {
    /// Create a tracker in the stopped state
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enter the streaming state with nothing in flight yet
    pub fn begin(&self) {
        let mut inner = self.lock();
        inner.outstanding = 0;
        inner.stopping = false;
        inner.state = StreamState::Streaming;
    }

    /// Submit a new transfer and count it if submission succeeds
    ///
    /// # Errors
    ///
    /// Returns the submission error.
    pub fn submit<F>(&self, submit: F) -> Result<(), LibusbError>
    where
        F: FnOnce() -> Result<(), LibusbError>,
    {
        let mut inner = self.lock();
        submit()?;
        inner.outstanding += 1;
        Ok(())
    }

    /// Resubmit a completed transfer unless a stop is pending
    pub fn resubmit<F>(&self, submit: F) -> Resubmit
    where
        F: FnOnce() -> Result<(), LibusbError>,
    {
        let mut inner = self.lock();
        if inner.stopping {
            inner.outstanding = inner.outstanding.saturating_sub(1);
            self.drained.notify_all();
            return Resubmit::Retired;
        }
        match submit() {
            Ok(()) => Resubmit::Resubmitted,
            Err(e) => {
                log::error!("Failed to resubmit transfer: {}", e);
                inner.outstanding = inner.outstanding.saturating_sub(1);
                inner.stopping = true;
                inner.state = StreamState::Failed(TransferStatus::Error);
                self.drained.notify_all();
                Resubmit::Failed
            }
        }
    }

    /// Retire a transfer that completed with a non-success status
    ///
    /// Returns `true` if the status was fatal to a running stream, in
    /// which case the caller should cancel the remaining transfers.
    pub fn retire(&self, status: TransferStatus) -> bool {
        let mut inner = self.lock();
        inner.outstanding = inner.outstanding.saturating_sub(1);
        let fatal = status != TransferStatus::Cancelled && !inner.stopping;
        if fatal {
            inner.stopping = true;
            inner.state = StreamState::Failed(status);
        }
        self.drained.notify_all();
        fatal
    }

    /// Stop resubmitting
    pub fn request_stop(&self) {
        let mut inner = self.lock();
        inner.stopping = true;
        if inner.state == StreamState::Streaming {
            inner.state = StreamState::Stopping;
        }
    }

    /// Block until no transfers are outstanding, or `timeout` elapses
    ///
    /// Someone else must be handling libusb events meanwhile. Returns
    /// `false` on timeout.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while inner.outstanding > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = match self.drained.wait_timeout(inner, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        if inner.state == StreamState::Stopping {
            inner.state = StreamState::Stopped;
        }
        true
    }

    /// Number of transfers currently in flight
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    /// Current stream state
    pub fn state(&self) -> StreamState {
        self.lock().state
    }
}

/// How the pool's transfers are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferKind {
    Bulk,
    Isochronous { packets: usize, packet_len: usize },
}

/// Shared by every transfer of a pool, passed to libusb as `user_data`
struct CallbackContext {
    kind: TransferKind,
    sink: Mutex<Box<dyn PayloadSink>>,
    tracker: Arc<TransferTracker>,
    transfers: Vec<*mut libusb1_sys::libusb_transfer>,
}

impl CallbackContext {
    /// Cancel every transfer without waiting
    fn cancel_all(&self) {
        for &transfer in &self.transfers {
            // SAFETY: transfers stay allocated for the lifetime of the context;
            // cancelling one that is not in flight returns NOT_FOUND
            unsafe { libusb1_sys::libusb_cancel_transfer(transfer) };
        }
    }

    /// Swap the sink for one that drops everything
    ///
    /// Late completions of a leaked pool then never reach the consumer.
    fn detach_sink(&self) {
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        *sink = Box::new(|_: &[u8]| {});
    }

    /// Hand the received bytes of a completed transfer to the sink
    ///
    /// # Safety
    /// `xfr` must be a completed transfer belonging to this context.
    unsafe fn deliver(&self, xfr: &libusb1_sys::libusb_transfer) {
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        match self.kind {
            TransferKind::Bulk => {
                let len = xfr.actual_length.max(0) as usize;
                if len > 0 {
                    sink.on_payload(std::slice::from_raw_parts(xfr.buffer, len));
                }
            }
            TransferKind::Isochronous { packet_len, .. } => {
                for i in 0..xfr.num_iso_packets.max(0) as usize {
                    let desc = &*xfr.iso_packet_desc.as_ptr().add(i);
                    let status = TransferStatus::from(desc.status);
                    if status != TransferStatus::Completed {
                        log::trace!("Iso packet {} status: {:?}", i, status);
                        continue;
                    }
                    let len = desc.actual_length as usize;
                    if len == 0 {
                        continue;
                    }
                    sink.on_payload(std::slice::from_raw_parts(
                        xfr.buffer.add(i * packet_len),
                        len,
                    ));
                }
            }
        }
    }
}

/// A fixed pool of transfers streaming from one endpoint
pub struct TransferPool {
    /// Keeps libusb alive while transfers exist
    _ctx: Arc<UsbContext>,
    handle: *mut libusb1_sys::libusb_device_handle,
    endpoint: u8,
    transfers: Vec<*mut libusb1_sys::libusb_transfer>,
    buffers: ManuallyDrop<Vec<Vec<u8>>>,
    context: ManuallyDrop<Box<CallbackContext>>,
    tracker: Arc<TransferTracker>,
    drain_timeout: Duration,
    leaked: bool,
}

// SAFETY: the raw transfer pointers are only touched by libusb callbacks
// (serialized by the tracker lock for resubmission) and by the owner.
unsafe impl Send for TransferPool {}

impl TransferPool {
    /// Allocate a pool of bulk transfers of `buffer_len` bytes each
    ///
    /// # Safety
    /// The pool must be dropped before `handle` is closed.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::AllocFailed`] if a transfer cannot be allocated.
    pub unsafe fn bulk(
        handle: &UsbDeviceHandle,
        endpoint: u8,
        buffer_len: usize,
        sink: Box<dyn PayloadSink>,
    ) -> Result<Self, StreamError> {
        Self::allocate(handle, endpoint, TransferKind::Bulk, buffer_len, sink)
    }

    /// Allocate a pool of isochronous transfers of `packets` x `packet_len` bytes
    ///
    /// # Safety
    /// The pool must be dropped before `handle` is closed.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::AllocFailed`] if a transfer cannot be allocated.
    pub unsafe fn isochronous(
        handle: &UsbDeviceHandle,
        endpoint: u8,
        packets: usize,
        packet_len: usize,
        sink: Box<dyn PayloadSink>,
    ) -> Result<Self, StreamError> {
        Self::allocate(
            handle,
            endpoint,
            TransferKind::Isochronous {
                packets,
                packet_len,
            },
            packets * packet_len,
            sink,
        )
    }

    unsafe fn allocate(
        handle: &UsbDeviceHandle,
        endpoint: u8,
        kind: TransferKind,
        buffer_len: usize,
        sink: Box<dyn PayloadSink>,
    ) -> Result<Self, StreamError> {
        let iso_packets = match kind {
            TransferKind::Bulk => 0,
            TransferKind::Isochronous { packets, .. } => packets as i32,
        };

        let mut transfers = Vec::with_capacity(NUM_TRANSFERS);
        for i in 0..NUM_TRANSFERS {
            let transfer = libusb1_sys::libusb_alloc_transfer(iso_packets);
            if transfer.is_null() {
                for t in &transfers {
                    libusb1_sys::libusb_free_transfer(*t);
                }
                log::error!("Failed to allocate transfer {}", i);
                return Err(StreamError::AllocFailed);
            }
            transfers.push(transfer);
        }

        let buffers = (0..NUM_TRANSFERS).map(|_| vec![0u8; buffer_len]).collect();
        let tracker = Arc::new(TransferTracker::new());
        let context = Box::new(CallbackContext {
            kind,
            sink: Mutex::new(sink),
            tracker: Arc::clone(&tracker),
            transfers: transfers.clone(),
        });

        log::debug!(
            "Allocated {} {:?} transfers of {} bytes on endpoint 0x{:02x}",
            NUM_TRANSFERS,
            kind,
            buffer_len,
            endpoint
        );

        Ok(Self {
            _ctx: Arc::clone(handle.context()),
            handle: handle.as_ptr(),
            endpoint,
            transfers,
            buffers: ManuallyDrop::new(buffers),
            context: ManuallyDrop::new(context),
            tracker,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            leaked: false,
        })
    }

    /// Set how long [`stop`](Self::stop) waits for cancellations
    pub fn set_drain_timeout(&mut self, timeout: Duration) {
        self.drain_timeout = timeout;
    }

    /// The tracker shared with the callbacks
    pub fn tracker(&self) -> &Arc<TransferTracker> {
        &self.tracker
    }

    /// Current stream state
    pub fn state(&self) -> StreamState {
        self.tracker.state()
    }

    /// Submit every transfer
    ///
    /// # Errors
    ///
    /// Returns the submission error after cancelling whatever was already
    /// submitted.
    pub fn start(&mut self) -> Result<(), StreamError> {
        if self.tracker.state() == StreamState::Streaming {
            return Err(StreamError::AlreadyRunning);
        }
        if self.leaked {
            return Err(StreamError::Usb(LibusbError::Busy));
        }

        self.tracker.begin();
        for i in 0..self.transfers.len() {
            if let Err(e) = self.submit(i) {
                log::error!("Failed to submit transfer {}: {}", i, e);
                self.stop();
                return Err(e.into());
            }
        }
        log::info!(
            "Streaming endpoint 0x{:02x} with {} transfers",
            self.endpoint,
            self.transfers.len()
        );
        Ok(())
    }

    fn submit(&mut self, index: usize) -> Result<(), LibusbError> {
        let transfer = self.transfers[index];
        let buffer = self.buffers[index].as_mut_ptr();
        let length = self.buffers[index].len() as i32;
        let user_data = &**self.context as *const CallbackContext as *mut libc::c_void;
        let kind = self.context.kind;
        let handle = self.handle;
        let endpoint = self.endpoint;

        self.tracker.submit(|| {
            // SAFETY: the transfer, buffer and context outlive the submission;
            // they are only freed once the tracker reports nothing in flight
            unsafe {
                (*transfer).dev_handle = handle;
                (*transfer).endpoint = endpoint;
                (*transfer).timeout = 0;
                (*transfer).length = length;
                (*transfer).buffer = buffer;
                (*transfer).callback = transfer_callback;
                (*transfer).user_data = user_data;
                match kind {
                    TransferKind::Bulk => {
                        (*transfer).transfer_type = TransferType::Bulk as u8;
                        (*transfer).num_iso_packets = 0;
                    }
                    TransferKind::Isochronous {
                        packets,
                        packet_len,
                    } => {
                        (*transfer).transfer_type = TransferType::Isochronous as u8;
                        (*transfer).num_iso_packets = packets as i32;
                        libusb1_sys::libusb_set_iso_packet_lengths(transfer, packet_len as u32);
                    }
                }
                check(libusb1_sys::libusb_submit_transfer(transfer))?;
            }
            Ok(())
        })
    }

    /// Cancel every transfer and wait for them to drain
    ///
    /// No-op when nothing is in flight. If the drain times out the pool is
    /// marked leaked: its transfers and buffers are never freed, since
    /// libusb may still write to them.
    pub fn stop(&mut self) {
        self.tracker.request_stop();
        if self.tracker.outstanding() == 0 {
            self.tracker.wait_drained(Duration::ZERO);
            return;
        }

        log::debug!("Cancelling transfers on endpoint 0x{:02x}", self.endpoint);
        self.context.cancel_all();

        if !self.tracker.wait_drained(self.drain_timeout) {
            log::error!(
                "{} transfer(s) on endpoint 0x{:02x} did not drain within {:?}; leaking them",
                self.tracker.outstanding(),
                self.endpoint,
                self.drain_timeout
            );
            self.context.detach_sink();
            self.leaked = true;
            return;
        }
        log::debug!("Endpoint 0x{:02x} drained", self.endpoint);
    }
}

impl Drop for TransferPool {
    fn drop(&mut self) {
        if !self.leaked && self.tracker.outstanding() > 0 {
            self.stop();
        }

        // Leaked pools keep their transfers, buffers and callback context
        if self.leaked {
            return;
        }

        for &transfer in &self.transfers {
            // SAFETY: nothing is in flight, so libusb no longer references the transfer
            unsafe { libusb1_sys::libusb_free_transfer(transfer) };
        }
        // SAFETY: dropped exactly once, after the last callback has returned
        unsafe {
            ManuallyDrop::drop(&mut self.buffers);
            ManuallyDrop::drop(&mut self.context);
        }
        log::trace!("Freed transfers for endpoint 0x{:02x}", self.endpoint);
    }
}

/// Completion callback for every pooled transfer
///
/// # Safety
/// Called by libusb from inside event handling with a transfer whose
/// `user_data` points at a live [`CallbackContext`].
extern "system" fn transfer_callback(transfer: *mut libusb1_sys::libusb_transfer) {
    // SAFETY: libusb guarantees transfer is valid in callback
    unsafe { transfer_callback_inner(transfer) }
}

unsafe fn transfer_callback_inner(transfer: *mut libusb1_sys::libusb_transfer) {
    let xfr = &*transfer;
    let context = &*(xfr.user_data as *const CallbackContext);
    let status = TransferStatus::from(xfr.status);

    if status != TransferStatus::Completed {
        if status == TransferStatus::Cancelled {
            log::debug!("Transfer cancelled");
        } else {
            log::error!("Transfer on endpoint 0x{:02x} failed: {:?}", xfr.endpoint, status);
        }
        if context.tracker.retire(status) {
            context.cancel_all();
        }
        return;
    }

    context.deliver(xfr);

    let resubmit = context
        .tracker
        .resubmit(|| check(libusb1_sys::libusb_submit_transfer(transfer)).map(|_| ()));
    if resubmit == Resubmit::Failed {
        context.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_tracker_counts_submissions() {
        let tracker = TransferTracker::new();
        tracker.begin();
        tracker.submit(|| Ok(())).unwrap();
        tracker.submit(|| Ok(())).unwrap();
        assert!(tracker.submit(|| Err(LibusbError::NoDevice)).is_err());

        assert_eq!(tracker.outstanding(), 2);
        assert_eq!(tracker.state(), StreamState::Streaming);
    }

    #[test]
    fn test_resubmit_after_stop_retires() {
        let tracker = TransferTracker::new();
        tracker.begin();
        tracker.submit(|| Ok(())).unwrap();
        assert_eq!(tracker.resubmit(|| Ok(())), Resubmit::Resubmitted);

        tracker.request_stop();
        assert_eq!(tracker.state(), StreamState::Stopping);
        let mut called = false;
        assert_eq!(
            tracker.resubmit(|| {
                called = true;
                Ok(())
            }),
            Resubmit::Retired
        );
        assert!(!called);
        assert_eq!(tracker.outstanding(), 0);
        assert!(tracker.wait_drained(Duration::ZERO));
        assert_eq!(tracker.state(), StreamState::Stopped);
    }

    #[test]
    fn test_cancelled_is_not_fatal() {
        let tracker = TransferTracker::new();
        tracker.begin();
        tracker.submit(|| Ok(())).unwrap();
        tracker.request_stop();
        assert!(!tracker.retire(TransferStatus::Cancelled));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_error_status_fails_stream() {
        let tracker = TransferTracker::new();
        tracker.begin();
        tracker.submit(|| Ok(())).unwrap();
        tracker.submit(|| Ok(())).unwrap();

        assert!(tracker.retire(TransferStatus::NoDevice));
        assert_eq!(tracker.state(), StreamState::Failed(TransferStatus::NoDevice));

        // The sibling comes back cancelled; the failure reason sticks
        assert!(!tracker.retire(TransferStatus::Cancelled));
        assert!(tracker.wait_drained(Duration::ZERO));
        assert_eq!(tracker.state(), StreamState::Failed(TransferStatus::NoDevice));
    }

    #[test]
    fn test_resubmit_failure_fails_stream() {
        let tracker = TransferTracker::new();
        tracker.begin();
        tracker.submit(|| Ok(())).unwrap();
        assert_eq!(
            tracker.resubmit(|| Err(LibusbError::NoDevice)),
            Resubmit::Failed
        );
        assert_eq!(tracker.outstanding(), 0);
        assert_eq!(tracker.state(), StreamState::Failed(TransferStatus::Error));
    }

    #[test]
    fn test_drain_waits_for_event_thread() {
        let tracker = Arc::new(TransferTracker::new());
        tracker.begin();
        tracker.submit(|| Ok(())).unwrap();
        tracker.submit(|| Ok(())).unwrap();

        // Simulated event thread: completes transfers until both retire
        let events = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                let mut deliveries = 0;
                while tracker.outstanding() > 0 {
                    deliveries += 1;
                    tracker.resubmit(|| Ok(()));
                    thread::sleep(Duration::from_millis(1));
                }
                deliveries
            })
        };

        thread::sleep(Duration::from_millis(10));
        tracker.request_stop();
        assert!(tracker.wait_drained(Duration::from_secs(5)));
        assert_eq!(tracker.outstanding(), 0);

        let deliveries = events.join().unwrap();
        assert!(deliveries >= 2);
        assert_eq!(tracker.state(), StreamState::Stopped);
    }

    #[test]
    fn test_drain_times_out() {
        let tracker = TransferTracker::new();
        tracker.begin();
        tracker.submit(|| Ok(())).unwrap();
        tracker.request_stop();
        assert!(!tracker.wait_drained(Duration::from_millis(20)));
        assert_eq!(tracker.outstanding(), 1);
    }

    #[test]
    fn test_detached_sink_drops_payloads() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        let context = CallbackContext {
            kind: TransferKind::Bulk,
            sink: Mutex::new(Box::new(move |data: &[u8]| {
                counter.fetch_add(data.len(), Ordering::Relaxed);
            })),
            tracker: Arc::new(TransferTracker::new()),
            transfers: Vec::new(),
        };

        context.sink.lock().unwrap().on_payload(&[0; 8]);
        assert_eq!(delivered.load(Ordering::Relaxed), 8);

        context.detach_sink();
        context.sink.lock().unwrap().on_payload(&[0; 8]);
        assert_eq!(delivered.load(Ordering::Relaxed), 8);
        // The consumer's sink was dropped
        assert_eq!(Arc::strong_count(&delivered), 1);
    }

    #[test]
    fn test_closure_is_payload_sink() {
        let mut total = 0usize;
        {
            let mut sink = |data: &[u8]| total += data.len();
            sink.on_payload(&[1, 2, 3]);
            sink.on_payload(&[4]);
        }
        assert_eq!(total, 4);
    }
}
