//! In-memory camera for driving a [`CaptureSession`](crate::session::CaptureSession) without hardware
//!
//! The mock keeps a bridge register file and a sensor register file and
//! answers the SCCB proxy protocol against them, so register sequences run
//! end to end. Every control transfer is logged. Once video starts, tests
//! push synthetic bulk transfers through [`MockDevice::inject`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::libusb::{request, LibusbError, TransferStatus, TransferType};
use crate::registers::{
    ControlTransport, OP_READ_2, OP_WRITE_3, REG_OPERATION, REG_READ, REG_STATUS, REG_SUBADDR,
    REG_WRITE,
};
use crate::session::{CameraDevice, CameraTransport, SessionError};
use crate::transfer::{PayloadSink, StreamError, StreamState};

/// Endpoint address the mock reports for video
pub const MOCK_VIDEO_ENDPOINT: u8 = 0x81;

/// One logged control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlCall {
    /// `bmRequestType`
    pub request_type: u8,
    /// Register addressed by `wIndex`
    pub register: u8,
    /// Byte written, or byte returned for reads
    pub data: u8,
}

impl ControlCall {
    /// Whether this was a device-to-host read
    pub fn is_read(&self) -> bool {
        self.request_type & request::ENDPOINT_IN != 0
    }
}

struct MockState {
    bridge: Vec<u8>,
    sensor: Vec<u8>,
    status: VecDeque<u8>,
    calls: Vec<ControlCall>,
    sensor_writes: Vec<(u8, u8)>,
    fail_open: Option<LibusbError>,
    fail_start: bool,
    is_open: bool,
    open_count: usize,
    sink: Option<Box<dyn PayloadSink>>,
    video_state: StreamState,
    event_calls: usize,
}

impl MockState {
    fn write_bridge(&mut self, reg: u8, val: u8) {
        self.bridge[reg as usize] = val;
        if reg != REG_OPERATION {
            return;
        }
        let subaddr = self.bridge[REG_SUBADDR as usize];
        match val {
            OP_WRITE_3 => {
                let data = self.bridge[REG_WRITE as usize];
                self.sensor[subaddr as usize] = data;
                self.sensor_writes.push((subaddr, data));
            }
            OP_READ_2 => {
                self.bridge[REG_READ as usize] = self.sensor[subaddr as usize];
            }
            _ => {}
        }
    }

    fn read_bridge(&mut self, reg: u8) -> u8 {
        if reg == REG_STATUS {
            return self.status.pop_front().unwrap_or(0x00);
        }
        self.bridge[reg as usize]
    }
}

/// A scriptable camera; clones share state
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// A closed camera whose sensor identifies as 0x7721
    pub fn new() -> Self {
        let mut sensor = vec![0u8; 256];
        sensor[0x0a] = 0x77;
        sensor[0x0b] = 0x21;
        Self {
            state: Arc::new(Mutex::new(MockState {
                bridge: vec![0u8; 256],
                sensor,
                status: VecDeque::new(),
                calls: Vec::new(),
                sensor_writes: Vec::new(),
                fail_open: None,
                fail_start: false,
                is_open: false,
                open_count: 0,
                sink: None,
                video_state: StreamState::Stopped,
                event_calls: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next opens fail with `err`
    pub fn fail_open(&self, err: Option<LibusbError>) {
        self.lock().fail_open = err;
    }

    /// Make video start fail
    pub fn fail_start(&self, fail: bool) {
        self.lock().fail_start = fail;
    }

    /// Queue replies for the SCCB status register; an empty queue answers 0x00
    pub fn script_status(&self, replies: &[u8]) {
        self.lock().status.extend(replies.iter().copied());
    }

    /// Current value of a bridge register
    pub fn bridge_register(&self, reg: u8) -> u8 {
        self.lock().bridge[reg as usize]
    }

    /// Current value of a sensor register
    pub fn sensor_register(&self, reg: u8) -> u8 {
        self.lock().sensor[reg as usize]
    }

    /// Preset a sensor register
    pub fn set_sensor_register(&self, reg: u8, val: u8) {
        self.lock().sensor[reg as usize] = val;
    }

    /// Every control transfer so far
    pub fn calls(&self) -> Vec<ControlCall> {
        self.lock().calls.clone()
    }

    /// Bridge writes so far, as `(register, value)`
    pub fn bridge_writes(&self) -> Vec<(u8, u8)> {
        self.lock()
            .calls
            .iter()
            .filter(|c| !c.is_read())
            .map(|c| (c.register, c.data))
            .collect()
    }

    /// Completed sensor writes so far, as `(register, value)`
    pub fn sensor_writes(&self) -> Vec<(u8, u8)> {
        self.lock().sensor_writes.clone()
    }

    /// Forget the logged calls and sensor writes
    pub fn clear_log(&self) {
        let mut state = self.lock();
        state.calls.clear();
        state.sensor_writes.clear();
    }

    /// Whether a transport is currently open
    pub fn is_open(&self) -> bool {
        self.lock().is_open
    }

    /// How many times the device was opened
    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    /// Whether a video sink is attached
    pub fn is_streaming(&self) -> bool {
        self.lock().sink.is_some()
    }

    /// Number of `handle_events` calls
    pub fn event_calls(&self) -> usize {
        self.lock().event_calls
    }

    /// Deliver one bulk transfer to the video sink; `false` if not streaming
    pub fn inject(&self, data: &[u8]) -> bool {
        let mut state = self.lock();
        match state.sink.as_mut() {
            Some(sink) => {
                sink.on_payload(data);
                true
            }
            None => false,
        }
    }

    /// Simulate a fatal transfer completion: the stream fails and detaches
    pub fn fail_stream(&self, status: TransferStatus) {
        let mut state = self.lock();
        state.sink = None;
        state.video_state = StreamState::Failed(status);
    }
}

impl CameraDevice for MockDevice {
    type Transport = MockTransport;

    fn open(&self) -> Result<MockTransport, SessionError> {
        let mut state = self.lock();
        if let Some(err) = state.fail_open {
            return Err(SessionError::Open(err));
        }
        state.is_open = true;
        state.open_count += 1;
        Ok(MockTransport {
            state: Arc::clone(&self.state),
        })
    }
}

/// Transport handed out by [`MockDevice`]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ControlTransport for MockTransport {
    fn control_transfer(
        &mut self,
        request_type: u8,
        _request: u8,
        _value: u16,
        index: u16,
        data: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, LibusbError> {
        let mut state = self.lock();
        let register = index as u8;
        let Some(byte) = data.first_mut() else {
            return Err(LibusbError::InvalidParam);
        };
        if request_type & request::ENDPOINT_IN != 0 {
            *byte = state.read_bridge(register);
        } else {
            state.write_bridge(register, *byte);
        }
        let call = ControlCall {
            request_type,
            register,
            data: *byte,
        };
        state.calls.push(call);
        Ok(1)
    }
}

impl CameraTransport for MockTransport {
    fn start_video(
        &mut self,
        sink: Box<dyn PayloadSink>,
        _drain_timeout: Duration,
    ) -> Result<u8, StreamError> {
        let mut state = self.lock();
        if state.fail_start {
            return Err(StreamError::NoEndpoint(TransferType::Bulk, 0));
        }
        if state.sink.is_some() {
            return Err(StreamError::AlreadyRunning);
        }
        state.sink = Some(sink);
        state.video_state = StreamState::Streaming;
        Ok(MOCK_VIDEO_ENDPOINT)
    }

    fn stop_video(&mut self) {
        let mut state = self.lock();
        state.sink = None;
        if state.video_state == StreamState::Streaming {
            state.video_state = StreamState::Stopped;
        }
    }

    fn video_state(&self) -> StreamState {
        self.lock().video_state
    }

    fn handle_events(&self, _timeout: Duration) -> Result<(), LibusbError> {
        self.lock().event_calls += 1;
        Ok(())
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        let mut state = self.lock();
        state.sink = None;
        state.is_open = false;
    }
}
