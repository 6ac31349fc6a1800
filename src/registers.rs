//! OV534 bridge and OV772x sensor register access
//!
//! Bridge registers are read and written directly with one-byte vendor
//! control transfers. Sensor registers sit behind the bridge's SCCB proxy:
//! the sensor register address goes into `SUBADDR`, an opcode into
//! `OPERATION`, and `STATUS` is polled until the bridge reports completion.
//!
//! Register I/O never fails the caller. A control transfer error or an
//! exhausted status poll is logged and counted, and a read then returns
//! whatever byte was last left in the scratch buffer. The camera is slow
//! but eventually consistent, and the init sequence depends on pushing on
//! past these.

use std::time::Duration;

use crate::libusb::{request, LibusbError, UsbDeviceHandle};

/// Vendor request code for every bridge register access
pub const REGISTER_REQUEST: u8 = 0x01;

/// Timeout for a single register control transfer
pub const REGISTER_TIMEOUT: Duration = Duration::from_millis(500);

/// Number of status reads before an SCCB operation is given up on
pub const SCCB_STATUS_POLLS: usize = 5;

/// Bridge register: sensor bus address
pub const REG_ADDRESS: u8 = 0xf1;
/// Bridge register: sensor register address
pub const REG_SUBADDR: u8 = 0xf2;
/// Bridge register: byte to write to the sensor
pub const REG_WRITE: u8 = 0xf3;
/// Bridge register: byte read from the sensor
pub const REG_READ: u8 = 0xf4;
/// Bridge register: SCCB opcode trigger
pub const REG_OPERATION: u8 = 0xf5;
/// Bridge register: SCCB status
pub const REG_STATUS: u8 = 0xf6;

/// SCCB opcode: three-phase write
pub const OP_WRITE_3: u8 = 0x37;
/// SCCB opcode: two-phase write (register select for a read)
pub const OP_WRITE_2: u8 = 0x33;
/// SCCB opcode: two-phase read
pub const OP_READ_2: u8 = 0xf9;

/// Bridge register controlling the video stream
pub const REG_STREAM: u8 = 0xe0;
/// `REG_STREAM` value that starts streaming
pub const STREAM_START: u8 = 0x00;
/// `REG_STREAM` value that stops streaming
pub const STREAM_STOP: u8 = 0x09;

const REG_LED_DIR: u8 = 0x21;
const REG_LED_DATA: u8 = 0x23;
const LED_BIT: u8 = 0x80;

/// Something that can carry vendor control transfers to the camera
///
/// Implemented by the real USB handle and by the test mock.
pub trait ControlTransport {
    /// Perform one synchronous control transfer, returning the data-phase length
    ///
    /// # Errors
    ///
    /// Returns the transport error if the transfer fails.
    fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, LibusbError>;
}

impl ControlTransport for UsbDeviceHandle {
    fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, LibusbError> {
        UsbDeviceHandle::control_transfer(self, request_type, request, value, index, data, timeout)
    }
}

/// Outcome of polling the SCCB status register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SccbStatus {
    Done,
    Failed,
    TimedOut,
}

/// Register protocol client with a one-byte scratch buffer
///
/// The scratch byte persists across calls: a read whose transfer fails
/// returns the previous contents, matching the hardware protocol's
/// best-effort behavior.
#[derive(Debug, Default)]
pub struct RegisterClient {
    scratch: u8,
    soft_failures: u64,
}

impl RegisterClient {
    /// Create a client with a zeroed scratch buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of register operations that failed and were skipped over
    pub fn soft_failures(&self) -> u64 {
        self.soft_failures
    }

    /// Write a bridge register
    pub fn bridge_write<T: ControlTransport + ?Sized>(&mut self, dev: &mut T, reg: u8, val: u8) {
        self.scratch = val;
        let request_type = request::ENDPOINT_OUT | request::TYPE_VENDOR | request::RECIPIENT_DEVICE;
        let mut data = [self.scratch];
        if let Err(e) = dev.control_transfer(
            request_type,
            REGISTER_REQUEST,
            0,
            reg as u16,
            &mut data,
            REGISTER_TIMEOUT,
        ) {
            log::warn!("Bridge write 0x{:02x}=0x{:02x} failed: {}", reg, val, e);
            self.soft_failures += 1;
        }
    }

    /// Read a bridge register
    pub fn bridge_read<T: ControlTransport + ?Sized>(&mut self, dev: &mut T, reg: u8) -> u8 {
        let request_type = request::ENDPOINT_IN | request::TYPE_VENDOR | request::RECIPIENT_DEVICE;
        let mut data = [self.scratch];
        match dev.control_transfer(
            request_type,
            REGISTER_REQUEST,
            0,
            reg as u16,
            &mut data,
            REGISTER_TIMEOUT,
        ) {
            Ok(_) => self.scratch = data[0],
            Err(e) => {
                log::warn!("Bridge read 0x{:02x} failed: {}", reg, e);
                self.soft_failures += 1;
            }
        }
        self.scratch
    }

    /// Poll the SCCB status register
    fn sccb_check_status<T: ControlTransport + ?Sized>(&mut self, dev: &mut T) -> SccbStatus {
        for _ in 0..SCCB_STATUS_POLLS {
            match self.bridge_read(dev, REG_STATUS) {
                0x00 => return SccbStatus::Done,
                0x04 => return SccbStatus::Failed,
                0x03 => {}
                other => log::debug!("Unexpected SCCB status 0x{:02x}", other),
            }
        }
        SccbStatus::TimedOut
    }

    fn sccb_wait<T: ControlTransport + ?Sized>(&mut self, dev: &mut T, what: &str, reg: u8) -> bool {
        match self.sccb_check_status(dev) {
            SccbStatus::Done => true,
            status => {
                log::debug!("SCCB {} 0x{:02x}: {:?}", what, reg, status);
                self.soft_failures += 1;
                false
            }
        }
    }

    /// Write a sensor register through the bridge
    pub fn sensor_write<T: ControlTransport + ?Sized>(&mut self, dev: &mut T, reg: u8, val: u8) {
        self.bridge_write(dev, REG_SUBADDR, reg);
        self.bridge_write(dev, REG_WRITE, val);
        self.bridge_write(dev, REG_OPERATION, OP_WRITE_3);
        self.sccb_wait(dev, "write", reg);
    }

    /// Read a sensor register through the bridge
    ///
    /// The result register is read even if a status poll gave up.
    pub fn sensor_read<T: ControlTransport + ?Sized>(&mut self, dev: &mut T, reg: u8) -> u8 {
        self.bridge_write(dev, REG_SUBADDR, reg);
        self.bridge_write(dev, REG_OPERATION, OP_WRITE_2);
        self.sccb_wait(dev, "select", reg);
        self.bridge_write(dev, REG_OPERATION, OP_READ_2);
        self.sccb_wait(dev, "read", reg);
        self.bridge_read(dev, REG_READ)
    }

    /// Upload an ordered `(register, value)` table to the bridge
    pub fn write_bridge_table<T: ControlTransport + ?Sized>(&mut self, dev: &mut T, table: &[(u8, u8)]) {
        for &(reg, val) in table {
            self.bridge_write(dev, reg, val);
        }
    }

    /// Upload an ordered `(register, value)` table to the sensor
    ///
    /// Register 0xff is a pseudo-entry: it reads sensor register `val`
    /// and then writes 0 to 0xff.
    pub fn write_sensor_table<T: ControlTransport + ?Sized>(&mut self, dev: &mut T, table: &[(u8, u8)]) {
        for &(reg, val) in table {
            if reg == 0xff {
                self.sensor_read(dev, val);
                self.sensor_write(dev, 0xff, 0x00);
            } else {
                self.sensor_write(dev, reg, val);
            }
        }
    }

    /// Switch the indicator LED
    pub fn set_led<T: ControlTransport + ?Sized>(&mut self, dev: &mut T, on: bool) {
        let dir = self.bridge_read(dev, REG_LED_DIR) | LED_BIT;
        self.bridge_write(dev, REG_LED_DIR, dir);

        let mut data = self.bridge_read(dev, REG_LED_DATA);
        if on {
            data |= LED_BIT;
        } else {
            data &= !LED_BIT;
        }
        self.bridge_write(dev, REG_LED_DATA, data);

        if !on {
            let dir = self.bridge_read(dev, REG_LED_DIR) & !LED_BIT;
            self.bridge_write(dev, REG_LED_DIR, dir);
        }
    }
}
