//! Safe wrappers around the libusb FFI bindings
//!
//! This module is the USB transport capability the rest of the crate is
//! built on: a shared context, device enumeration with reference-counted
//! device objects, opened handles with control transfers and interface
//! management, endpoint discovery from the active configuration, and the
//! event-processing call that drives asynchronous transfers.
//!
//! Asynchronous transfer submission lives in [`crate::transfer`]; this module
//! only exposes the raw pointers it needs.

use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// libusb error codes
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LibusbError {
    /// Input/output error
    #[error("I/O error")]
    IoError = -1,
    /// Invalid parameter
    #[error("Invalid parameter")]
    InvalidParam = -2,
    /// Access denied (insufficient permissions)
    #[error("Access denied")]
    Access = -3,
    /// No such device (it may have been disconnected)
    #[error("No such device")]
    NoDevice = -4,
    /// Entity not found
    #[error("Entity not found")]
    NotFound = -5,
    /// Resource busy
    #[error("Resource busy")]
    Busy = -6,
    /// Operation timed out
    #[error("Operation timed out")]
    Timeout = -7,
    /// Overflow
    #[error("Overflow")]
    Overflow = -8,
    /// Pipe error
    #[error("Pipe error")]
    Pipe = -9,
    /// System call interrupted
    #[error("System call interrupted")]
    Interrupted = -10,
    /// Insufficient memory
    #[error("Insufficient memory")]
    NoMem = -11,
    /// Operation not supported or unimplemented on this platform
    #[error("Operation not supported")]
    NotSupported = -12,
    /// Any other error
    #[error("Other error")]
    Other = -99,
}

impl From<i32> for LibusbError {
    fn from(code: i32) -> Self {
        match code {
            -1 => LibusbError::IoError,
            -2 => LibusbError::InvalidParam,
            -3 => LibusbError::Access,
            -4 => LibusbError::NoDevice,
            -5 => LibusbError::NotFound,
            -6 => LibusbError::Busy,
            -7 => LibusbError::Timeout,
            -8 => LibusbError::Overflow,
            -9 => LibusbError::Pipe,
            -10 => LibusbError::Interrupted,
            -11 => LibusbError::NoMem,
            -12 => LibusbError::NotSupported,
            _ => LibusbError::Other,
        }
    }
}

/// Map a negative libusb return code to an error, passing non-negative values through.
pub(crate) fn check(ret: i32) -> Result<i32, LibusbError> {
    if ret < 0 {
        Err(LibusbError::from(ret))
    } else {
        Ok(ret)
    }
}

/// libusb transfer status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(i32)]
pub enum TransferStatus {
    /// Transfer completed without error
    Completed = 0,
    /// Transfer failed due to I/O error
    Error = 1,
    /// Transfer timed out
    TimedOut = 2,
    /// Transfer was cancelled
    Cancelled = 3,
    /// Endpoint stalled
    Stall = 4,
    /// Device disconnected
    NoDevice = 5,
    /// Data overflow (device sent more data than requested)
    Overflow = 6,
}

impl From<i32> for TransferStatus {
    fn from(status: i32) -> Self {
        match status {
            0 => TransferStatus::Completed,
            2 => TransferStatus::TimedOut,
            3 => TransferStatus::Cancelled,
            4 => TransferStatus::Stall,
            5 => TransferStatus::NoDevice,
            6 => TransferStatus::Overflow,
            _ => TransferStatus::Error,
        }
    }
}

/// USB transfer types, as encoded in `bmAttributes` and `libusb_transfer::transfer_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferType {
    /// Control transfer
    Control = 0,
    /// Isochronous transfer
    Isochronous = 1,
    /// Bulk transfer
    Bulk = 2,
    /// Interrupt transfer
    Interrupt = 3,
}

impl TransferType {
    /// Decode the transfer type bits of an endpoint's `bmAttributes`
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

/// Standard request-type bits used by the vendor register protocol
pub mod request {
    /// Device-to-host data phase
    pub const ENDPOINT_IN: u8 = 0x80;
    /// Host-to-device data phase
    pub const ENDPOINT_OUT: u8 = 0x00;
    /// Vendor-specific request type
    pub const TYPE_VENDOR: u8 = 0x02 << 5;
    /// Request addressed to the device
    pub const RECIPIENT_DEVICE: u8 = 0x00;
}

/// Information about an endpoint found in the active configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Endpoint address (includes direction bit)
    pub address: u8,
    /// Transfer type of the endpoint
    pub transfer_type: TransferType,
    /// Maximum packet size in bytes (bits 0-10 of `wMaxPacketSize`)
    pub max_packet_size: u16,
    /// Interface number this endpoint belongs to
    pub interface_number: u8,
    /// Alternate setting that exposes this endpoint
    pub alt_setting: u8,
}

/// USB device descriptor information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Vendor ID
    pub vendor_id: u16,
    /// Product ID
    pub product_id: u16,
    /// Device class code
    pub device_class: u8,
    /// Number of configurations
    pub num_configurations: u8,
}

/// Owned libusb context
///
/// Shared through `Arc` by every device and handle created from it, so
/// `libusb_exit` only runs once the last of them has been dropped.
pub struct UsbContext {
    ctx: *mut libusb1_sys::libusb_context,
}

// SAFETY: libusb contexts are internally synchronized; concurrent event
// handling from several threads is part of the libusb API contract.
unsafe impl Send for UsbContext {}
unsafe impl Sync for UsbContext {}

impl UsbContext {
    /// Create a new libusb context
    ///
    /// # Errors
    ///
    /// Returns the libusb error if `libusb_init` fails.
    pub fn new() -> Result<Arc<Self>, LibusbError> {
        let mut ctx: *mut libusb1_sys::libusb_context = ptr::null_mut();
        // SAFETY: ctx is a valid out-pointer
        let ret = unsafe { libusb1_sys::libusb_init(&mut ctx) };
        if ret < 0 {
            log::error!("libusb_init failed: {}", ret);
            return Err(LibusbError::from(ret));
        }
        log::debug!("libusb context initialized");
        Ok(Arc::new(UsbContext { ctx }))
    }

    /// Get the raw libusb context pointer
    pub fn as_ptr(&self) -> *mut libusb1_sys::libusb_context {
        self.ctx
    }

    /// Process pending USB events, waiting at most `timeout`
    ///
    /// Transfer completion callbacks run synchronously inside this call on
    /// the calling thread. An interrupted wait is not reported as an error.
    ///
    /// # Errors
    ///
    /// Returns the libusb error for any failure other than `Interrupted`.
    pub fn handle_events_timeout(&self, timeout: Duration) -> Result<(), LibusbError> {
        let mut timeval = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        // SAFETY: ctx is valid for the lifetime of self
        let ret = unsafe { libusb1_sys::libusb_handle_events_timeout(self.ctx, &mut timeval) };
        match check(ret) {
            Ok(_) | Err(LibusbError::Interrupted) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Scan the bus and return every attached device
    ///
    /// Each returned [`UsbDevice`] holds its own libusb reference.
    ///
    /// # Errors
    ///
    /// Returns the libusb error if the device list cannot be obtained.
    pub fn devices(self: &Arc<Self>) -> Result<Vec<UsbDevice>, LibusbError> {
        let mut list: *const *mut libusb1_sys::libusb_device = ptr::null();
        // SAFETY: list is a valid out-pointer; freed below
        let count = unsafe { libusb1_sys::libusb_get_device_list(self.ctx, &mut list) };
        if count < 0 {
            return Err(LibusbError::from(count as i32));
        }

        let mut devices = Vec::with_capacity(count as usize);
        // SAFETY: libusb returned `count` valid device pointers
        unsafe {
            for &dev in std::slice::from_raw_parts(list, count as usize) {
                devices.push(UsbDevice::from_raw(Arc::clone(self), dev));
            }
            // Our own references keep the devices alive after the list is unreferenced
            libusb1_sys::libusb_free_device_list(list, 1);
        }
        Ok(devices)
    }
}

impl Drop for UsbContext {
    fn drop(&mut self) {
        if !self.ctx.is_null() {
            log::debug!("Releasing libusb context");
            // SAFETY: every device and handle holds an Arc to us, so none remain
            unsafe { libusb1_sys::libusb_exit(self.ctx) };
        }
    }
}

/// A reference-counted, unopened USB device
pub struct UsbDevice {
    ctx: Arc<UsbContext>,
    device: *mut libusb1_sys::libusb_device,
}

// SAFETY: libusb device objects are reference counted under an internal lock
unsafe impl Send for UsbDevice {}
unsafe impl Sync for UsbDevice {}

impl UsbDevice {
    /// Take a new libusb reference on `device`.
    ///
    /// # Safety
    /// `device` must be a valid device pointer belonging to `ctx`.
    unsafe fn from_raw(ctx: Arc<UsbContext>, device: *mut libusb1_sys::libusb_device) -> Self {
        libusb1_sys::libusb_ref_device(device);
        Self { ctx, device }
    }

    /// The context this device belongs to
    pub fn context(&self) -> &Arc<UsbContext> {
        &self.ctx
    }

    /// Read the device descriptor
    ///
    /// # Errors
    ///
    /// Returns the libusb error if the descriptor cannot be read.
    pub fn descriptor(&self) -> Result<DeviceDescriptor, LibusbError> {
        // SAFETY: device is valid while we hold our reference
        unsafe {
            let mut desc = std::mem::zeroed::<libusb1_sys::libusb_device_descriptor>();
            check(libusb1_sys::libusb_get_device_descriptor(self.device, &mut desc))?;
            Ok(DeviceDescriptor {
                vendor_id: desc.idVendor,
                product_id: desc.idProduct,
                device_class: desc.bDeviceClass,
                num_configurations: desc.bNumConfigurations,
            })
        }
    }

    /// Bus number the device is attached to
    pub fn bus_number(&self) -> u8 {
        // SAFETY: device is valid while we hold our reference
        unsafe { libusb1_sys::libusb_get_bus_number(self.device) }
    }

    /// Address of the device on its bus
    pub fn address(&self) -> u8 {
        // SAFETY: device is valid while we hold our reference
        unsafe { libusb1_sys::libusb_get_device_address(self.device) }
    }

    /// Open the device
    ///
    /// # Errors
    ///
    /// Returns the libusb error if `libusb_open` fails.
    pub fn open(&self) -> Result<UsbDeviceHandle, LibusbError> {
        let mut handle: *mut libusb1_sys::libusb_device_handle = ptr::null_mut();
        // SAFETY: device is valid; handle is a valid out-pointer
        let ret = unsafe { libusb1_sys::libusb_open(self.device, &mut handle) };
        if ret < 0 {
            log::error!("libusb_open failed: {}", LibusbError::from(ret));
            return Err(LibusbError::from(ret));
        }
        if handle.is_null() {
            return Err(LibusbError::NoDevice);
        }
        Ok(UsbDeviceHandle {
            ctx: Arc::clone(&self.ctx),
            handle,
            detached: Vec::new(),
        })
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        // SAFETY: releases the reference taken in from_raw
        unsafe { libusb1_sys::libusb_unref_device(self.device) };
    }
}

/// An opened USB device handle
///
/// Interfaces whose kernel driver was detached by [`claim_interface`](Self::claim_interface)
/// get the driver reattached when they are released.
pub struct UsbDeviceHandle {
    ctx: Arc<UsbContext>,
    handle: *mut libusb1_sys::libusb_device_handle,
    detached: Vec<i32>,
}

// SAFETY: libusb device handles may be used from any thread
unsafe impl Send for UsbDeviceHandle {}
unsafe impl Sync for UsbDeviceHandle {}

impl UsbDeviceHandle {
    /// Get the raw libusb device handle pointer
    pub fn as_ptr(&self) -> *mut libusb1_sys::libusb_device_handle {
        self.handle
    }

    /// The context this handle belongs to
    pub fn context(&self) -> &Arc<UsbContext> {
        &self.ctx
    }

    /// Detach a kernel driver from an interface if one is attached
    ///
    /// Returns `true` if a driver was detached.
    ///
    /// # Errors
    ///
    /// Returns the libusb error if detaching fails.
    pub fn detach_kernel_driver(&mut self, interface_number: i32) -> Result<bool, LibusbError> {
        // SAFETY: handle is valid for the lifetime of self
        let active = unsafe { libusb1_sys::libusb_kernel_driver_active(self.handle, interface_number) };
        match active {
            1 => {
                log::info!(
                    "Kernel driver active on interface {}, detaching",
                    interface_number
                );
                // SAFETY: handle is valid
                check(unsafe {
                    libusb1_sys::libusb_detach_kernel_driver(self.handle, interface_number)
                })?;
                self.detached.push(interface_number);
                Ok(true)
            }
            -12 => {
                log::debug!("Kernel driver check not supported on this platform");
                Ok(false)
            }
            ret if ret < 0 => {
                log::warn!("libusb_kernel_driver_active returned error: {}", ret);
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    /// Claim an interface, detaching a conflicting kernel driver first
    ///
    /// # Errors
    ///
    /// Returns the libusb error if the claim fails.
    pub fn claim_interface(&mut self, interface_number: i32) -> Result<(), LibusbError> {
        if let Err(e) = self.detach_kernel_driver(interface_number) {
            log::warn!(
                "Could not detach kernel driver from interface {}: {}",
                interface_number,
                e
            );
        }

        // SAFETY: handle is valid
        let ret = unsafe { libusb1_sys::libusb_claim_interface(self.handle, interface_number) };
        if ret < 0 {
            log::error!(
                "libusb_claim_interface({}) failed: {}",
                interface_number,
                LibusbError::from(ret)
            );
            return Err(LibusbError::from(ret));
        }
        log::debug!("Claimed interface {}", interface_number);
        Ok(())
    }

    /// Release an interface, reattaching the kernel driver if we detached it
    ///
    /// # Errors
    ///
    /// Returns the libusb error if the release fails.
    pub fn release_interface(&mut self, interface_number: i32) -> Result<(), LibusbError> {
        // SAFETY: handle is valid
        check(unsafe { libusb1_sys::libusb_release_interface(self.handle, interface_number) })?;

        if let Some(pos) = self.detached.iter().position(|&i| i == interface_number) {
            self.detached.swap_remove(pos);
            // SAFETY: handle is valid
            let ret =
                unsafe { libusb1_sys::libusb_attach_kernel_driver(self.handle, interface_number) };
            if ret < 0 {
                log::warn!(
                    "Failed to reattach kernel driver to interface {}: {}",
                    interface_number,
                    LibusbError::from(ret)
                );
            } else {
                log::info!("Reattached kernel driver to interface {}", interface_number);
            }
        }
        Ok(())
    }

    /// Select a device configuration
    ///
    /// # Errors
    ///
    /// Returns the libusb error if the configuration cannot be set.
    pub fn set_configuration(&self, configuration: i32) -> Result<(), LibusbError> {
        // SAFETY: handle is valid
        check(unsafe { libusb1_sys::libusb_set_configuration(self.handle, configuration) })?;
        Ok(())
    }

    /// Set the alternate setting for a claimed interface
    ///
    /// # Errors
    ///
    /// Returns the libusb error if the alternate setting cannot be selected.
    pub fn set_interface_alt_setting(
        &self,
        interface_number: i32,
        alt_setting: i32,
    ) -> Result<(), LibusbError> {
        // SAFETY: handle is valid
        check(unsafe {
            libusb1_sys::libusb_set_interface_alt_setting(self.handle, interface_number, alt_setting)
        })?;
        log::debug!(
            "Set interface {} to alternate setting {}",
            interface_number,
            alt_setting
        );
        Ok(())
    }

    /// Clear a halt/stall condition on an endpoint
    ///
    /// # Errors
    ///
    /// Returns the libusb error if the request fails.
    pub fn clear_halt(&self, endpoint: u8) -> Result<(), LibusbError> {
        // SAFETY: handle is valid
        check(unsafe { libusb1_sys::libusb_clear_halt(self.handle, endpoint) })?;
        Ok(())
    }

    /// Perform a synchronous control transfer
    ///
    /// Returns the number of bytes transferred in the data phase.
    ///
    /// # Errors
    ///
    /// Returns the libusb error if the transfer fails.
    pub fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, LibusbError> {
        // SAFETY: data outlives the synchronous call
        let ret = unsafe {
            libusb1_sys::libusb_control_transfer(
                self.handle,
                request_type,
                request,
                value,
                index,
                data.as_mut_ptr(),
                data.len() as u16,
                timeout.as_millis() as libc::c_uint,
            )
        };
        Ok(check(ret)? as usize)
    }

    /// Find the first endpoint of `transfer_type` with a nonzero max packet size
    ///
    /// Scans the active configuration for `interface_number`; when
    /// `alt_setting` is `None`, only the interface's first alternate setting
    /// is considered.
    ///
    /// # Errors
    ///
    /// Returns the libusb error if the configuration descriptor cannot be read.
    pub fn find_endpoint(
        &self,
        interface_number: u8,
        alt_setting: Option<u8>,
        transfer_type: TransferType,
    ) -> Result<Option<EndpointInfo>, LibusbError> {
        // SAFETY: the descriptor is only read between get and free below
        unsafe {
            let device = libusb1_sys::libusb_get_device(self.handle);
            let mut cfg_desc: *const libusb1_sys::libusb_config_descriptor = ptr::null();
            check(libusb1_sys::libusb_get_active_config_descriptor(
                device,
                &mut cfg_desc,
            ))?;

            let cfg = &*cfg_desc;
            let mut found = None;

            'interfaces: for i in 0..cfg.bNumInterfaces as usize {
                let interface = &*cfg.interface.add(i);
                let alt_count = match alt_setting {
                    Some(_) => interface.num_altsetting as usize,
                    None => 1usize.min(interface.num_altsetting as usize),
                };

                for j in 0..alt_count {
                    let altsetting = &*interface.altsetting.add(j);
                    if altsetting.bInterfaceNumber != interface_number {
                        continue;
                    }
                    if let Some(alt) = alt_setting {
                        if altsetting.bAlternateSetting != alt {
                            continue;
                        }
                    }

                    for k in 0..altsetting.bNumEndpoints as usize {
                        let ep = &*altsetting.endpoint.add(k);
                        let max_packet_size = ep.wMaxPacketSize & 0x7FF;
                        if TransferType::from_attributes(ep.bmAttributes) == transfer_type
                            && max_packet_size != 0
                        {
                            log::debug!(
                                "Found {:?} endpoint 0x{:02x} on interface {}.{} (maxPacket={})",
                                transfer_type,
                                ep.bEndpointAddress,
                                altsetting.bInterfaceNumber,
                                altsetting.bAlternateSetting,
                                max_packet_size
                            );
                            found = Some(EndpointInfo {
                                address: ep.bEndpointAddress,
                                transfer_type,
                                max_packet_size,
                                interface_number: altsetting.bInterfaceNumber,
                                alt_setting: altsetting.bAlternateSetting,
                            });
                            break 'interfaces;
                        }
                    }
                }
            }

            libusb1_sys::libusb_free_config_descriptor(cfg_desc as *mut _);
            Ok(found)
        }
    }
}

impl Drop for UsbDeviceHandle {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            // SAFETY: handle was opened by libusb_open and is closed exactly once
            unsafe { libusb1_sys::libusb_close(self.handle) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_round_trip_known_values() {
        assert_eq!(LibusbError::from(-4), LibusbError::NoDevice);
        assert_eq!(LibusbError::from(-12), LibusbError::NotSupported);
        assert_eq!(LibusbError::from(-1234), LibusbError::Other);
        assert_eq!(LibusbError::Busy.to_string(), "Resource busy");
    }

    #[test]
    fn test_transfer_status_unknown_is_error() {
        assert_eq!(TransferStatus::from(3), TransferStatus::Cancelled);
        assert_eq!(TransferStatus::from(42), TransferStatus::Error);
    }

    #[test]
    fn test_transfer_type_from_attributes_ignores_sync_bits() {
        // Isochronous, asynchronous sync type, data usage
        assert_eq!(TransferType::from_attributes(0x05), TransferType::Isochronous);
        assert_eq!(TransferType::from_attributes(0x02), TransferType::Bulk);
        assert_eq!(TransferType::from_attributes(0x03), TransferType::Interrupt);
    }

    #[test]
    fn test_check_passes_non_negative_values() {
        assert_eq!(check(0), Ok(0));
        assert_eq!(check(7), Ok(7));
        assert_eq!(check(-7), Err(LibusbError::Timeout));
    }
}
