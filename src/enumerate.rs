//! Camera discovery on the USB bus
//!
//! [`DeviceEnumerator`] owns the libusb context used for discovery (created
//! lazily on the first scan) and caches the last scan result. Devices are
//! handed out as `Arc<EyeDevice>`: replacing the cache on a forced re-scan
//! never invalidates a device a caller is still holding, and the libusb
//! device reference is only dropped together with the last `Arc`.

use std::sync::Arc;

use crate::libusb::{DeviceDescriptor, UsbContext, UsbDevice};

/// USB vendor ID of the OV534 bridge
pub const VENDOR_ID: u16 = 0x1415;

/// USB product ID of the OV534 bridge
pub const PRODUCT_ID: u16 = 0x2000;

/// Whether a device descriptor identifies a supported camera
pub fn is_supported(desc: &DeviceDescriptor) -> bool {
    desc.vendor_id == VENDOR_ID && desc.product_id == PRODUCT_ID
}

/// A matching camera found on the bus, not yet opened
pub struct EyeDevice {
    device: UsbDevice,
    bus_number: u8,
    address: u8,
}

impl EyeDevice {
    fn new(device: UsbDevice) -> Self {
        let bus_number = device.bus_number();
        let address = device.address();
        Self {
            device,
            bus_number,
            address,
        }
    }

    /// The underlying USB device
    pub fn usb_device(&self) -> &UsbDevice {
        &self.device
    }

    /// Bus number the camera is attached to
    pub fn bus_number(&self) -> u8 {
        self.bus_number
    }

    /// Address of the camera on its bus
    pub fn address(&self) -> u8 {
        self.address
    }
}

impl std::fmt::Debug for EyeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EyeDevice")
            .field("bus_number", &self.bus_number)
            .field("address", &self.address)
            .finish()
    }
}

/// Scans the bus for supported cameras
#[derive(Default)]
pub struct DeviceEnumerator {
    ctx: Option<Arc<UsbContext>>,
    cache: Option<Vec<Arc<EyeDevice>>>,
}

impl DeviceEnumerator {
    /// Create an enumerator that initializes libusb on first use
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an enumerator on an existing context
    pub fn with_context(ctx: Arc<UsbContext>) -> Self {
        Self {
            ctx: Some(ctx),
            cache: None,
        }
    }

    /// The context used for discovery, creating it if needed
    ///
    /// Returns `None` (and logs) if libusb cannot be initialized.
    pub fn context(&mut self) -> Option<Arc<UsbContext>> {
        if self.ctx.is_none() {
            match UsbContext::new() {
                Ok(ctx) => self.ctx = Some(ctx),
                Err(e) => {
                    log::error!("USB unavailable: {}", e);
                    return None;
                }
            }
        }
        self.ctx.clone()
    }

    /// List supported cameras
    ///
    /// Returns the cached result of the previous scan unless `force_refresh`
    /// is set or no scan has happened yet. A bus that cannot be scanned
    /// yields an empty list.
    pub fn list_devices(&mut self, force_refresh: bool) -> Vec<Arc<EyeDevice>> {
        if !force_refresh {
            if let Some(cached) = &self.cache {
                return cached.clone();
            }
        }

        let devices = match self.context() {
            Some(ctx) => scan(&ctx),
            None => Vec::new(),
        };
        log::info!("Found {} camera(s)", devices.len());

        self.cache = Some(devices.clone());
        devices
    }

    /// Drop the cached scan result and the enumerator's context reference
    ///
    /// Devices already handed out keep the context alive.
    pub fn release(&mut self) {
        self.cache = None;
        self.ctx = None;
    }
}

fn scan(ctx: &Arc<UsbContext>) -> Vec<Arc<EyeDevice>> {
    let devices = match ctx.devices() {
        Ok(devices) => devices,
        Err(e) => {
            log::warn!("Device scan failed: {}", e);
            return Vec::new();
        }
    };

    select_supported(devices.into_iter().filter_map(|device| {
        match device.descriptor() {
            Ok(desc) => Some((desc, device)),
            Err(e) => {
                log::debug!(
                    "Skipping device {}:{}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                None
            }
        }
    }))
    .into_iter()
    .map(|device| Arc::new(EyeDevice::new(device)))
    .collect()
}

/// Keep the items whose descriptor matches, preserving bus order
fn select_supported<T>(devices: impl IntoIterator<Item = (DeviceDescriptor, T)>) -> Vec<T> {
    devices
        .into_iter()
        .filter(|(desc, _)| is_supported(desc))
        .map(|(_, device)| device)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(vendor_id: u16, product_id: u16) -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id,
            product_id,
            device_class: 0,
            num_configurations: 1,
        }
    }

    #[test]
    fn test_is_supported_requires_exact_ids() {
        assert!(is_supported(&desc(0x1415, 0x2000)));
        assert!(!is_supported(&desc(0x1415, 0x2001)));
        assert!(!is_supported(&desc(0x1416, 0x2000)));
    }

    #[test]
    fn test_select_supported_preserves_order() {
        let devices = vec![
            (desc(0x1415, 0x2000), "first"),
            (desc(0x046d, 0x0825), "webcam"),
            (desc(0x1415, 0x2000), "second"),
        ];
        assert_eq!(select_supported(devices), vec!["first", "second"]);
    }

    #[test]
    fn test_select_supported_empty_bus() {
        let devices: Vec<(DeviceDescriptor, u32)> = Vec::new();
        assert!(select_supported(devices).is_empty());
    }
}
