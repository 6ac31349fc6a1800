//! Image controls and their sensor register encodings

use serde::{Deserialize, Serialize};

use crate::registers::{ControlTransport, RegisterClient};

/// Sensor register holding the packed analog gain
pub const REG_GAIN: u8 = 0x00;
/// Sensor register holding the hue
pub const REG_HUE: u8 = 0x01;
/// Sensor register holding the exposure high bit
pub const REG_EXPOSURE_HIGH: u8 = 0x08;
/// Sensor register holding the exposure low bits
pub const REG_EXPOSURE_LOW: u8 = 0x10;
/// Sensor register with the flip bits
pub const REG_FLIP: u8 = 0x0c;
/// Sensor register enabling AGC/AEC/AWB
pub const REG_COM8: u8 = 0x13;
/// Sensor register with the auto-mode enable bits
pub const REG_AUTO_EXT: u8 = 0x64;
/// Sensor register selecting auto white balance
pub const REG_AWB: u8 = 0x63;

/// One image control with its value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Control {
    /// Automatic gain and exposure
    AutoGain(bool),
    /// Automatic white balance
    AutoWhiteBalance(bool),
    /// Analog gain, 0-63
    Gain(u8),
    /// Exposure
    Exposure(u8),
    /// Noise filter strength, 0-63
    Sharpness(u8),
    /// Hue
    Hue(u8),
    /// Brightness
    Brightness(u8),
    /// Contrast
    Contrast(u8),
    /// Red channel balance
    RedBalance(u8),
    /// Blue channel balance
    BlueBalance(u8),
    /// Image mirroring
    Flip {
        /// Mirror left-right
        horizontal: bool,
        /// Mirror top-bottom
        vertical: bool,
    },
}

/// Cached values of every image control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraControls {
    /// Automatic gain and exposure
    pub auto_gain: bool,
    /// Analog gain
    pub gain: u8,
    /// Exposure
    pub exposure: u8,
    /// Noise filter strength
    pub sharpness: u8,
    /// Hue
    pub hue: u8,
    /// Automatic white balance
    pub auto_white_balance: bool,
    /// Brightness
    pub brightness: u8,
    /// Contrast
    pub contrast: u8,
    /// Blue channel balance
    pub blue_balance: u8,
    /// Red channel balance
    pub red_balance: u8,
    /// Mirror left-right
    pub flip_horizontal: bool,
    /// Mirror top-bottom
    pub flip_vertical: bool,
}

impl Default for CameraControls {
    fn default() -> Self {
        Self {
            auto_gain: false,
            gain: 20,
            exposure: 120,
            sharpness: 0,
            hue: 143,
            auto_white_balance: false,
            brightness: 20,
            contrast: 37,
            blue_balance: 128,
            red_balance: 128,
            flip_horizontal: false,
            flip_vertical: false,
        }
    }
}

impl CameraControls {
    /// Store a control value
    pub fn set(&mut self, control: Control) {
        match control {
            Control::AutoGain(v) => self.auto_gain = v,
            Control::AutoWhiteBalance(v) => self.auto_white_balance = v,
            Control::Gain(v) => self.gain = v,
            Control::Exposure(v) => self.exposure = v,
            Control::Sharpness(v) => self.sharpness = v,
            Control::Hue(v) => self.hue = v,
            Control::Brightness(v) => self.brightness = v,
            Control::Contrast(v) => self.contrast = v,
            Control::RedBalance(v) => self.red_balance = v,
            Control::BlueBalance(v) => self.blue_balance = v,
            Control::Flip {
                horizontal,
                vertical,
            } => {
                self.flip_horizontal = horizontal;
                self.flip_vertical = vertical;
            }
        }
    }

    /// Every control, in the order they are re-applied when streaming starts
    pub fn apply_order(&self) -> [Control; 11] {
        [
            Control::AutoGain(self.auto_gain),
            Control::AutoWhiteBalance(self.auto_white_balance),
            Control::Gain(self.gain),
            Control::Hue(self.hue),
            Control::Exposure(self.exposure),
            Control::Brightness(self.brightness),
            Control::Contrast(self.contrast),
            Control::Sharpness(self.sharpness),
            Control::RedBalance(self.red_balance),
            Control::BlueBalance(self.blue_balance),
            Control::Flip {
                horizontal: self.flip_horizontal,
                vertical: self.flip_vertical,
            },
        ]
    }

    /// Write one control to the sensor
    ///
    /// Turning auto gain off re-pushes the cached gain and exposure so the
    /// sensor drops the values its AGC/AEC loop settled on.
    pub fn push<T: ControlTransport + ?Sized>(
        &self,
        control: Control,
        regs: &mut RegisterClient,
        dev: &mut T,
    ) {
        log::trace!("Applying {:?}", control);
        match control {
            Control::AutoGain(true) => {
                regs.sensor_write(dev, REG_COM8, 0xf7);
                let ext = regs.sensor_read(dev, REG_AUTO_EXT) | 0x03;
                regs.sensor_write(dev, REG_AUTO_EXT, ext);
            }
            Control::AutoGain(false) => {
                regs.sensor_write(dev, REG_COM8, 0xf0);
                let ext = regs.sensor_read(dev, REG_AUTO_EXT) & 0xfc;
                regs.sensor_write(dev, REG_AUTO_EXT, ext);
                self.push(Control::Gain(self.gain), regs, dev);
                self.push(Control::Exposure(self.exposure), regs, dev);
            }
            Control::AutoWhiteBalance(on) => {
                regs.sensor_write(dev, REG_AWB, if on { 0xe0 } else { 0xaa });
            }
            Control::Gain(v) => regs.sensor_write(dev, REG_GAIN, encode_gain(v)),
            Control::Exposure(v) => {
                let (high, low) = encode_exposure(v);
                regs.sensor_write(dev, REG_EXPOSURE_HIGH, high);
                regs.sensor_write(dev, REG_EXPOSURE_LOW, low);
            }
            Control::Sharpness(v) => {
                regs.sensor_write(dev, 0x91, v); // VGA noise
                regs.sensor_write(dev, 0x8e, v); // QVGA noise
            }
            Control::Hue(v) => regs.sensor_write(dev, REG_HUE, v),
            Control::Brightness(v) => regs.sensor_write(dev, 0x9b, v),
            Control::Contrast(v) => regs.sensor_write(dev, 0x9c, v),
            Control::RedBalance(v) => regs.sensor_write(dev, 0x43, v),
            Control::BlueBalance(v) => regs.sensor_write(dev, 0x42, v),
            Control::Flip {
                horizontal,
                vertical,
            } => {
                let current = regs.sensor_read(dev, REG_FLIP);
                regs.sensor_write(dev, REG_FLIP, encode_flip(current, horizontal, vertical));
            }
        }
    }
}

/// Pack a gain value into the sensor's range-select + magnitude layout
///
/// Bits 4-5 pick the range, which becomes a thermometer code in the high
/// nibble; bits 0-3 are the magnitude.
pub fn encode_gain(val: u8) -> u8 {
    let magnitude = val & 0x0f;
    match val & 0x30 {
        0x00 => magnitude,
        0x10 => magnitude | 0x30,
        0x20 => magnitude | 0x70,
        _ => magnitude | 0xf0,
    }
}

/// Split exposure into the high-bit and low-bits register values
pub fn encode_exposure(val: u8) -> (u8, u8) {
    (val >> 7, val << 1)
}

/// Set the flip bits of the current 0x0c value; the bits are active-low
pub fn encode_flip(current: u8, horizontal: bool, vertical: bool) -> u8 {
    let mut val = current & !0xc0;
    if !horizontal {
        val |= 0x40;
    }
    if !vertical {
        val |= 0x80;
    }
    val
}
