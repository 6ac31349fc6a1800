//! Synthetic bulk video payloads for testing
//!
//! Builds the 2048-byte payload units the bridge emits, grouped into bulk
//! transfers the way the hardware ends them: a frame's last, short unit
//! terminates its transfer.
//!
//! # Example
//!
//! ```rust,ignore
//! use ps3eye::test_utils::{PayloadGenerator, Rgb};
//!
//! let mut gen = PayloadGenerator::default();
//! let frame = PayloadGenerator::yuyv_solid(640, 480, Rgb::RED);
//! for transfer in gen.frame_transfers(&frame) {
//!     assembler.process_transfer(&transfer);
//! }
//! ```

use crate::frame_assembler::{flags, HEADER_LEN, PAYLOAD_UNIT_SIZE};
use crate::usb::VIDEO_TRANSFER_SIZE;

/// Payload bytes carried by one full unit
pub const UNIT_PAYLOAD: usize = PAYLOAD_UNIT_SIZE - HEADER_LEN;

/// RGB color for test patterns
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgb {
    /// Red component
    pub r: u8,
    /// Green component
    pub g: u8,
    /// Blue component
    pub b: u8,
}

impl Rgb {
    /// Pure red
    pub const RED: Rgb = Rgb { r: 255, g: 0, b: 0 };
    /// Pure white
    pub const WHITE: Rgb = Rgb {
        r: 255,
        g: 255,
        b: 255,
    };
    /// Pure black
    pub const BLACK: Rgb = Rgb { r: 0, g: 0, b: 0 };

    /// BT.601 limited-range (Y, U, V)
    pub fn to_yuv(&self) -> (u8, u8, u8) {
        let r = self.r as f32;
        let g = self.g as f32;
        let b = self.b as f32;

        let y = (16.0 + 65.481 * r / 255.0 + 128.553 * g / 255.0 + 24.966 * b / 255.0)
            .clamp(16.0, 235.0) as u8;
        let u = (128.0 - 37.797 * r / 255.0 - 74.203 * g / 255.0 + 112.0 * b / 255.0)
            .clamp(16.0, 240.0) as u8;
        let v = (128.0 + 112.0 * r / 255.0 - 93.786 * g / 255.0 - 18.214 * b / 255.0)
            .clamp(16.0, 240.0) as u8;
        (y, u, v)
    }
}

/// Generates header-tagged payload units and bulk transfers
#[derive(Debug, Clone)]
pub struct PayloadGenerator {
    /// Maximum bulk transfer size
    pub transfer_size: usize,
    fid: bool,
    pts: u32,
}

impl Default for PayloadGenerator {
    fn default() -> Self {
        Self::new(VIDEO_TRANSFER_SIZE)
    }
}

impl PayloadGenerator {
    /// Create a generator producing transfers of at most `transfer_size` bytes
    pub fn new(transfer_size: usize) -> Self {
        Self {
            transfer_size,
            fid: false,
            pts: 0,
        }
    }

    /// Build one payload unit
    ///
    /// `bits` is OR'd with EOH and PTS-present.
    pub fn unit(bits: u8, pts: u32, payload: &[u8]) -> Vec<u8> {
        let mut unit = Vec::with_capacity(HEADER_LEN + payload.len());
        unit.push(HEADER_LEN as u8);
        unit.push(bits | flags::EOH | flags::PTS);
        unit.extend_from_slice(&pts.to_le_bytes());
        unit.extend_from_slice(&[0; HEADER_LEN - 6]);
        unit.extend_from_slice(payload);
        unit
    }

    /// Split a frame into units with a fresh FID and PTS, EOF on the last
    pub fn frame_units(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        self.fid = !self.fid;
        self.pts = self.pts.wrapping_add(1).max(1);
        let fid = if self.fid { flags::FID } else { 0 };

        let chunks: Vec<&[u8]> = frame.chunks(UNIT_PAYLOAD).collect();
        let last = chunks.len().saturating_sub(1);
        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let eof = if i == last { flags::EOF } else { 0 };
                Self::unit(fid | eof, self.pts, chunk)
            })
            .collect()
    }

    /// Split a frame into bulk transfers of whole units
    pub fn frame_transfers(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        let per_transfer = (self.transfer_size / PAYLOAD_UNIT_SIZE).max(1);
        self.frame_units(frame)
            .chunks(per_transfer)
            .map(|units| units.concat())
            .collect()
    }

    /// Frame of `size` bytes with a position-dependent pattern seeded by `seed`
    pub fn pattern_frame(size: usize, seed: u8) -> Vec<u8> {
        (0..size)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    /// Solid-color YUYV frame
    pub fn yuyv_solid(width: u32, height: u32, color: Rgb) -> Vec<u8> {
        let (y, u, v) = color.to_yuv();
        [y, u, y, v].repeat((width / 2 * height) as usize)
    }

    /// YUYV frame with luma ramping from black on the left to white on the right
    pub fn yuyv_gradient(width: u32, height: u32) -> Vec<u8> {
        let row: Vec<u8> = (0..width / 2)
            .flat_map(|x| {
                let luma = ((x as f32 / (width / 2) as f32) * 219.0 + 16.0) as u8;
                [luma, 128, luma, 128]
            })
            .collect();
        row.repeat(height as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_to_yuv_limits() {
        assert_eq!(Rgb::BLACK.to_yuv().0, 16);
        assert_eq!(Rgb::WHITE.to_yuv().0, 235);
        let (_, _, v) = Rgb::RED.to_yuv();
        assert!(v > 200);
    }

    #[test]
    fn test_unit_header_layout() {
        let unit = PayloadGenerator::unit(flags::FID, 0x0102_0304, &[9, 9]);
        assert_eq!(unit.len(), HEADER_LEN + 2);
        assert_eq!(unit[0], 12);
        assert_eq!(unit[1], 0x85);
        assert_eq!(&unit[2..6], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_frame_units_mark_eof_once() {
        let mut gen = PayloadGenerator::default();
        let units = gen.frame_units(&vec![0u8; UNIT_PAYLOAD * 3 + 10]);
        assert_eq!(units.len(), 4);
        assert_eq!(units[3].len(), HEADER_LEN + 10);
        let eofs = units.iter().filter(|u| u[1] & flags::EOF != 0).count();
        assert_eq!(eofs, 1);
        assert!(units[3][1] & flags::EOF != 0);
    }

    #[test]
    fn test_fid_and_pts_change_per_frame() {
        let mut gen = PayloadGenerator::default();
        let a = gen.frame_units(&[1; 4]);
        let b = gen.frame_units(&[1; 4]);
        assert_ne!(a[0][1] & flags::FID, b[0][1] & flags::FID);
        assert_ne!(a[0][2..6], b[0][2..6]);
    }

    #[test]
    fn test_transfers_hold_whole_units() {
        let mut gen = PayloadGenerator::default();
        let transfers = gen.frame_transfers(&vec![0u8; 640 * 480 * 2]);
        // 302 units, 8 per transfer
        assert_eq!(transfers.len(), 38);
        assert!(transfers[..37].iter().all(|t| t.len() == VIDEO_TRANSFER_SIZE));
        assert!(transfers[37].len() < VIDEO_TRANSFER_SIZE);
    }

    #[test]
    fn test_yuyv_sizes() {
        assert_eq!(PayloadGenerator::yuyv_solid(320, 240, Rgb::RED).len(), 320 * 240 * 2);
        let gradient = PayloadGenerator::yuyv_gradient(320, 240);
        assert_eq!(gradient.len(), 320 * 240 * 2);
        assert!(gradient[0] < gradient[636]);
    }
}
