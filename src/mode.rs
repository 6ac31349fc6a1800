//! Video mode and frame-rate selection
//!
//! The sensor supports exactly two resolutions. Each has its own start
//! tables and its own frame-rate divisor table.

use serde::{Deserialize, Serialize};

use crate::tables::{
    RateEntry, BRIDGE_START_QVGA, BRIDGE_START_VGA, RATES_QVGA, RATES_VGA, SENSOR_START_QVGA,
    SENSOR_START_VGA,
};

/// Bytes per pixel of the raw YUV422 sensor output
pub const BYTES_PER_PIXEL: u32 = 2;

/// Supported sensor resolutions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// 320x240
    Qvga,
    /// 640x480
    Vga,
}

impl Resolution {
    /// Frame width in pixels
    pub fn width(self) -> u32 {
        match self {
            Resolution::Qvga => 320,
            Resolution::Vga => 640,
        }
    }

    /// Frame height in pixels
    pub fn height(self) -> u32 {
        match self {
            Resolution::Qvga => 240,
            Resolution::Vga => 480,
        }
    }

    /// Lowest frame rate the mode runs at
    pub fn min_fps(self) -> u8 {
        match self {
            Resolution::Qvga => 30,
            Resolution::Vga => 15,
        }
    }

    /// Frame-rate divisor table, highest rate first
    pub fn rate_table(self) -> &'static [RateEntry] {
        match self {
            Resolution::Qvga => RATES_QVGA,
            Resolution::Vga => RATES_VGA,
        }
    }

    /// Bridge start table
    pub fn bridge_start(self) -> &'static [(u8, u8)] {
        match self {
            Resolution::Qvga => BRIDGE_START_QVGA,
            Resolution::Vga => BRIDGE_START_VGA,
        }
    }

    /// Sensor start table
    pub fn sensor_start(self) -> &'static [(u8, u8)] {
        match self {
            Resolution::Qvga => SENSOR_START_QVGA,
            Resolution::Vga => SENSOR_START_VGA,
        }
    }
}

/// A negotiated resolution plus requested frame rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMode {
    /// Sensor resolution
    pub resolution: Resolution,
    /// Requested frame rate, already clamped to the mode's minimum
    pub fps: u8,
}

impl VideoMode {
    /// Pick the mode for a requested size and rate
    ///
    /// Anything wider than 320 or taller than 240, and the all-zero
    /// request, selects 640x480; everything else selects 320x240.
    pub fn select(width: u32, height: u32, fps: u8) -> Self {
        let resolution = if (width == 0 && height == 0) || width > 320 || height > 240 {
            Resolution::Vga
        } else {
            Resolution::Qvga
        };
        Self {
            resolution,
            fps: fps.max(resolution.min_fps()),
        }
    }

    /// Frame width in pixels
    pub fn width(&self) -> u32 {
        self.resolution.width()
    }

    /// Frame height in pixels
    pub fn height(&self) -> u32 {
        self.resolution.height()
    }

    /// Row length in bytes
    pub fn stride(&self) -> usize {
        (self.width() * BYTES_PER_PIXEL) as usize
    }

    /// Size of one raw frame in bytes
    pub fn frame_size(&self) -> usize {
        self.stride() * self.height() as usize
    }

    /// Divisor entry for the requested rate
    pub fn rate_entry(&self) -> RateEntry {
        select_rate(self.resolution.rate_table(), self.fps)
    }

    /// Frame rates this mode can run at, highest first
    pub fn supported_rates(&self) -> Vec<u8> {
        self.resolution.rate_table().iter().map(|e| e.fps).collect()
    }
}

/// Highest table entry not above `fps`, or the lowest entry if none qualifies
pub fn select_rate(table: &[RateEntry], fps: u8) -> RateEntry {
    table
        .iter()
        .copied()
        .find(|entry| fps >= entry.fps)
        .or_else(|| table.last().copied())
        .unwrap_or(RATES_VGA[RATES_VGA.len() - 1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_defaults_to_vga() {
        let mode = VideoMode::select(0, 0, 0);
        assert_eq!(mode.resolution, Resolution::Vga);
        assert_eq!(mode.fps, 15);
    }

    #[test]
    fn test_select_small_sizes_pick_qvga() {
        for (w, h) in [(320, 240), (160, 120), (1, 1), (0, 240), (320, 0)] {
            let mode = VideoMode::select(w, h, 60);
            assert_eq!(mode.resolution, Resolution::Qvga, "{}x{}", w, h);
            assert_eq!(mode.stride(), 640);
        }
    }

    #[test]
    fn test_select_large_sizes_pick_vga() {
        for (w, h) in [(640, 480), (321, 240), (320, 241), (1920, 1080)] {
            let mode = VideoMode::select(w, h, 60);
            assert_eq!(mode.resolution, Resolution::Vga, "{}x{}", w, h);
            assert_eq!(mode.stride(), 1280);
            assert_eq!(mode.frame_size(), 640 * 480 * 2);
        }
    }

    #[test]
    fn test_fps_clamped_to_mode_minimum() {
        assert_eq!(VideoMode::select(320, 240, 10).fps, 30);
        assert_eq!(VideoMode::select(640, 480, 10).fps, 15);
        assert_eq!(VideoMode::select(640, 480, 200).fps, 200);
    }

    #[test]
    fn test_rate_lookup_is_monotonic() {
        assert_eq!(select_rate(RATES_VGA, 0).fps, 15);
        assert_eq!(select_rate(RATES_VGA, 255).fps, 60);
        assert_eq!(select_rate(RATES_VGA, 45).fps, 40);
        assert_eq!(select_rate(RATES_QVGA, 0).fps, 30);
        assert_eq!(select_rate(RATES_QVGA, 125).fps, 125);
        assert_eq!(select_rate(RATES_QVGA, 99).fps, 75);

        let mut previous = 0;
        for fps in 0..=255u8 {
            let chosen = select_rate(RATES_QVGA, fps).fps;
            assert!(chosen >= previous);
            previous = chosen;
        }
    }

    #[test]
    fn test_vga_60_uses_first_entry() {
        let entry = VideoMode::select(640, 480, 60).rate_entry();
        assert_eq!(entry, RATES_VGA[0]);
        assert_eq!((entry.r11, entry.r0d, entry.re5), (0x01, 0xc1, 0x04));
    }

    #[test]
    fn test_supported_rates() {
        assert_eq!(
            VideoMode::select(320, 240, 30).supported_rates(),
            vec![125, 100, 75, 60, 50, 40, 30]
        );
        assert_eq!(
            VideoMode::select(640, 480, 30).supported_rates(),
            vec![60, 50, 40, 30, 15]
        );
    }
}
