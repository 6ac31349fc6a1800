//! Frame assembly from bulk video payloads
//!
//! The bridge splits every bulk transfer into 2048-byte payload units, each
//! starting with a 12-byte UVC-style header. A new frame begins whenever the
//! header's PTS or FID changes, and ends at a unit with EOF set once exactly
//! one frame's worth of bytes has been collected.
//!
//! Completed frames are kept in a ring of [`RING_SLOTS`] buffers. Only the
//! most recently completed slot is published; the slot being filled is never
//! exposed. A consumer tracks what it has already seen with a [`FrameReader`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use ps3eye::frame_assembler::{FrameAssembler, FrameReader};
//!
//! let mut assembler = FrameAssembler::new(640 * 480 * 2);
//! let mut reader = FrameReader::new();
//!
//! for transfer in bulk_transfers {
//!     assembler.process_transfer(&transfer);
//!     if let Some(frame) = reader.request_frame(&assembler) {
//!         process_frame(frame);
//!     }
//! }
//! ```

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Size of one payload unit within a bulk transfer
pub const PAYLOAD_UNIT_SIZE: usize = 2048;

/// Length of the header at the start of every payload unit
pub const HEADER_LEN: usize = 12;

/// Number of frame buffers in the ring
pub const RING_SLOTS: usize = 16;

/// Header flag bits (byte 1)
pub mod flags {
    /// End of header
    pub const EOH: u8 = 0x80;
    /// Payload error
    pub const ERR: u8 = 0x40;
    /// Still image
    pub const STI: u8 = 0x20;
    /// Reserved
    pub const RES: u8 = 0x10;
    /// Source clock reference present
    pub const SCR: u8 = 0x08;
    /// Presentation timestamp present
    pub const PTS: u8 = 0x04;
    /// End of frame
    pub const EOF: u8 = 0x02;
    /// Frame ID toggle
    pub const FID: u8 = 0x01;
}

/// Classification of a payload unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketType {
    /// Drop data until the next frame starts
    Discard,
    /// First unit of a frame
    First,
    /// Unit in the middle of a frame
    Inter,
    /// Final unit of a frame
    Last,
}

/// Why a payload unit header was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// Unit shorter than the header
    TooShort,
    /// Header length byte is not 12
    BadLength(u8),
    /// Error flag set
    PayloadError,
    /// No presentation timestamp
    NoTimestamp,
}

/// Parsed payload unit header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Flag byte
    pub flags: u8,
    /// Presentation timestamp
    pub pts: u32,
}

impl PayloadHeader {
    /// Validate and parse the header of one payload unit
    ///
    /// # Errors
    ///
    /// Returns the reason the unit cannot start, continue, or end a frame.
    pub fn parse(unit: &[u8]) -> Result<Self, HeaderError> {
        if unit.len() < HEADER_LEN {
            return Err(HeaderError::TooShort);
        }
        if unit[0] as usize != HEADER_LEN {
            return Err(HeaderError::BadLength(unit[0]));
        }
        let flag_byte = unit[1];
        if flag_byte & flags::ERR != 0 {
            return Err(HeaderError::PayloadError);
        }
        if flag_byte & flags::PTS == 0 {
            return Err(HeaderError::NoTimestamp);
        }
        Ok(Self {
            flags: flag_byte,
            pts: u32::from_le_bytes([unit[2], unit[3], unit[4], unit[5]]),
        })
    }

    /// Frame ID bit
    pub fn fid(&self) -> u8 {
        self.flags & flags::FID
    }

    /// Whether EOF is set
    pub fn is_eof(&self) -> bool {
        self.flags & flags::EOF != 0
    }
}

/// Running counters for an assembler
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblerStats {
    /// Payload units scanned
    pub units: u64,
    /// Frames published
    pub frames_completed: u64,
    /// Frames abandoned before completion
    pub frames_discarded: u64,
    /// Units whose header was rejected
    pub headers_rejected: u64,
}

/// Reassembles payload units into complete frames
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    ring: Vec<u8>,
    work_index: usize,
    write_len: usize,
    last_type: PacketType,
    last_pts: u32,
    last_fid: u8,
    completed_index: Option<usize>,
    sequence: u64,
    completed_at: Option<Instant>,
    stats: AssemblerStats,
}

impl FrameAssembler {
    /// Create an assembler for frames of `frame_size` bytes
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            ring: vec![0; frame_size * RING_SLOTS],
            work_index: 0,
            write_len: 0,
            last_type: PacketType::Discard,
            last_pts: 0,
            last_fid: 0,
            completed_index: None,
            sequence: 0,
            completed_at: None,
            stats: AssemblerStats::default(),
        }
    }

    /// Expected size of one frame in bytes
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Reset to the start-of-stream state
    ///
    /// Published frames are forgotten; the publish sequence keeps counting
    /// so readers never mistake an old frame for a new one.
    pub fn reset(&mut self) {
        self.work_index = 0;
        self.write_len = 0;
        self.last_type = PacketType::Discard;
        self.last_pts = 0;
        self.last_fid = 0;
        self.completed_index = None;
        self.completed_at = None;
    }

    /// Scan one bulk transfer, returning how many frames it completed
    pub fn process_transfer(&mut self, data: &[u8]) -> usize {
        let before = self.sequence;
        for unit in data.chunks(PAYLOAD_UNIT_SIZE) {
            self.scan_unit(unit);
        }
        (self.sequence - before) as usize
    }

    fn scan_unit(&mut self, unit: &[u8]) {
        self.stats.units += 1;

        let header = match PayloadHeader::parse(unit) {
            Ok(header) => header,
            Err(reason) => {
                log::trace!("Rejected payload unit ({} bytes): {:?}", unit.len(), reason);
                self.stats.headers_rejected += 1;
                self.frame_add(PacketType::Discard, &[]);
                return;
            }
        };
        let payload = &unit[HEADER_LEN..];

        if header.pts != self.last_pts || header.fid() != self.last_fid {
            if self.last_type == PacketType::Inter {
                // Previous frame never saw EOF
                if self.write_len == self.frame_size {
                    self.frame_add(PacketType::Last, &[]);
                } else {
                    log::debug!(
                        "Frame without EOF: {} of {} bytes",
                        self.write_len,
                        self.frame_size
                    );
                    self.frame_add(PacketType::Discard, &[]);
                }
            }
            self.last_pts = header.pts;
            self.last_fid = header.fid();
            self.frame_add(PacketType::First, payload);
        } else if header.is_eof() {
            self.last_pts = 0;
            if self.write_len + payload.len() != self.frame_size {
                if matches!(self.last_type, PacketType::First | PacketType::Inter) {
                    log::debug!(
                        "Short frame at EOF: {} of {} bytes",
                        self.write_len + payload.len(),
                        self.frame_size
                    );
                }
                self.frame_add(PacketType::Discard, &[]);
            } else {
                self.frame_add(PacketType::Last, payload);
            }
        } else {
            self.frame_add(PacketType::Inter, payload);
        }
    }

    fn frame_add(&mut self, mut packet_type: PacketType, data: &[u8]) {
        if packet_type == PacketType::First {
            self.write_len = 0;
        } else {
            match self.last_type {
                PacketType::Discard => {
                    if packet_type == PacketType::Last {
                        self.last_type = PacketType::Last;
                        self.write_len = 0;
                    }
                    return;
                }
                PacketType::Last => return,
                PacketType::First | PacketType::Inter => {}
            }
        }

        if !data.is_empty() {
            if self.write_len + data.len() > self.frame_size {
                log::debug!(
                    "Frame overflow: {} + {} > {} bytes",
                    self.write_len,
                    data.len(),
                    self.frame_size
                );
                packet_type = PacketType::Discard;
                self.write_len = 0;
            } else {
                let start = self.work_index * self.frame_size + self.write_len;
                self.ring[start..start + data.len()].copy_from_slice(data);
                self.write_len += data.len();
            }
        }

        if packet_type == PacketType::Discard && self.last_type != PacketType::Discard {
            self.stats.frames_discarded += 1;
        }
        self.last_type = packet_type;

        if packet_type == PacketType::Last {
            self.completed_index = Some(self.work_index);
            self.completed_at = Some(Instant::now());
            self.sequence += 1;
            self.stats.frames_completed += 1;
            self.work_index = (self.work_index + 1) % RING_SLOTS;
            self.write_len = 0;
        }
    }

    /// Number of frames published so far
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Ring slot of the most recently completed frame
    pub fn completed_slot(&self) -> Option<usize> {
        self.completed_index
    }

    /// When the most recent frame was completed
    pub fn completed_at(&self) -> Option<Instant> {
        self.completed_at
    }

    /// The most recently completed frame
    pub fn latest_frame(&self) -> Option<&[u8]> {
        self.completed_index.map(|slot| self.slot(slot))
    }

    /// Contents of one ring slot
    ///
    /// # Panics
    ///
    /// Panics if `slot >= RING_SLOTS`.
    pub fn slot(&self, slot: usize) -> &[u8] {
        let start = slot * self.frame_size;
        &self.ring[start..start + self.frame_size]
    }

    /// Classification of the last unit scanned
    pub fn last_packet_type(&self) -> PacketType {
        self.last_type
    }

    /// Bytes collected for the frame in progress
    pub fn buffer_len(&self) -> usize {
        self.write_len
    }

    /// Counters since creation
    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }
}

/// Consumer-side cursor over an assembler's published frames
///
/// Remembers the last publish sequence it handed out. One reader per
/// consumer; the returned slice must be copied out before [`RING_SLOTS`]
/// further frames complete.
#[derive(Debug, Default, Clone)]
pub struct FrameReader {
    last_seen: u64,
}

impl FrameReader {
    /// Create a reader that has seen nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a frame newer than the last one taken is available
    pub fn is_new_frame(&self, assembler: &FrameAssembler) -> bool {
        assembler.completed_index.is_some() && assembler.sequence > self.last_seen
    }

    /// Take the latest frame, marking it as seen
    pub fn get_frame<'a>(&mut self, assembler: &'a FrameAssembler) -> Option<&'a [u8]> {
        self.last_seen = assembler.sequence;
        assembler.latest_frame()
    }

    /// Take the latest frame only if it has not been seen yet
    pub fn request_frame<'a>(&mut self, assembler: &'a FrameAssembler) -> Option<&'a [u8]> {
        if self.is_new_frame(assembler) {
            self.get_frame(assembler)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(bits: u8, pts: u32, payload: &[u8]) -> Vec<u8> {
        let mut unit = vec![HEADER_LEN as u8, bits | flags::EOH | flags::PTS];
        unit.extend_from_slice(&pts.to_le_bytes());
        unit.extend_from_slice(&[0; 6]);
        unit.extend_from_slice(payload);
        unit
    }

    // =========================================================================
    // Header Validation Tests
    // =========================================================================

    #[test]
    fn test_parse_valid_header() {
        let data = unit(flags::FID | flags::EOF, 0x0403_0201, &[0xaa]);
        let header = PayloadHeader::parse(&data).unwrap();
        assert_eq!(header.pts, 0x0403_0201);
        assert_eq!(header.fid(), 1);
        assert!(header.is_eof());
    }

    #[test]
    fn test_reject_short_unit() {
        assert_eq!(
            PayloadHeader::parse(&[12, 0x84, 0, 0]),
            Err(HeaderError::TooShort)
        );
        assert_eq!(PayloadHeader::parse(&[]), Err(HeaderError::TooShort));
    }

    #[test]
    fn test_reject_wrong_header_length() {
        let mut data = unit(0, 1, &[]);
        data[0] = 2;
        assert_eq!(PayloadHeader::parse(&data), Err(HeaderError::BadLength(2)));
    }

    #[test]
    fn test_reject_error_flag() {
        let data = unit(flags::ERR, 1, &[]);
        assert_eq!(PayloadHeader::parse(&data), Err(HeaderError::PayloadError));
    }

    #[test]
    fn test_reject_missing_pts() {
        let mut data = unit(0, 1, &[]);
        data[1] &= !flags::PTS;
        assert_eq!(PayloadHeader::parse(&data), Err(HeaderError::NoTimestamp));
    }

    // =========================================================================
    // State Machine Tests
    // =========================================================================

    #[test]
    fn test_single_frame_three_units() {
        let mut assembler = FrameAssembler::new(12);
        assembler.process_transfer(&unit(0, 7, &[1, 2, 3, 4]));
        assert_eq!(assembler.last_packet_type(), PacketType::First);
        assembler.process_transfer(&unit(0, 7, &[5, 6, 7, 8]));
        assert_eq!(assembler.last_packet_type(), PacketType::Inter);
        let completed = assembler.process_transfer(&unit(flags::EOF, 7, &[9, 10, 11, 12]));

        assert_eq!(completed, 1);
        assert_eq!(assembler.completed_slot(), Some(0));
        assert_eq!(
            assembler.latest_frame().unwrap(),
            &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]
        );
        assert_eq!(assembler.stats().frames_completed, 1);
    }

    #[test]
    fn test_eof_with_wrong_size_discards() {
        let mut assembler = FrameAssembler::new(12);
        assembler.process_transfer(&unit(0, 7, &[1, 2, 3, 4]));
        assembler.process_transfer(&unit(flags::EOF, 7, &[5, 6]));

        assert_eq!(assembler.sequence(), 0);
        assert_eq!(assembler.last_packet_type(), PacketType::Discard);
        assert_eq!(assembler.stats().frames_discarded, 1);
    }

    #[test]
    fn test_discard_is_sticky_until_next_first() {
        let mut assembler = FrameAssembler::new(8);
        assembler.process_transfer(&unit(0, 1, &[1, 2]));
        assembler.process_transfer(&unit(flags::ERR, 1, &[3, 4]));
        assert_eq!(assembler.last_packet_type(), PacketType::Discard);

        // Same PTS: intermediate data is ignored while discarding
        assembler.process_transfer(&unit(0, 1, &[5, 6]));
        assert_eq!(assembler.last_packet_type(), PacketType::Discard);

        assembler.process_transfer(&unit(flags::FID, 2, &[1, 1, 1, 1]));
        assembler.process_transfer(&unit(flags::FID | flags::EOF, 2, &[2, 2, 2, 2]));
        assert_eq!(assembler.latest_frame().unwrap(), &[1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn test_overflow_discards_and_resets_cursor() {
        let mut assembler = FrameAssembler::new(6);
        assembler.process_transfer(&unit(0, 1, &[1, 2, 3, 4]));
        assembler.process_transfer(&unit(0, 1, &[5, 6, 7, 8]));

        assert_eq!(assembler.last_packet_type(), PacketType::Discard);
        assert_eq!(assembler.buffer_len(), 0);
        assert_eq!(assembler.sequence(), 0);
    }

    #[test]
    fn test_missing_eof_complete_frame_is_published() {
        let mut assembler = FrameAssembler::new(8);
        assembler.process_transfer(&unit(0, 1, &[1, 2, 3, 4]));
        assembler.process_transfer(&unit(0, 1, &[5, 6, 7, 8]));
        // New PTS without EOF closes the full previous frame
        assembler.process_transfer(&unit(flags::FID, 2, &[9, 9, 9, 9]));

        assert_eq!(assembler.sequence(), 1);
        assert_eq!(assembler.slot(0), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(assembler.last_packet_type(), PacketType::First);
        assert_eq!(assembler.buffer_len(), 4);
    }

    #[test]
    fn test_missing_eof_partial_frame_is_dropped() {
        let mut assembler = FrameAssembler::new(8);
        assembler.process_transfer(&unit(0, 1, &[1, 2]));
        assembler.process_transfer(&unit(0, 1, &[3, 4]));
        assembler.process_transfer(&unit(flags::FID, 2, &[5, 6, 7, 8]));

        assert_eq!(assembler.sequence(), 0);
        assert_eq!(assembler.buffer_len(), 4);
        assert_eq!(assembler.stats().frames_discarded, 1);
    }

    #[test]
    fn test_transfer_split_into_units() {
        let frame_size = 2 * (PAYLOAD_UNIT_SIZE - HEADER_LEN);
        let mut assembler = FrameAssembler::new(frame_size);
        let mut transfer = unit(0, 3, &[0x11; PAYLOAD_UNIT_SIZE - HEADER_LEN]);
        transfer.extend(unit(flags::EOF, 3, &[0x22; PAYLOAD_UNIT_SIZE - HEADER_LEN]));

        assert_eq!(assembler.process_transfer(&transfer), 1);
        let frame = assembler.latest_frame().unwrap();
        assert!(frame[..frame_size / 2].iter().all(|&b| b == 0x11));
        assert!(frame[frame_size / 2..].iter().all(|&b| b == 0x22));
        assert_eq!(assembler.stats().units, 2);
    }

    // =========================================================================
    // Reader Tests
    // =========================================================================

    #[test]
    fn test_reader_sees_each_frame_once() {
        let mut assembler = FrameAssembler::new(4);
        let mut reader = FrameReader::new();
        assert!(!reader.is_new_frame(&assembler));
        assert!(reader.request_frame(&assembler).is_none());

        assembler.process_transfer(&unit(0, 1, &[1, 2]));
        assembler.process_transfer(&unit(flags::EOF, 1, &[3, 4]));
        assert!(reader.is_new_frame(&assembler));
        assert_eq!(reader.request_frame(&assembler).unwrap(), &[1, 2, 3, 4]);
        assert!(!reader.is_new_frame(&assembler));

        // get_frame still returns the last frame without a new one
        assert_eq!(reader.get_frame(&assembler).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_reset_hides_old_frames() {
        let mut assembler = FrameAssembler::new(4);
        let mut reader = FrameReader::new();
        assembler.process_transfer(&unit(0, 1, &[1, 2]));
        assembler.process_transfer(&unit(flags::EOF, 1, &[3, 4]));
        assembler.reset();

        assert!(assembler.latest_frame().is_none());
        assert!(!reader.is_new_frame(&assembler));
        assert!(reader.get_frame(&assembler).is_none());
    }
}
