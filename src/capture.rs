//! Raw payload recording for offline analysis and replay
//!
//! A [`PacketRecorder`] sits next to the frame assembler in the video sink
//! and keeps a copy of every bulk payload with its arrival time. Stopping a
//! recording writes two files that [`crate::replay`] can load again.
//!
//! # File Format
//!
//! - `capture_<ts>.bin`: sequence of
//!   `[u64 LE: timestamp_us][u32 LE: length][u8: endpoint][data bytes]`
//! - `capture_<ts>.json`: [`CaptureMetadata`]
//!
//! # Example
//!
//! ```ignore
//! let recorder = Arc::new(PacketRecorder::new());
//! recorder.start_capture(CaptureMetadata::for_mode(&mode))?;
//! session.set_recorder(Some(Arc::clone(&recorder)));
//!
//! // ... stream ...
//!
//! let result = recorder.stop_capture(Path::new("/tmp"))?;
//! ```

use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;

use crate::enumerate::{PRODUCT_ID, VENDOR_ID};
use crate::mode::VideoMode;

/// Upper bound on a single recorded payload
pub const MAX_RECORD_LEN: usize = 1024 * 1024;

/// Errors that can occur while recording
#[derive(Error, Debug)]
pub enum CaptureError {
    /// No recording is in progress
    #[error("capture is not active")]
    NotActive,

    /// A recording is already in progress
    #[error("capture is already active")]
    AlreadyActive,

    /// I/O error during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Output directory does not exist
    #[error("output directory does not exist: {0}")]
    DirectoryNotFound(String),

    /// A record in the capture file is malformed
    #[error("invalid record at offset {offset}: {message}")]
    InvalidRecord {
        /// Byte offset of the record
        offset: u64,
        /// What was wrong with it
        message: String,
    },
}

/// Result type alias for capture operations
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Description of a recording, stored next to the payload file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// USB vendor ID of the device
    pub vendor_id: u16,
    /// USB product ID of the device
    pub product_id: u16,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Requested frame rate
    #[serde(default)]
    pub fps: u8,
    /// Endpoint the payloads were read from
    #[serde(default)]
    pub endpoint: u8,
    /// Number of payloads recorded
    #[serde(default)]
    pub total_packets: u64,
    /// Number of frames completed while recording
    #[serde(default)]
    pub total_frames: u64,
    /// Recording duration in milliseconds
    #[serde(default)]
    pub duration_ms: u64,
    /// Total payload bytes recorded
    #[serde(default)]
    pub total_bytes: u64,
    /// Free-form notes
    #[serde(default)]
    pub description: String,
}

impl Default for CaptureMetadata {
    fn default() -> Self {
        Self {
            vendor_id: VENDOR_ID,
            product_id: PRODUCT_ID,
            width: 0,
            height: 0,
            fps: 0,
            endpoint: 0,
            total_packets: 0,
            total_frames: 0,
            duration_ms: 0,
            total_bytes: 0,
            description: String::new(),
        }
    }
}

impl CaptureMetadata {
    /// Metadata for a recording of `mode`
    pub fn for_mode(mode: &VideoMode) -> Self {
        Self {
            width: mode.width(),
            height: mode.height(),
            fps: mode.fps,
            ..Self::default()
        }
    }

    /// Raw frame size implied by the recorded dimensions
    pub fn frame_size(&self) -> usize {
        (self.width * crate::mode::BYTES_PER_PIXEL) as usize * self.height as usize
    }
}

/// One recorded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    /// Microseconds since the recording started
    pub timestamp_us: u64,
    /// Endpoint the payload arrived on
    pub endpoint: u8,
    /// Payload bytes
    pub data: Vec<u8>,
}

/// Paths and summary of a finished recording
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResult {
    /// Payload file
    pub packets_path: PathBuf,
    /// Metadata file
    pub metadata_path: PathBuf,
    /// Final metadata
    pub metadata: CaptureMetadata,
}

/// Thread-safe payload recorder
///
/// Recording calls come from the event thread; start and stop from the
/// application. When idle, [`record_packet`](Self::record_packet) costs a
/// single atomic load.
pub struct PacketRecorder {
    is_capturing: AtomicBool,
    endpoint: AtomicU8,
    packets: Mutex<Vec<CapturedPacket>>,
    start_time: Mutex<Option<Instant>>,
    metadata: Mutex<CaptureMetadata>,
    packet_count: AtomicU64,
    byte_count: AtomicU64,
    frame_count: AtomicU64,
}

impl PacketRecorder {
    /// Create an idle recorder
    #[must_use]
    pub fn new() -> Self {
        Self {
            is_capturing: AtomicBool::new(false),
            endpoint: AtomicU8::new(0),
            packets: Mutex::new(Vec::new()),
            start_time: Mutex::new(None),
            metadata: Mutex::new(CaptureMetadata::default()),
            packet_count: AtomicU64::new(0),
            byte_count: AtomicU64::new(0),
            frame_count: AtomicU64::new(0),
        }
    }

    /// Whether a recording is in progress
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.is_capturing.load(Ordering::Acquire)
    }

    /// Payloads recorded so far
    #[must_use]
    pub fn packet_count(&self) -> u64 {
        self.packet_count.load(Ordering::Acquire)
    }

    /// Payload bytes recorded so far
    #[must_use]
    pub fn byte_count(&self) -> u64 {
        self.byte_count.load(Ordering::Acquire)
    }

    /// Frames completed so far
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Acquire)
    }

    /// Set the endpoint tag written with each record
    pub fn set_endpoint(&self, endpoint: u8) {
        self.endpoint.store(endpoint, Ordering::Release);
    }

    /// Begin a new recording, discarding anything held from the last one
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::AlreadyActive`] if a recording is in progress.
    pub fn start_capture(&self, metadata: CaptureMetadata) -> Result<()> {
        if self
            .is_capturing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::AlreadyActive);
        }

        lock(&self.packets).clear();
        self.packet_count.store(0, Ordering::Release);
        self.byte_count.store(0, Ordering::Release);
        self.frame_count.store(0, Ordering::Release);
        if metadata.endpoint != 0 {
            self.set_endpoint(metadata.endpoint);
        }
        *lock(&self.start_time) = Some(Instant::now());
        *lock(&self.metadata) = metadata;

        log::info!("Payload recording started");
        Ok(())
    }

    /// Record one payload; ignored unless a recording is in progress
    pub fn record_packet(&self, data: &[u8]) {
        if !self.is_capturing.load(Ordering::Acquire) {
            return;
        }

        let started = *lock(&self.start_time);
        let timestamp_us = started
            .map(|t| t.elapsed().as_micros() as u64)
            .unwrap_or(0);
        self.packet_count.fetch_add(1, Ordering::Relaxed);
        self.byte_count.fetch_add(data.len() as u64, Ordering::Relaxed);

        lock(&self.packets).push(CapturedPacket {
            timestamp_us,
            endpoint: self.endpoint.load(Ordering::Relaxed),
            data: data.to_vec(),
        });
    }

    /// Count frames completed while recording
    pub fn record_frames(&self, frames: usize) {
        if frames > 0 && self.is_capturing.load(Ordering::Acquire) {
            self.frame_count.fetch_add(frames as u64, Ordering::Relaxed);
        }
    }

    /// Finish the recording and write it to `output_dir`
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::NotActive`] if nothing is being recorded,
    /// [`CaptureError::DirectoryNotFound`] if `output_dir` is missing, or
    /// the I/O or JSON error from writing the files.
    pub fn stop_capture(&self, output_dir: &Path) -> Result<CaptureResult> {
        if self
            .is_capturing
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::NotActive);
        }

        if !output_dir.is_dir() {
            return Err(CaptureError::DirectoryNotFound(
                output_dir.display().to_string(),
            ));
        }

        let started = *lock(&self.start_time);
        let duration_ms = started
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let metadata = {
            let mut meta = lock(&self.metadata);
            meta.duration_ms = duration_ms;
            meta.total_packets = self.packet_count();
            meta.total_bytes = self.byte_count();
            meta.total_frames = self.frame_count();
            meta.endpoint = self.endpoint.load(Ordering::Acquire);
            meta.clone()
        };

        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let packets_path = output_dir.join(format!("capture_{}.bin", timestamp));
        let metadata_path = packets_path.with_extension("json");

        {
            let packets = std::mem::take(&mut *lock(&self.packets));
            write_packets(&packets_path, &packets)?;
        }
        write_metadata(&metadata_path, &metadata)?;

        log::info!(
            "Recording stopped: {} payloads, {} bytes, {} frames, {} ms",
            metadata.total_packets,
            metadata.total_bytes,
            metadata.total_frames,
            duration_ms
        );

        Ok(CaptureResult {
            packets_path,
            metadata_path,
            metadata,
        })
    }

    /// Abandon the recording without writing anything
    pub fn cancel_capture(&self) {
        self.is_capturing.store(false, Ordering::Release);
        lock(&self.packets).clear();
        log::info!("Recording cancelled");
    }
}

impl Default for PacketRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Write payload records to `path`
///
/// # Errors
///
/// Returns the I/O error.
pub fn write_packets(path: &Path, packets: &[CapturedPacket]) -> Result<()> {
    let mut file = BufWriter::new(std::fs::File::create(path)?);
    for packet in packets {
        file.write_all(&packet.timestamp_us.to_le_bytes())?;
        file.write_all(&(packet.data.len() as u32).to_le_bytes())?;
        file.write_all(&[packet.endpoint])?;
        file.write_all(&packet.data)?;
    }
    file.flush()?;
    log::debug!("Saved {} payloads to {}", packets.len(), path.display());
    Ok(())
}

/// Read payload records from `path`
///
/// # Errors
///
/// Returns [`CaptureError::InvalidRecord`] for a truncated or oversized
/// record, or the I/O error.
pub fn read_packets(path: &Path) -> Result<Vec<CapturedPacket>> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    let mut packets = Vec::new();
    let mut offset = 0u64;

    loop {
        let mut timestamp = [0u8; 8];
        match file.read_exact(&mut timestamp) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let mut len = [0u8; 4];
        let mut endpoint = [0u8; 1];
        file.read_exact(&mut len)
            .and_then(|()| file.read_exact(&mut endpoint))
            .map_err(|_| CaptureError::InvalidRecord {
                offset,
                message: "truncated record header".to_string(),
            })?;
        let len = u32::from_le_bytes(len) as usize;
        if len > MAX_RECORD_LEN {
            return Err(CaptureError::InvalidRecord {
                offset,
                message: format!("length {} exceeds {} byte limit", len, MAX_RECORD_LEN),
            });
        }

        let mut data = vec![0u8; len];
        file.read_exact(&mut data)
            .map_err(|_| CaptureError::InvalidRecord {
                offset,
                message: format!("expected {} bytes of data", len),
            })?;

        packets.push(CapturedPacket {
            timestamp_us: u64::from_le_bytes(timestamp),
            endpoint: endpoint[0],
            data,
        });
        offset += 8 + 4 + 1 + len as u64;
    }

    Ok(packets)
}

/// Write recording metadata as JSON
///
/// # Errors
///
/// Returns the I/O or serialization error.
pub fn write_metadata(path: &Path, metadata: &CaptureMetadata) -> Result<()> {
    let json = serde_json::to_string_pretty(metadata)?;
    std::fs::write(path, json)?;
    log::debug!("Saved metadata to {}", path.display());
    Ok(())
}

/// Read recording metadata from JSON
///
/// # Errors
///
/// Returns the I/O or parse error.
pub fn read_metadata(path: &Path) -> Result<CaptureMetadata> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_recorder_new() {
        let recorder = PacketRecorder::new();
        assert!(!recorder.is_capturing());
        assert_eq!(recorder.packet_count(), 0);
        assert_eq!(recorder.byte_count(), 0);
    }

    #[test]
    fn test_start_twice_fails() {
        let recorder = PacketRecorder::new();
        recorder.start_capture(CaptureMetadata::default()).unwrap();
        assert!(matches!(
            recorder.start_capture(CaptureMetadata::default()),
            Err(CaptureError::AlreadyActive)
        ));
    }

    #[test]
    fn test_idle_recorder_ignores_packets() {
        let recorder = PacketRecorder::new();
        recorder.record_packet(&[1, 2, 3]);
        recorder.record_frames(1);
        assert_eq!(recorder.packet_count(), 0);
        assert_eq!(recorder.frame_count(), 0);
    }

    #[test]
    fn test_stop_without_start() {
        let dir = tempdir().unwrap();
        let recorder = PacketRecorder::new();
        assert!(matches!(
            recorder.stop_capture(dir.path()),
            Err(CaptureError::NotActive)
        ));
    }

    #[test]
    fn test_stop_into_missing_directory() {
        let dir = tempdir().unwrap();
        let recorder = PacketRecorder::new();
        recorder.start_capture(CaptureMetadata::default()).unwrap();
        assert!(matches!(
            recorder.stop_capture(&dir.path().join("missing")),
            Err(CaptureError::DirectoryNotFound(_))
        ));
    }

    #[test]
    fn test_cancel_discards() {
        let recorder = PacketRecorder::new();
        recorder.start_capture(CaptureMetadata::default()).unwrap();
        recorder.record_packet(&[0; 16]);
        recorder.cancel_capture();
        assert!(!recorder.is_capturing());
        recorder.start_capture(CaptureMetadata::default()).unwrap();
        assert_eq!(recorder.packet_count(), 0);
    }

    #[test]
    fn test_concurrent_recording() {
        let recorder = Arc::new(PacketRecorder::new());
        recorder.start_capture(CaptureMetadata::default()).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let recorder = Arc::clone(&recorder);
                thread::spawn(move || {
                    for _ in 0..100 {
                        recorder.record_packet(&[i as u8; 10]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(recorder.packet_count(), 400);
        assert_eq!(recorder.byte_count(), 4000);
    }

    #[test]
    fn test_full_recording_workflow() {
        let dir = tempdir().unwrap();
        let recorder = PacketRecorder::new();
        let mode = VideoMode::select(320, 240, 60);
        recorder.start_capture(CaptureMetadata::for_mode(&mode)).unwrap();
        recorder.set_endpoint(0x81);

        for i in 0..5u8 {
            recorder.record_packet(&vec![i; (i as usize + 1) * 100]);
        }
        recorder.record_frames(2);

        let result = recorder.stop_capture(dir.path()).unwrap();
        assert!(!recorder.is_capturing());
        assert_eq!(result.metadata.total_packets, 5);
        assert_eq!(result.metadata.total_bytes, 1500);
        assert_eq!(result.metadata.total_frames, 2);
        assert_eq!(result.metadata.endpoint, 0x81);
        assert_eq!(result.metadata.width, 320);
        assert_eq!(result.metadata_path, result.packets_path.with_extension("json"));

        let packets = read_packets(&result.packets_path).unwrap();
        assert_eq!(packets.len(), 5);
        assert_eq!(packets[2].data, vec![2u8; 300]);
        assert!(packets.iter().all(|p| p.endpoint == 0x81));
        assert!(packets.windows(2).all(|w| w[0].timestamp_us <= w[1].timestamp_us));

        let meta = read_metadata(&result.metadata_path).unwrap();
        assert_eq!(meta, result.metadata);
    }

    #[test]
    fn test_truncated_record_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&7u64.to_le_bytes());
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.push(0x81);
        bytes.extend_from_slice(&[0u8; 10]);
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            read_packets(&path),
            Err(CaptureError::InvalidRecord { offset: 0, .. })
        ));
    }

    #[test]
    fn test_metadata_defaults_fill_missing_fields() {
        let meta: CaptureMetadata =
            serde_json::from_str(r#"{"vendor_id":5141,"product_id":8192,"width":640,"height":480}"#)
                .unwrap();
        assert_eq!(meta.vendor_id, VENDOR_ID);
        assert_eq!(meta.total_packets, 0);
        assert_eq!(meta.frame_size(), 640 * 480 * 2);
    }
}
