//! Replay of recorded video payloads without hardware
//!
//! Loads a recording written by [`crate::capture::PacketRecorder`] and feeds
//! it back through a [`FrameAssembler`], either as fast as possible or at
//! the recorded pace, on a background thread.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::path::Path;
//! use ps3eye::replay::PacketReplay;
//!
//! let mut replay = PacketReplay::load(Path::new("capture_12345.bin"))?;
//! let receiver = replay.start()?;
//!
//! while let Ok(frame) = receiver.recv() {
//!     process_frame(&frame);
//! }
//! ```

use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::capture::{self, read_metadata, CaptureError, CaptureMetadata, CapturedPacket};
use crate::frame_assembler::{FrameAssembler, FrameReader};

/// Errors that can occur during replay
#[derive(Error, Debug)]
pub enum ReplayError {
    /// The recording could not be read
    #[error("failed to load recording: {0}")]
    Load(#[from] CaptureError),

    /// The frame size is unknown
    #[error("frame size unknown: no metadata and none configured")]
    UnknownFrameSize,

    /// Replay is already running
    #[error("replay is already running")]
    AlreadyRunning,

    /// Replay is not running
    #[error("replay is not running")]
    NotRunning,

    /// The replay thread could not be started
    #[error("failed to spawn replay thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result type alias for replay operations
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Replay options
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Playback speed multiplier (1.0 = recorded pace, 0.0 = as fast as possible)
    pub speed: f64,
    /// Start over when the recording ends
    pub loop_playback: bool,
    /// Frame size override; 0 takes it from the metadata
    pub frame_size: usize,
    /// Only replay payloads from this endpoint
    pub endpoint: Option<u8>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            loop_playback: false,
            frame_size: 0,
            endpoint: None,
        }
    }
}

impl ReplayConfig {
    fn resolve_frame_size(&self, metadata: Option<&CaptureMetadata>) -> Result<usize> {
        if self.frame_size > 0 {
            return Ok(self.frame_size);
        }
        metadata
            .map(CaptureMetadata::frame_size)
            .filter(|&size| size > 0)
            .ok_or(ReplayError::UnknownFrameSize)
    }

    fn accepts(&self, packet: &CapturedPacket) -> bool {
        self.endpoint.map_or(true, |ep| ep == packet.endpoint)
    }
}

/// Replays a recording through a frame assembler
pub struct PacketReplay {
    packets: Vec<CapturedPacket>,
    metadata: Option<CaptureMetadata>,
    config: ReplayConfig,
    thread_handle: Option<JoinHandle<()>>,
    stop_sender: Option<Sender<()>>,
}

impl PacketReplay {
    /// Load a recording and its companion `.json` metadata, if present
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Load`] if the payload file cannot be read.
    pub fn load(path: &Path) -> Result<Self> {
        let packets = capture::read_packets(path)?;
        let metadata = try_load_metadata(path);

        log::info!("Loaded {} payloads from {}", packets.len(), path.display());
        if let Some(meta) = &metadata {
            log::info!(
                "Metadata: {}x{} @ {} fps, {} frames, {} ms",
                meta.width,
                meta.height,
                meta.fps,
                meta.total_frames,
                meta.duration_ms
            );
        }

        Ok(Self {
            packets,
            metadata,
            config: ReplayConfig::default(),
            thread_handle: None,
            stop_sender: None,
        })
    }

    /// Load with custom options
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Load`] if the payload file cannot be read.
    pub fn load_with_config(path: &Path, config: ReplayConfig) -> Result<Self> {
        let mut replay = Self::load(path)?;
        replay.config = config;
        Ok(replay)
    }

    /// Metadata loaded alongside the recording
    #[must_use]
    pub fn metadata(&self) -> Option<&CaptureMetadata> {
        self.metadata.as_ref()
    }

    /// Loaded payloads
    #[must_use]
    pub fn packets(&self) -> &[CapturedPacket] {
        &self.packets
    }

    /// Number of loaded payloads
    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    /// Timestamp of the last payload, in milliseconds
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.packets
            .last()
            .map(|p| p.timestamp_us / 1000)
            .unwrap_or(0)
    }

    /// Replace the replay options
    pub fn set_config(&mut self, config: ReplayConfig) {
        self.config = config;
    }

    /// Whether the replay thread is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    /// Assemble every frame synchronously, ignoring timing
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::UnknownFrameSize`] if no frame size is available.
    pub fn frames(&self) -> Result<Vec<Vec<u8>>> {
        let mut assembler = FrameAssembler::new(self.config.resolve_frame_size(self.metadata())?);
        let mut reader = FrameReader::new();
        let mut frames = Vec::new();
        for packet in self.packets.iter().filter(|p| self.config.accepts(p)) {
            if assembler.process_transfer(&packet.data) > 0 {
                if let Some(frame) = reader.get_frame(&assembler) {
                    frames.push(frame.to_vec());
                }
            }
        }
        Ok(frames)
    }

    /// Start replaying on a background thread
    ///
    /// Returns a receiver yielding each assembled frame.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::AlreadyRunning`], [`ReplayError::UnknownFrameSize`]
    /// or the spawn error.
    pub fn start(&mut self) -> Result<Receiver<Vec<u8>>> {
        if self.is_running() {
            return Err(ReplayError::AlreadyRunning);
        }
        let frame_size = self.config.resolve_frame_size(self.metadata())?;

        let (frame_tx, frame_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel();
        let packets = self.packets.clone();
        let config = self.config.clone();

        let handle = thread::Builder::new()
            .name("ps3eye-replay".into())
            .spawn(move || replay_thread(packets, config, frame_size, frame_tx, stop_rx))?;

        self.thread_handle = Some(handle);
        self.stop_sender = Some(stop_tx);
        log::info!("Replay started");
        Ok(frame_rx)
    }

    /// Stop the replay thread and wait for it
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::NotRunning`] if no replay is in progress.
    pub fn stop(&mut self) -> Result<()> {
        let stop_tx = self.stop_sender.take().ok_or(ReplayError::NotRunning)?;
        let handle = self.thread_handle.take().ok_or(ReplayError::NotRunning)?;

        let _ = stop_tx.send(());
        if handle.join().is_err() {
            log::error!("Replay thread panicked");
        }
        log::info!("Replay stopped");
        Ok(())
    }
}

impl Drop for PacketReplay {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

/// Look for `<name>.json` next to the payload file
fn try_load_metadata(path: &Path) -> Option<CaptureMetadata> {
    let json_path = path.with_extension("json");
    if !json_path.exists() {
        return None;
    }
    match read_metadata(&json_path) {
        Ok(meta) => Some(meta),
        Err(e) => {
            log::warn!("Ignoring metadata {}: {}", json_path.display(), e);
            None
        }
    }
}

/// Sleep until `deadline`, waking every 10 ms to check for a stop
///
/// Returns `false` if a stop was requested.
fn sleep_until(deadline: Instant, stop_rx: &Receiver<()>) -> bool {
    let chunk = Duration::from_millis(10);
    loop {
        if stop_rx.try_recv().is_ok() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(chunk));
    }
}

fn replay_thread(
    packets: Vec<CapturedPacket>,
    config: ReplayConfig,
    frame_size: usize,
    frame_tx: Sender<Vec<u8>>,
    stop_rx: Receiver<()>,
) {
    let mut assembler = FrameAssembler::new(frame_size);
    let mut reader = FrameReader::new();

    loop {
        let replay_start = Instant::now();

        for packet in packets.iter().filter(|p| config.accepts(p)) {
            if config.speed > 0.0 {
                let offset = Duration::from_micros((packet.timestamp_us as f64 / config.speed) as u64);
                if !sleep_until(replay_start + offset, &stop_rx) {
                    log::debug!("Replay thread received stop signal");
                    return;
                }
            } else if stop_rx.try_recv().is_ok() {
                log::debug!("Replay thread received stop signal");
                return;
            }

            if assembler.process_transfer(&packet.data) == 0 {
                continue;
            }
            if let Some(frame) = reader.get_frame(&assembler) {
                if frame_tx.send(frame.to_vec()).is_err() {
                    log::debug!("Frame receiver dropped, stopping replay");
                    return;
                }
            }
        }

        if !config.loop_playback {
            log::debug!("Replay completed: {:?}", assembler.stats());
            break;
        }
        log::debug!("Replay loop completed, restarting");
        assembler.reset();
    }
}
