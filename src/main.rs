//! `ps3eye` command-line tool
//!
//! Lists cameras, streams video with optional payload recording, prints
//! microphone levels and replays recordings.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use ps3eye::audio::CHANNELS;
use ps3eye::capture::CaptureMetadata;
use ps3eye::replay::{PacketReplay, ReplayConfig};
use ps3eye::{
    CameraConfig, CaptureSession, DeviceEnumerator, EyeDevice, Microphone, PacketRecorder,
    StreamState,
};

#[derive(Parser, Debug)]
#[command(name = "ps3eye")]
#[command(author, version, about = "PS3 Eye camera and microphone tool")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List connected cameras
    List,

    /// Stream video and report the frame rate
    Stream {
        /// Index of the camera in `list` order
        #[arg(short, long, default_value_t = 0)]
        device: usize,

        /// JSON configuration file
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Requested width (overrides the configuration)
        #[arg(long)]
        width: Option<u32>,

        /// Requested height (overrides the configuration)
        #[arg(long)]
        height: Option<u32>,

        /// Requested frame rate (overrides the configuration)
        #[arg(long)]
        fps: Option<u8>,

        /// Stop after this many frames
        #[arg(short = 'n', long, default_value_t = 300)]
        frames: u64,

        /// Record raw payloads into this directory
        #[arg(long, value_name = "DIR")]
        record: Option<PathBuf>,

        /// Write the last frame as raw YUYV to this file
        #[arg(long, value_name = "PATH")]
        dump: Option<PathBuf>,
    },

    /// Print per-channel microphone peaks
    Mic {
        /// Index of the camera in `list` order
        #[arg(short, long, default_value_t = 0)]
        device: usize,

        /// How long to listen
        #[arg(short, long, default_value_t = 5)]
        seconds: u64,
    },

    /// Assemble frames from a recording
    Replay {
        /// Recording written by `stream --record`
        file: PathBuf,

        /// Playback speed (0 = as fast as possible)
        #[arg(long, default_value_t = 0.0)]
        speed: f64,

        /// Frame size in bytes if the recording has no metadata
        #[arg(long, default_value_t = 0)]
        frame_size: usize,
    },
}

fn main() -> Result<()> {
    ps3eye::init_logging();
    let args = Args::parse();

    match args.command {
        Command::List => list(),
        Command::Stream {
            device,
            config,
            width,
            height,
            fps,
            frames,
            record,
            dump,
        } => {
            let mut camera_config = match config {
                Some(path) => CameraConfig::load(&path)
                    .with_context(|| format!("Failed to load {}", path.display()))?,
                None => CameraConfig::default(),
            };
            camera_config.width = width.unwrap_or(camera_config.width);
            camera_config.height = height.unwrap_or(camera_config.height);
            camera_config.fps = fps.unwrap_or(camera_config.fps);
            stream(device, &camera_config, frames, record, dump)
        }
        Command::Mic { device, seconds } => mic(device, seconds),
        Command::Replay {
            file,
            speed,
            frame_size,
        } => replay(file, speed, frame_size),
    }
}

fn pick_device(enumerator: &mut DeviceEnumerator, index: usize) -> Result<Arc<EyeDevice>> {
    let devices = enumerator.list_devices(false);
    if devices.is_empty() {
        bail!("No camera found");
    }
    devices
        .get(index)
        .cloned()
        .with_context(|| format!("Camera {} not found ({} connected)", index, devices.len()))
}

fn list() -> Result<()> {
    let mut enumerator = DeviceEnumerator::new();
    let devices = enumerator.list_devices(true);
    if devices.is_empty() {
        println!("No cameras found");
    }
    for (i, device) in devices.iter().enumerate() {
        println!(
            "{}: bus {:03} address {:03}",
            i,
            device.bus_number(),
            device.address()
        );
    }
    Ok(())
}

fn stream(
    index: usize,
    config: &CameraConfig,
    max_frames: u64,
    record: Option<PathBuf>,
    dump: Option<PathBuf>,
) -> Result<()> {
    let mut enumerator = DeviceEnumerator::new();
    let device = pick_device(&mut enumerator, index)?;
    let mut session = CaptureSession::with_config(device, config);

    session
        .init(config.width, config.height, config.fps)
        .context("Failed to initialize camera")?;
    if let Some(id) = session.sensor_id() {
        log::info!("Sensor ID {:04x}", id);
    }

    let recorder = match &record {
        Some(_) => {
            let recorder = Arc::new(PacketRecorder::new());
            let mode = config.video_mode();
            recorder.start_capture(CaptureMetadata::for_mode(&mode))?;
            session.set_recorder(Some(Arc::clone(&recorder)));
            Some(recorder)
        }
        None => None,
    };

    session.start().context("Failed to start streaming")?;

    let started = Instant::now();
    let mut report = Instant::now();
    let mut frames = 0u64;
    let mut last_frame = None;
    while frames < max_frames {
        if let StreamState::Failed(status) = session.stream_state() {
            bail!("Stream failed: {:?}", status);
        }
        match session.request_frame() {
            Some(frame) => {
                frames += 1;
                last_frame = Some(frame);
            }
            None => thread::sleep(Duration::from_millis(1)),
        }
        if report.elapsed() >= Duration::from_secs(1) {
            println!(
                "{} frames, {:.1} fps",
                frames,
                frames as f64 / started.elapsed().as_secs_f64()
            );
            report = Instant::now();
        }
    }
    session.stop();

    let stats = session.assembler_stats();
    println!(
        "Done: {} frames in {:.1}s ({} discarded, {} register soft failures)",
        frames,
        started.elapsed().as_secs_f64(),
        stats.frames_discarded,
        session.soft_failures()
    );

    if let (Some(recorder), Some(dir)) = (recorder, record) {
        let result = recorder.stop_capture(&dir)?;
        println!(
            "Recorded {} payloads to {}",
            result.metadata.total_packets,
            result.packets_path.display()
        );
    }
    if let (Some(path), Some(frame)) = (dump, last_frame) {
        std::fs::write(&path, frame).with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote last frame to {}", path.display());
    }
    Ok(())
}

fn mic(index: usize, seconds: u64) -> Result<()> {
    let mut enumerator = DeviceEnumerator::new();
    let device = pick_device(&mut enumerator, index)?;

    let peaks: Arc<[AtomicI16; CHANNELS]> = Arc::new(Default::default());
    let callback_peaks = Arc::clone(&peaks);
    let mut microphone = Microphone::open(&device, move |samples: &[i16], _frames| {
        for frame in samples.chunks_exact(CHANNELS) {
            for (peak, sample) in callback_peaks.iter().zip(frame) {
                peak.fetch_max(sample.saturating_abs(), Ordering::Relaxed);
            }
        }
    })
    .context("Failed to open microphone")?;

    for _ in 0..seconds {
        thread::sleep(Duration::from_secs(1));
        if let StreamState::Failed(status) = microphone.stream_state() {
            bail!("Microphone stream failed: {:?}", status);
        }
        let levels: Vec<String> = peaks
            .iter()
            .map(|peak| format!("{:6}", peak.swap(0, Ordering::Relaxed)))
            .collect();
        println!("peaks: {}", levels.join(" "));
    }
    microphone.shut();
    Ok(())
}

fn replay(file: PathBuf, speed: f64, frame_size: usize) -> Result<()> {
    let config = ReplayConfig {
        speed,
        frame_size,
        ..Default::default()
    };
    let mut replay = PacketReplay::load_with_config(&file, config)
        .with_context(|| format!("Failed to load {}", file.display()))?;

    let receiver = replay.start()?;
    let mut frames = 0usize;
    let mut bytes = 0usize;
    for frame in receiver {
        frames += 1;
        bytes = frame.len();
    }
    replay.stop()?;
    println!(
        "{} payloads, {} frames of {} bytes",
        replay.packet_count(),
        frames,
        bytes
    );
    Ok(())
}
