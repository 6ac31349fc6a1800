//! Session lifecycle tests against the in-memory camera
//!
//! Drives `init`, `start`, frame delivery, controls and `stop` end to end
//! through the register protocol, with [`MockDevice`] standing in for USB.

use ps3eye::capture::CaptureMetadata;
use ps3eye::controls::{encode_flip, encode_gain, REG_AUTO_EXT, REG_COM8, REG_FLIP, REG_GAIN};
use ps3eye::libusb::{LibusbError, TransferStatus};
use ps3eye::mode::Resolution;
use ps3eye::registers::{REG_STREAM, STREAM_START, STREAM_STOP};
use ps3eye::replay::PacketReplay;
use ps3eye::test_utils::{MockDevice, PayloadGenerator, MOCK_VIDEO_ENDPOINT};
use ps3eye::{CaptureSession, PacketRecorder, SessionError, SessionState, StreamState};
use std::sync::Arc;

fn streaming_session(width: u32, height: u32, fps: u8) -> (MockDevice, CaptureSession<MockDevice>) {
    let device = MockDevice::new();
    let mut session = CaptureSession::new(device.clone());
    session.init(width, height, fps).expect("init");
    session.start().expect("start");
    (device, session)
}

fn inject_frame(device: &MockDevice, gen: &mut PayloadGenerator, frame: &[u8]) {
    for transfer in gen.frame_transfers(frame) {
        assert!(device.inject(&transfer));
    }
}

// ============================================================================
// Init
// ============================================================================

#[test]
fn test_init_selects_mode_and_reads_sensor_id() {
    let device = MockDevice::new();
    let mut session = CaptureSession::new(device.clone());
    assert_eq!(session.state(), SessionState::Closed);

    session.init(640, 480, 60).expect("init");

    assert_eq!(session.state(), SessionState::Configured);
    assert_eq!(session.sensor_id(), Some(0x7721));
    let mode = session.mode().expect("mode");
    assert_eq!(mode.resolution, Resolution::Vga);
    assert_eq!(mode.fps, 60);
    assert!(device.is_open());
    assert_eq!(device.bridge_register(REG_STREAM), STREAM_STOP);
    assert!(!device.is_streaming());
}

#[test]
fn test_init_open_failure_propagates() {
    let device = MockDevice::new();
    device.fail_open(Some(LibusbError::Access));
    let mut session = CaptureSession::new(device.clone());

    let result = session.init(640, 480, 60);
    assert!(matches!(result, Err(SessionError::Open(LibusbError::Access))));
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.sensor_id(), None);
}

#[test]
fn test_reinit_while_streaming_stops_first() {
    let (device, mut session) = streaming_session(640, 480, 60);

    session.init(320, 240, 30).expect("reinit");
    assert_eq!(session.state(), SessionState::Configured);
    assert!(!device.is_streaming());
    assert_eq!(device.open_count(), 1);
    assert_eq!(session.mode().map(|m| m.resolution), Some(Resolution::Qvga));
}

#[test]
fn test_init_survives_stuck_sccb_status() {
    let device = MockDevice::new();
    device.script_status(&[0x03; 4096]);
    let mut session = CaptureSession::new(device.clone());

    session.init(640, 480, 60).expect("init");
    assert_eq!(session.state(), SessionState::Configured);
    assert!(session.soft_failures() > 0);
    assert!(session.sensor_id().is_some());
}

#[test]
fn test_start_survives_failed_sccb_status() {
    let device = MockDevice::new();
    let mut session = CaptureSession::new(device.clone());
    session.init(640, 480, 60).expect("init");
    assert_eq!(session.soft_failures(), 0);

    device.script_status(&[0x04; 512]);
    session.start().expect("start");
    assert!(session.is_streaming());
    assert!(session.soft_failures() > 0);
    assert_eq!(device.bridge_register(REG_STREAM), STREAM_START);
}

// ============================================================================
// Start / Stop
// ============================================================================

#[test]
fn test_start_programs_rate_registers() {
    let device = MockDevice::new();
    let mut session = CaptureSession::new(device.clone());
    session.init(640, 480, 60).expect("init");
    device.clear_log();

    session.start().expect("start");

    let sensor = device.sensor_writes();
    assert!(sensor.contains(&(0x11, 0x01)));
    assert!(sensor.contains(&(0x0d, 0xc1)));
    let bridge = device.bridge_writes();
    assert!(bridge.contains(&(0xe5, 0x04)));
    assert_eq!(bridge.last(), Some(&(REG_STREAM, STREAM_START)));

    assert!(session.is_streaming());
    assert!(device.is_streaming());
    assert_eq!(session.stream_state(), StreamState::Streaming);
}

#[test]
fn test_start_before_init_is_rejected() {
    let device = MockDevice::new();
    let mut session = CaptureSession::new(device.clone());

    assert!(matches!(session.start(), Err(SessionError::NotConfigured)));
    session.open().expect("open");
    assert!(matches!(session.start(), Err(SessionError::NotConfigured)));
    assert!(!device.is_streaming());
}

#[test]
fn test_start_failure_leaves_session_configured() {
    let device = MockDevice::new();
    let mut session = CaptureSession::new(device.clone());
    session.init(640, 480, 60).expect("init");
    device.fail_start(true);

    assert!(matches!(session.start(), Err(SessionError::Stream(_))));
    assert!(!session.is_streaming());
    assert_eq!(device.bridge_register(REG_STREAM), STREAM_STOP);

    device.fail_start(false);
    session.start().expect("retry");
    assert!(session.is_streaming());
}

#[test]
fn test_stop_and_restart() {
    let (device, mut session) = streaming_session(640, 480, 60);
    device.clear_log();

    session.stop();
    assert_eq!(session.state(), SessionState::Opened);
    assert!(!device.is_streaming());
    assert!(device.bridge_writes().contains(&(REG_STREAM, STREAM_STOP)));

    // Stopping twice is a no-op
    device.clear_log();
    session.stop();
    assert!(device.calls().is_empty());

    session.start().expect("restart");
    assert!(session.is_streaming());
}

#[test]
fn test_close_releases_device() {
    let (device, mut session) = streaming_session(320, 240, 60);
    session.close();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!device.is_open());
    assert_eq!(session.stream_state(), StreamState::Stopped);
}

#[test]
fn test_drop_releases_device() {
    let (device, session) = streaming_session(320, 240, 60);
    drop(session);
    assert!(!device.is_open());
    assert!(!device.is_streaming());
}

// ============================================================================
// Frames
// ============================================================================

#[test]
fn test_frames_delivered_one_at_a_time() {
    let (device, mut session) = streaming_session(640, 480, 60);
    let mut gen = PayloadGenerator::default();
    assert!(!session.is_new_frame());

    for seed in 0..3u8 {
        let frame = PayloadGenerator::pattern_frame(614_400, seed);
        inject_frame(&device, &mut gen, &frame);

        assert!(session.is_new_frame());
        let got = session.get_frame().expect("frame");
        assert_eq!(got.len(), 614_400);
        assert_eq!(got, frame);
        assert!(!session.is_new_frame());
    }
    assert_eq!(session.assembler_stats().frames_completed, 3);
}

#[test]
fn test_with_frame_borrows_latest() {
    let (device, mut session) = streaming_session(320, 240, 60);
    let mut gen = PayloadGenerator::default();
    let frame = PayloadGenerator::pattern_frame(153_600, 9);
    inject_frame(&device, &mut gen, &frame);

    assert_eq!(session.with_frame(|f| f[..4].to_vec()), Some(frame[..4].to_vec()));
    assert_eq!(session.with_frame(|f| f.len()), None);
}

#[test]
fn test_stream_failure_is_reported() {
    let (device, session) = streaming_session(640, 480, 60);
    device.fail_stream(TransferStatus::NoDevice);

    assert_eq!(
        session.stream_state(),
        StreamState::Failed(TransferStatus::NoDevice)
    );
    assert!(!device.inject(&[0u8; 16]));
}

#[test]
fn test_update_pumps_transport_events() {
    let (device, session) = streaming_session(320, 240, 60);
    session
        .update(std::time::Duration::from_millis(1))
        .expect("update");
    assert_eq!(device.event_calls(), 1);
}

// ============================================================================
// Controls
// ============================================================================

#[test]
fn test_control_writes_are_idempotent() {
    let (device, mut session) = streaming_session(640, 480, 60);

    device.clear_log();
    session.set_gain(42);
    let first = device.calls();

    device.clear_log();
    session.set_gain(42);
    assert_eq!(device.calls(), first);
    assert!(!first.is_empty());
    assert_eq!(device.sensor_register(REG_GAIN), encode_gain(42));
}

#[test]
fn test_controls_cached_while_closed_and_applied_on_start() {
    let device = MockDevice::new();
    let mut session = CaptureSession::new(device.clone());

    session.set_gain(7);
    session.set_flip(true, false);
    assert!(device.calls().is_empty());
    assert_eq!(session.gain(), 7);
    assert_eq!(session.flip(), (true, false));

    session.init(640, 480, 60).expect("init");
    session.start().expect("start");
    assert_eq!(device.sensor_register(REG_GAIN), encode_gain(7));
}

#[test]
fn test_flip_keeps_other_bits_of_register() {
    let device = MockDevice::new();
    let mut session = CaptureSession::new(device.clone());
    session.init(640, 480, 60).expect("init");
    device.set_sensor_register(REG_FLIP, 0x15);

    session.set_flip(true, false);
    assert_eq!(device.sensor_register(REG_FLIP), encode_flip(0x15, true, false));
    assert_eq!(device.sensor_register(REG_FLIP), 0x95);

    session.set_flip(false, true);
    assert_eq!(device.sensor_register(REG_FLIP), 0x55);
}

#[test]
fn test_auto_gain_toggles_low_bits_of_auto_register() {
    let device = MockDevice::new();
    let mut session = CaptureSession::new(device.clone());
    session.init(640, 480, 60).expect("init");

    device.set_sensor_register(REG_AUTO_EXT, 0x10);
    session.set_auto_gain(true);
    assert_eq!(device.sensor_register(REG_COM8), 0xf7);
    assert_eq!(device.sensor_register(REG_AUTO_EXT), 0x13);

    device.set_sensor_register(REG_AUTO_EXT, 0xff);
    device.set_sensor_register(REG_GAIN, 0x00);
    session.set_auto_gain(false);
    assert_eq!(device.sensor_register(REG_COM8), 0xf0);
    assert_eq!(device.sensor_register(REG_AUTO_EXT), 0xfc);
    // Manual gain is pushed again
    assert_eq!(device.sensor_register(REG_GAIN), encode_gain(session.gain()));
}

// ============================================================================
// Recording
// ============================================================================

#[test]
fn test_recorder_tees_payloads_into_replayable_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = MockDevice::new();
    let mut session = CaptureSession::new(device.clone());
    session.init(320, 240, 60).expect("init");

    let recorder = Arc::new(PacketRecorder::new());
    let mode = session.mode().expect("mode");
    recorder
        .start_capture(CaptureMetadata::for_mode(&mode))
        .expect("start capture");
    session.set_recorder(Some(Arc::clone(&recorder)));
    session.start().expect("start");

    let mut gen = PayloadGenerator::default();
    let frame = PayloadGenerator::pattern_frame(mode.frame_size(), 3);
    let transfers = gen.frame_transfers(&frame);
    for transfer in &transfers {
        assert!(device.inject(transfer));
    }
    session.stop();

    let result = recorder.stop_capture(dir.path()).expect("stop capture");
    assert_eq!(result.metadata.total_packets, transfers.len() as u64);
    assert_eq!(result.metadata.total_frames, 1);
    assert_eq!(result.metadata.endpoint, MOCK_VIDEO_ENDPOINT);

    let replay = PacketReplay::load(&result.packets_path).expect("load");
    assert_eq!(replay.frames().expect("frames"), vec![frame]);
}
