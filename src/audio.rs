//! Four-channel microphone array
//!
//! The camera exposes a USB audio interface delivering interleaved 16-bit
//! little-endian samples, four channels per sample frame, over isochronous
//! transfers. [`Microphone`] streams it and hands decoded samples to a
//! callback on the event thread.

use std::sync::Arc;

use crate::enumerate::EyeDevice;
use crate::libusb::{TransferType, UsbDeviceHandle};
use crate::transfer::{PayloadSink, StreamError, StreamState, TransferPool};
use crate::usb::EventPump;

/// Configuration selected before claiming the audio interface
pub const AUDIO_CONFIGURATION: i32 = 1;
/// Audio streaming interface
pub const AUDIO_INTERFACE: u8 = 2;
/// Alternate setting with the isochronous endpoint
pub const AUDIO_ALT_SETTING: u8 = 1;
/// Number of channels per sample frame
pub const CHANNELS: usize = 4;
/// Bytes per sample frame
pub const FRAME_BYTES: usize = CHANNELS * 2;
/// Isochronous packets per transfer
pub const ISO_PACKETS: usize = 8;
/// Bytes per isochronous packet
pub const ISO_PACKET_LEN: usize = 128;

/// Decodes raw audio packets into interleaved samples
///
/// The callback receives the samples and the number of sample frames.
pub struct AudioDemuxer<F> {
    callback: F,
    samples: Vec<i16>,
    rejected: u64,
}

impl<F: FnMut(&[i16], usize) + Send> AudioDemuxer<F> {
    /// Wrap a sample callback
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            samples: Vec::with_capacity(ISO_PACKET_LEN / 2),
            rejected: 0,
        }
    }

    /// Packets dropped for not holding whole sample frames
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Decode one packet and pass it on
    pub fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if data.len() % FRAME_BYTES != 0 {
            log::trace!("Dropping {}-byte audio packet", data.len());
            self.rejected += 1;
            return;
        }
        self.samples.clear();
        self.samples.extend(
            data.chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
        );
        (self.callback)(&self.samples, data.len() / FRAME_BYTES);
    }
}

impl<F: FnMut(&[i16], usize) + Send> PayloadSink for AudioDemuxer<F> {
    fn on_payload(&mut self, data: &[u8]) {
        self.push(data);
    }
}

/// A running microphone stream
pub struct Microphone {
    // Dropped in order: pool, pump, handle
    pool: Option<TransferPool>,
    pump: Option<EventPump>,
    handle: UsbDeviceHandle,
    last_state: StreamState,
}

impl Microphone {
    /// Open the audio interface of `device` and start streaming
    ///
    /// `callback` runs on the event thread with interleaved samples and the
    /// number of sample frames they hold.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface cannot be claimed, has no
    /// isochronous endpoint, or the transfers cannot be started.
    pub fn open<F>(device: &EyeDevice, callback: F) -> Result<Self, StreamError>
    where
        F: FnMut(&[i16], usize) + Send + 'static,
    {
        let mut handle = device.usb_device().open()?;

        if let Err(e) = handle.set_configuration(AUDIO_CONFIGURATION) {
            log::warn!("Failed to set configuration {}: {}", AUDIO_CONFIGURATION, e);
        }
        handle.claim_interface(i32::from(AUDIO_INTERFACE))?;

        match Self::start_stream(&handle, callback) {
            Ok((pool, pump)) => Ok(Self {
                pool: Some(pool),
                pump: Some(pump),
                handle,
                last_state: StreamState::Stopped,
            }),
            Err(e) => {
                if let Err(release) = handle.release_interface(i32::from(AUDIO_INTERFACE)) {
                    log::debug!("Failed to release audio interface: {}", release);
                }
                Err(e)
            }
        }
    }

    fn start_stream<F>(
        handle: &UsbDeviceHandle,
        callback: F,
    ) -> Result<(TransferPool, EventPump), StreamError>
    where
        F: FnMut(&[i16], usize) + Send + 'static,
    {
        handle.set_interface_alt_setting(i32::from(AUDIO_INTERFACE), i32::from(AUDIO_ALT_SETTING))?;
        let endpoint = handle
            .find_endpoint(
                AUDIO_INTERFACE,
                Some(AUDIO_ALT_SETTING),
                TransferType::Isochronous,
            )?
            .ok_or(StreamError::NoEndpoint(
                TransferType::Isochronous,
                AUDIO_INTERFACE,
            ))?;
        log::info!(
            "Audio endpoint 0x{:02x}, max packet {}",
            endpoint.address,
            endpoint.max_packet_size
        );

        let pump = EventPump::start(Arc::clone(handle.context()))?;
        // SAFETY: the pool is stored next to the handle and dropped before it
        let mut pool = unsafe {
            TransferPool::isochronous(
                handle,
                endpoint.address,
                ISO_PACKETS,
                ISO_PACKET_LEN,
                Box::new(AudioDemuxer::new(callback)),
            )?
        };
        pool.start()?;
        Ok((pool, pump))
    }

    /// Current stream state
    pub fn stream_state(&self) -> StreamState {
        match &self.pool {
            Some(pool) => pool.state(),
            None => self.last_state,
        }
    }

    /// Stop streaming and release the interface; idempotent
    pub fn shut(&mut self) {
        let Some(mut pool) = self.pool.take() else {
            return;
        };
        pool.stop();
        self.last_state = pool.state();
        drop(pool);
        if let Some(mut pump) = self.pump.take() {
            pump.stop();
        }
        if let Err(e) = self.handle.release_interface(i32::from(AUDIO_INTERFACE)) {
            log::debug!("Failed to release audio interface: {}", e);
        }
        log::info!("Microphone stopped");
    }
}

impl Drop for Microphone {
    fn drop(&mut self) {
        self.shut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demux_little_endian_samples() {
        let mut seen = Vec::new();
        let mut frames = 0;
        {
            let mut demux = AudioDemuxer::new(|samples: &[i16], n| {
                seen.extend_from_slice(samples);
                frames += n;
            });
            demux.push(&[0x01, 0x00, 0xff, 0xff, 0x00, 0x80, 0xff, 0x7f]);
        }
        assert_eq!(seen, vec![1, -1, i16::MIN, i16::MAX]);
        assert_eq!(frames, 1);
    }

    #[test]
    fn test_demux_multiple_frames() {
        let mut frames = 0;
        let mut demux = AudioDemuxer::new(|samples: &[i16], n| {
            assert_eq!(samples.len(), n * CHANNELS);
            frames += n;
        });
        demux.push(&[0u8; ISO_PACKET_LEN]);
        demux.push(&[0u8; 3 * FRAME_BYTES]);
        drop(demux);
        assert_eq!(frames, 16 + 3);
    }

    #[test]
    fn test_demux_512_bytes_keeps_channel_order() {
        let data: Vec<u8> = (0..256i16).flat_map(|s| s.to_le_bytes()).collect();
        let mut delivered = Vec::new();
        let mut demux = AudioDemuxer::new(|samples: &[i16], n| delivered.push((samples.to_vec(), n)));
        demux.push(&data);
        drop(demux);

        assert_eq!(delivered.len(), 1);
        let (samples, n) = &delivered[0];
        assert_eq!(*n, 64);
        assert_eq!(&samples[..CHANNELS], &[0, 1, 2, 3]);
        assert_eq!(&samples[252..], &[252, 253, 254, 255]);
    }

    #[test]
    fn test_demux_rejects_partial_frames() {
        let mut calls = 0;
        let mut demux = AudioDemuxer::new(|_: &[i16], _| calls += 1);
        demux.push(&[0u8; 10]);
        demux.push(&[]);
        assert_eq!(demux.rejected(), 1);
        drop(demux);
        assert_eq!(calls, 0);
    }
}
