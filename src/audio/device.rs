//! cpal output device backed by a lock-free ring buffer
//!
//! The worker thread pushes samples into the ring; the device callback pops
//! them through the halves of a [`sample_ring`]. Drop-and-reset works from the
//! callback side: a flush request makes the next callback discard everything
//! still in the ring, so playback stops within one callback period instead of
//! when the buffer runs dry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig, SupportedStreamConfigRange};

use super::output::{PcmSink, SinkError};
use super::ring::{RingReader, RingWriter, sample_ring};
use super::{AudioHandle, SAMPLE_RATE};
use crate::{Error, Result};

/// Device buffer depth in chunks
const RING_CHUNKS: usize = 4;

/// Device rates we can reach from 16 kHz by repeating samples
const RATE_FACTORS: [u32; 3] = [1, 3, 2];

/// Platform audio output
pub struct CpalSink {
    device: Device,
    config: StreamConfig,
    factor: usize,
    capacity: usize,
    handle: AudioHandle,
    ring: RingWriter,
    fault: Arc<AtomicBool>,
    #[allow(dead_code)]
    stream: Stream,
}

impl CpalSink {
    /// Open the named output device (substring match) or the default one
    ///
    /// # Errors
    ///
    /// Returns error if no device or no usable configuration is found
    pub fn open(
        device_name: Option<&str>,
        handle: AudioHandle,
        chunk_samples: usize,
    ) -> Result<Self> {
        let host = cpal::default_host();

        let device = match device_name {
            Some(name) => host
                .output_devices()
                .map_err(|e| Error::Audio(e.to_string()))?
                .find(|d| d.name().is_ok_and(|n| n.contains(name)))
                .ok_or_else(|| Error::Audio(format!("no output device matching {name:?}")))?,
            None => host
                .default_output_device()
                .ok_or_else(|| Error::Audio("no output device available".to_string()))?,
        };

        let (config, factor) = choose_config(&device)?;
        let capacity = chunk_samples * RING_CHUNKS;
        let fault = Arc::new(AtomicBool::new(false));
        let (ring, reader) = sample_ring(capacity, handle.clone());
        let stream = build_stream(&device, &config, factor, reader, Arc::clone(&fault))
            .map_err(|e| Error::Audio(e.to_string()))?;

        tracing::info!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            capacity,
            "audio output opened"
        );

        Ok(Self {
            device,
            config,
            factor,
            capacity,
            handle,
            ring,
            fault,
            stream,
        })
    }
}

impl PcmSink for CpalSink {
    fn write(
        &mut self,
        samples: &[i16],
        cancelled: &dyn Fn() -> bool,
    ) -> std::result::Result<(), SinkError> {
        let fault = &self.fault;
        let stop = || cancelled() || fault.load(Ordering::Acquire);
        self.ring.write(samples, &stop)?;
        if fault.load(Ordering::Acquire) {
            return Err(SinkError::Underrun);
        }
        tracing::trace!(samples = samples.len(), "chunk queued");
        Ok(())
    }

    fn drop_buffered(&mut self) {
        let _ = self.handle.request_flush();
    }

    fn recover(&mut self) -> std::result::Result<(), SinkError> {
        let (ring, reader) = sample_ring(self.capacity, self.handle.clone());
        self.fault.store(false, Ordering::Release);
        let stream = build_stream(
            &self.device,
            &self.config,
            self.factor,
            reader,
            Arc::clone(&self.fault),
        )?;
        self.ring = ring;
        self.stream = stream;
        tracing::info!("audio stream rebuilt");
        Ok(())
    }

    fn buffered(&self) -> usize {
        self.ring.buffered()
    }

    fn describe(&self) -> String {
        format!(
            "cpal {} @ {} Hz x{}",
            self.device.name().unwrap_or_default(),
            self.config.sample_rate.0,
            self.config.channels
        )
    }
}

/// Pick a mono or stereo config at 16 kHz or an integer multiple of it
fn choose_config(device: &Device) -> Result<(StreamConfig, usize)> {
    let ranges: Vec<SupportedStreamConfigRange> = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .collect();

    for factor in RATE_FACTORS {
        let rate = SampleRate(SAMPLE_RATE * factor);
        for channels in [1, 2] {
            if let Some(range) = ranges.iter().find(|c| {
                c.channels() == channels
                    && c.min_sample_rate() <= rate
                    && c.max_sample_rate() >= rate
            }) {
                let config = range.clone().with_sample_rate(rate).config();
                return Ok((config, usize::try_from(factor).unwrap_or(1)));
            }
        }
    }

    Err(Error::Audio("no suitable output config found".to_string()))
}

fn build_stream(
    device: &Device,
    config: &StreamConfig,
    factor: usize,
    mut reader: RingReader,
    fault: Arc<AtomicBool>,
) -> std::result::Result<Stream, SinkError> {
    let channels = usize::from(config.channels);
    let mut scratch: Vec<i16> = Vec::new();

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                // One source sample feeds `factor` frames
                let frames = data.len() / channels;
                let needed = frames.div_ceil(factor);
                scratch.clear();
                scratch.resize(needed, 0);

                reader.fill(&mut scratch);

                let gain = reader.gain();
                for (i, frame) in data.chunks_mut(channels).enumerate() {
                    let value = f32::from(scratch[i / factor]) / 32768.0 * gain;
                    frame.fill(value);
                }
            },
            move |err| {
                tracing::error!(error = %err, "audio stream error");
                fault.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(|e| SinkError::Device(e.to_string()))?;

    stream.play().map_err(|e| SinkError::Device(e.to_string()))?;
    Ok(stream)
}
