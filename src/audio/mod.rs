//! Audio output engine
//!
//! All PCM in the pipeline is 16 kHz, mono, signed 16-bit little-endian.

mod beep;
mod control;
mod device;
mod output;
mod ring;
pub mod wav;

pub use beep::BeepSet;
pub use control::{AudioHandle, BeepCursor};
pub use device::CpalSink;
pub use output::{AudioOutput, PcmSink, PlayOutcome, SinkError};
pub use ring::{FLUSH_TIMEOUT, RingReader, RingWriter, sample_ring};

use std::time::Duration;

use crate::Result;

/// Pipeline sample rate
pub const SAMPLE_RATE: u32 = 16_000;

/// Encode samples as little-endian bytes
#[must_use]
pub fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Decode little-endian bytes into samples; a trailing odd byte is ignored
#[must_use]
pub fn pcm_from_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Samples in one chunk of the given duration (at least one)
#[must_use]
pub fn chunk_samples(chunk: Duration) -> usize {
    usize::try_from(chunk.as_millis() * u128::from(SAMPLE_RATE) / 1000)
        .unwrap_or(usize::MAX)
        .max(1)
}

/// Open the platform device and wrap it in an [`AudioOutput`]
///
/// # Errors
///
/// Returns error if the device cannot be opened
pub fn open_output(
    device: Option<&str>,
    handle: AudioHandle,
    chunk: Duration,
) -> Result<AudioOutput> {
    let sink = CpalSink::open(device, handle.clone(), chunk_samples(chunk))?;
    Ok(AudioOutput::new(Box::new(sink), handle, chunk))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_bytes_little_endian() {
        let bytes = pcm_to_bytes(&[1, -2]);
        assert_eq!(bytes, vec![0x01, 0x00, 0xfe, 0xff]);
        assert_eq!(pcm_from_bytes(&bytes), vec![1, -2]);
        assert_eq!(pcm_from_bytes(&[0x01, 0x00, 0x05]), vec![1]);
    }
}
