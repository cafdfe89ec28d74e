//! Sample ring between the audio lane and a device callback
//!
//! The writer half lives on the audio lane, the reader half inside the device
//! callback. A flush is a ticket handed out by the [`AudioHandle`]: the reader
//! clears the ring, then acknowledges the ticket. After an interrupt the
//! writer holds back new samples until a flush covering everything it queued
//! earlier has been acknowledged, so a clear never reaches into the next
//! phrase.

use std::thread;
use std::time::{Duration, Instant};

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use super::AudioHandle;
use super::output::SinkError;

/// Back-off while the ring is full or a flush is outstanding
const WAIT_STEP: Duration = Duration::from_millis(5);

/// Longest the writer waits for the reader to honour a flush
pub const FLUSH_TIMEOUT: Duration = Duration::from_millis(250);

/// Split a ring of `capacity` samples into its two halves
#[must_use]
pub fn sample_ring(capacity: usize, handle: AudioHandle) -> (RingWriter, RingReader) {
    let (producer, consumer) = HeapRb::<i16>::new(capacity).split();
    let generation = handle.generation();
    (
        RingWriter {
            producer,
            handle: handle.clone(),
            generation,
        },
        RingReader { consumer, handle },
    )
}

/// Producer half, owned by the audio lane
pub struct RingWriter {
    producer: HeapProd<i16>,
    handle: AudioHandle,
    /// Generation of the samples last queued
    generation: u64,
}

impl RingWriter {
    /// Queue samples, blocking while the ring is full
    ///
    /// Gives up quietly once `stop()` is true.
    ///
    /// # Errors
    ///
    /// [`SinkError::Underrun`] when the reader does not honour a flush within
    /// [`FLUSH_TIMEOUT`]
    pub fn write(&mut self, samples: &[i16], stop: &dyn Fn() -> bool) -> Result<(), SinkError> {
        if !self.settle(stop)? {
            return Ok(());
        }

        let mut rest = samples;
        while !rest.is_empty() {
            if stop() {
                return Ok(());
            }
            let pushed = self.producer.push_slice(rest);
            rest = &rest[pushed..];
            if pushed == 0 {
                thread::sleep(WAIT_STEP);
            }
        }
        Ok(())
    }

    /// Wait out the flush that separates the current generation from the last
    ///
    /// Returns `false` if `stop()` fired first.
    fn settle(&mut self, stop: &dyn Fn() -> bool) -> Result<bool, SinkError> {
        let generation = self.handle.generation();
        if generation == self.generation {
            return Ok(true);
        }

        // Samples pushed after the interrupt's own request are not covered by it
        let ticket = if self.producer.is_empty() {
            self.handle.pending_flush()
        } else {
            Some(self.handle.request_flush())
        };

        if let Some(ticket) = ticket {
            let deadline = Instant::now() + FLUSH_TIMEOUT;
            while !self.handle.flush_done(ticket) {
                if stop() {
                    return Ok(false);
                }
                if Instant::now() >= deadline {
                    tracing::warn!(ticket, "device did not flush in time");
                    return Err(SinkError::Underrun);
                }
                thread::sleep(WAIT_STEP);
            }
        }

        self.generation = generation;
        Ok(true)
    }

    /// Samples queued but not yet taken by the reader
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.producer.occupied_len()
    }
}

/// Consumer half, driven by the device callback
pub struct RingReader {
    consumer: HeapCons<i16>,
    handle: AudioHandle,
}

impl RingReader {
    /// Fill `out` with beep samples first, then queued PCM
    ///
    /// Honours any pending flush before reading. Returns how many samples
    /// were written; the rest of `out` is left as it was.
    pub fn fill(&mut self, out: &mut [i16]) -> usize {
        if let Some(ticket) = self.handle.pending_flush() {
            self.consumer.clear();
            self.handle.ack_flush(ticket);
        }

        let from_beep = self.handle.mix_beep(out);
        from_beep + self.consumer.pop_slice(&mut out[from_beep..])
    }

    /// Current output gain
    #[must_use]
    pub fn gain(&self) -> f32 {
        self.handle.gain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never() -> bool {
        false
    }

    #[test]
    fn test_flush_spares_samples_queued_after_interrupt() {
        let handle = AudioHandle::default();
        let (mut writer, mut reader) = sample_ring(8000, handle.clone());
        writer.write(&[1; 1600], &never).unwrap();

        // Next job starts before the device callback has run
        let generation = handle.interrupt();
        assert!(handle.arm(generation));

        let callback = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            let mut played = Vec::new();
            while played.len() < 3200 && Instant::now() < deadline {
                let mut period = [0i16; 320];
                let n = reader.fill(&mut period);
                played.extend_from_slice(&period[..n]);
                thread::sleep(Duration::from_millis(2));
            }
            played
        });

        writer.write(&[2; 3200], &never).unwrap();
        let played = callback.join().unwrap();
        assert_eq!(played.len(), 3200);
        assert!(played.iter().all(|&s| s == 2));
    }

    #[test]
    fn test_drained_ring_needs_no_extra_flush() {
        let handle = AudioHandle::default();
        let (mut writer, mut reader) = sample_ring(1600, handle.clone());

        let generation = handle.interrupt();
        let mut period = [0i16; 800];
        assert_eq!(reader.fill(&mut period), 0);
        assert!(handle.arm(generation));

        // No callback is running; this must not wait for one
        writer.write(&[7; 800], &never).unwrap();
        assert_eq!(reader.fill(&mut period), 800);
        assert!(period.iter().all(|&s| s == 7));
    }

    #[test]
    fn test_unacknowledged_flush_reports_underrun() {
        let handle = AudioHandle::default();
        let (mut writer, _reader) = sample_ring(1600, handle.clone());
        writer.write(&[1; 400], &never).unwrap();

        let generation = handle.interrupt();
        assert!(handle.arm(generation));
        assert!(matches!(writer.write(&[2; 400], &never), Err(SinkError::Underrun)));
    }

    #[test]
    fn test_beep_read_ahead_of_ring() {
        let handle = AudioHandle::default();
        let (mut writer, mut reader) = sample_ring(100, handle.clone());
        writer.write(&[5; 10], &never).unwrap();
        handle.play_beep(vec![9i16; 3].into());

        let mut period = [0i16; 6];
        assert_eq!(reader.fill(&mut period), 6);
        assert_eq!(period, [9, 9, 9, 5, 5, 5]);
        assert_eq!(writer.buffered(), 7);
    }
}
