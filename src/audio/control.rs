//! Cross-thread playback control
//!
//! The worker thread owns the device; every other thread reaches it only
//! through an [`AudioHandle`], which carries the interrupt signal, the volume
//! and the beep slot read by the device callback.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// A beep being played, with its read position
#[derive(Debug)]
pub struct BeepCursor {
    samples: Arc<[i16]>,
    pos: usize,
}

impl BeepCursor {
    /// Next beep sample, or `None` once the beep is finished
    pub fn next_sample(&mut self) -> Option<i16> {
        let sample = self.samples.get(self.pos).copied();
        self.pos += 1;
        sample
    }
}

#[derive(Debug)]
struct PlaybackControl {
    generation: AtomicU64,
    interrupted: AtomicBool,
    /// Last flush ticket handed out
    flush_requested: AtomicU64,
    /// Last flush ticket the device has honoured
    flush_done: AtomicU64,
    volume: AtomicU8,
    beep: Mutex<Option<BeepCursor>>,
}

/// Shareable handle to the playback state
#[derive(Debug, Clone)]
pub struct AudioHandle {
    inner: Arc<PlaybackControl>,
}

impl Default for AudioHandle {
    fn default() -> Self {
        Self::new(100)
    }
}

impl AudioHandle {
    #[must_use]
    pub fn new(volume: u8) -> Self {
        Self {
            inner: Arc::new(PlaybackControl {
                generation: AtomicU64::new(0),
                interrupted: AtomicBool::new(false),
                flush_requested: AtomicU64::new(0),
                flush_done: AtomicU64::new(0),
                volume: AtomicU8::new(volume.min(100)),
                beep: Mutex::new(None),
            }),
        }
    }

    /// Silence playback and drop whatever the device has buffered
    ///
    /// Safe to call from any thread. Returns the new generation; work stamped
    /// with an older generation is stale.
    pub fn interrupt(&self) -> u64 {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.interrupted.store(true, Ordering::Release);
        self.request_flush();
        tracing::debug!(generation, "playback interrupted");
        generation
    }

    /// Current generation
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Re-arm playback after an interrupt
    pub fn clear_interrupt(&self) {
        self.inner.interrupted.store(false, Ordering::Release);
    }

    /// Re-arm playback for work stamped with `generation`
    ///
    /// Returns `false` (and leaves the interrupt in place) when a newer
    /// interrupt has arrived since the work was queued.
    pub fn arm(&self, generation: u64) -> bool {
        if self.generation() != generation {
            return false;
        }
        self.clear_interrupt();
        // An interrupt may have landed between the check and the clear
        if self.generation() != generation {
            self.inner.interrupted.store(true, Ordering::Release);
            return false;
        }
        true
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::Acquire)
    }

    /// Ask the device to discard its buffer on its next callback
    ///
    /// Returns a ticket for [`flush_done`](Self::flush_done). Only samples
    /// queued before the request may be discarded by it.
    pub fn request_flush(&self) -> u64 {
        self.inner.flush_requested.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Newest flush ticket the device has not honoured yet
    #[must_use]
    pub fn pending_flush(&self) -> Option<u64> {
        let requested = self.inner.flush_requested.load(Ordering::Acquire);
        (requested > self.inner.flush_done.load(Ordering::Acquire)).then_some(requested)
    }

    /// Record that the buffer was cleared for every ticket up to `ticket`
    pub fn ack_flush(&self, ticket: u64) {
        self.inner.flush_done.fetch_max(ticket, Ordering::AcqRel);
    }

    /// Whether the flush with `ticket` has been honoured
    #[must_use]
    pub fn flush_done(&self, ticket: u64) -> bool {
        self.inner.flush_done.load(Ordering::Acquire) >= ticket
    }

    /// Output volume in percent
    #[must_use]
    pub fn volume(&self) -> u8 {
        self.inner.volume.load(Ordering::Relaxed)
    }

    pub fn set_volume(&self, percent: u8) {
        self.inner.volume.store(percent.min(100), Ordering::Relaxed);
    }

    /// Volume as a linear gain
    #[must_use]
    pub fn gain(&self) -> f32 {
        f32::from(self.volume()) / 100.0
    }

    /// Start a beep ahead of any queued PCM, replacing a beep in progress
    pub fn play_beep(&self, samples: Arc<[i16]>) {
        let mut slot = self
            .inner
            .beep
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(BeepCursor { samples, pos: 0 });
    }

    /// Whether a beep is still sounding
    #[must_use]
    pub fn beep_active(&self) -> bool {
        self.inner
            .beep
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Fill `out` with beep samples, returning how many were written
    ///
    /// Used by the device callback; never blocks on a contended lock.
    pub fn mix_beep(&self, out: &mut [i16]) -> usize {
        let Ok(mut slot) = self.inner.beep.try_lock() else {
            return 0;
        };
        let Some(cursor) = slot.as_mut() else {
            return 0;
        };

        let mut written = 0;
        for sample in out.iter_mut() {
            match cursor.next_sample() {
                Some(s) => {
                    *sample = s;
                    written += 1;
                }
                None => {
                    *slot = None;
                    break;
                }
            }
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_interrupt_from_other_thread() {
        let handle = AudioHandle::default();
        let remote = handle.clone();
        thread::spawn(move || remote.interrupt()).join().unwrap();

        assert!(handle.is_interrupted());
        let ticket = handle.pending_flush().unwrap();
        assert!(!handle.flush_done(ticket));
        handle.ack_flush(ticket);
        assert!(handle.flush_done(ticket));
        assert_eq!(handle.pending_flush(), None);
        handle.clear_interrupt();
        assert!(!handle.is_interrupted());
    }

    #[test]
    fn test_late_request_stays_pending_after_older_ack() {
        let handle = AudioHandle::default();
        let first = handle.request_flush();
        let second = handle.request_flush();
        handle.ack_flush(first);
        assert_eq!(handle.pending_flush(), Some(second));
        handle.ack_flush(second);
        assert_eq!(handle.pending_flush(), None);
    }

    #[test]
    fn test_arm_rejects_stale_generation() {
        let handle = AudioHandle::default();
        let queued_at = handle.generation();
        handle.interrupt();

        assert!(!handle.arm(queued_at));
        assert!(handle.is_interrupted());
        assert!(handle.arm(handle.generation()));
        assert!(!handle.is_interrupted());
    }

    #[test]
    fn test_beep_survives_interrupt() {
        let handle = AudioHandle::default();
        handle.play_beep(vec![1i16, 2, 3].into());
        handle.interrupt();

        let mut out = [0i16; 2];
        assert_eq!(handle.mix_beep(&mut out), 2);
        assert_eq!(out, [1, 2]);
        assert_eq!(handle.mix_beep(&mut out), 1);
        assert!(!handle.beep_active());
    }

    #[test]
    fn test_volume_clamped() {
        let handle = AudioHandle::new(150);
        assert_eq!(handle.volume(), 100);
        handle.set_volume(40);
        assert!((handle.gain() - 0.4).abs() < f32::EPSILON);
    }
}
