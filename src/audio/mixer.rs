//! Block mixer driven by an output render callback
//!
//! The mixer owns the output clock (frames rendered so far) and the set of
//! blocks scheduled against it. Each render pass sums every block that
//! overlaps the rendered window and fires the completion signal of every
//! block that has fully played.

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifier of a block at the output device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u64);

/// Completion signal for a scheduled block
///
/// Firing never blocks; if the owning buffer is gone the signal is dropped.
#[derive(Debug, Clone)]
pub struct Completion {
    id: BlockId,
    tx: Sender<BlockId>,
}

impl Completion {
    pub fn new(id: BlockId, tx: Sender<BlockId>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn fire(&self) {
        let _ = self.tx.try_send(self.id);
    }
}

struct Voice {
    samples: Arc<[f32]>,
    start_frame: u64,
    completion: Completion,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Mono block mixer with a frame-accurate clock
pub struct Mixer {
    sample_rate: u32,
    /// Frames rendered since creation
    clock: AtomicU64,
    voices: Mutex<Vec<Voice>>,
}

impl Mixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            clock: AtomicU64::new(0),
            voices: Mutex::new(Vec::new()),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames rendered so far
    pub fn frames_rendered(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    /// Output clock in seconds
    pub fn current_time(&self) -> f64 {
        self.frames_rendered() as f64 / self.sample_rate as f64
    }

    /// Number of blocks waiting or playing
    pub fn active_blocks(&self) -> usize {
        self.voices.lock().len()
    }

    /// Schedule `samples` to start at absolute time `at` (seconds).
    ///
    /// A start time already in the past plays from the current clock. A block
    /// that is already scheduled under the same id is moved.
    pub fn schedule(&self, samples: Arc<[f32]>, at: f64, completion: Completion) {
        let requested = (at.max(0.0) * self.sample_rate as f64).round() as u64;
        let mut voices = self.voices.lock();
        let start_frame = requested.max(self.frames_rendered());

        voices.retain(|v| v.completion.id() != completion.id());
        voices.push(Voice {
            samples,
            start_frame,
            completion,
        });
    }

    /// Remove a block without firing its completion
    pub fn cancel(&self, id: BlockId) {
        self.voices.lock().retain(|v| v.completion.id() != id);
    }

    /// Render the next window into `out` (interleaved, `channels` wide).
    ///
    /// Every channel receives the same mono mix.
    pub fn render(&self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = (out.len() / channels) as u64;
        out.fill(0.0);

        let mut voices = self.voices.lock();
        let now = self.frames_rendered();
        let end = now + frames;

        for voice in voices.iter() {
            let from = voice.start_frame.max(now);
            let to = voice.end_frame().min(end);
            for frame in from..to {
                let sample = voice.samples[(frame - voice.start_frame) as usize];
                let base = (frame - now) as usize * channels;
                for slot in &mut out[base..base + channels] {
                    *slot += sample;
                }
            }
        }

        voices.retain(|voice| {
            if voice.end_frame() <= end {
                voice.completion.fire();
                false
            } else {
                true
            }
        });

        self.clock.store(end, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_render_places_block_at_start_frame() {
        let mixer = Mixer::new(10);
        let (tx, rx) = unbounded();

        mixer.schedule(Arc::from(vec![1.0, 2.0]), 0.3, Completion::new(BlockId(7), tx));

        let mut out = vec![0.0; 4];
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.0, 0.0, 0.0, 1.0]);
        assert!(rx.try_recv().is_err());

        mixer.render(&mut out, 1);
        assert_eq!(out, vec![2.0, 0.0, 0.0, 0.0]);
        assert_eq!(rx.try_recv().unwrap(), BlockId(7));
        assert_eq!(mixer.active_blocks(), 0);
        assert_eq!(mixer.frames_rendered(), 8);
    }

    #[test]
    fn test_render_duplicates_mono_to_channels() {
        let mixer = Mixer::new(48000);
        let (tx, _rx) = unbounded();
        mixer.schedule(Arc::from(vec![0.5, 0.25]), 0.0, Completion::new(BlockId(1), tx));

        let mut out = vec![0.0; 4];
        mixer.render(&mut out, 2);
        assert_eq!(out, vec![0.5, 0.5, 0.25, 0.25]);
    }

    #[test]
    fn test_cancel_suppresses_completion() {
        let mixer = Mixer::new(100);
        let (tx, rx) = unbounded();
        mixer.schedule(Arc::from(vec![1.0; 10]), 0.0, Completion::new(BlockId(3), tx));
        mixer.cancel(BlockId(3));

        let mut out = vec![0.0; 20];
        mixer.render(&mut out, 1);
        assert!(out.iter().all(|s| *s == 0.0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_past_start_plays_from_now() {
        let mixer = Mixer::new(10);
        let mut out = vec![0.0; 5];
        mixer.render(&mut out, 1);

        let (tx, _rx) = unbounded();
        mixer.schedule(Arc::from(vec![1.0]), 0.0, Completion::new(BlockId(1), tx));
        mixer.render(&mut out, 1);
        assert_eq!(out[0], 1.0);
    }
}
