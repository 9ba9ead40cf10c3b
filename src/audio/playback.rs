//! Per-peer adaptive playback buffer
//!
//! Turns irregularly arriving chunks into one gapless timeline on the peer's
//! output device. A cold buffer first fills up to half its capacity without
//! scheduling anything, then flushes the whole queue back-to-back from the
//! current output time. While playing, each new chunk is chained onto the end
//! of the timeline, and chunks arriving while the queue is over capacity are
//! dropped. When the last block finishes the buffer goes cold again.
//!
//! Completion signals arrive from the render thread over a channel and are
//! applied by [`PlaybackBuffer::reap`]; the render thread never touches the
//! queue.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::audio::mixer::{BlockId, Completion};
use crate::audio::output::OutputDevice;

/// What `add_chunk` did with a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Dropped because the buffer is over capacity
    Discarded,
    /// Chained onto the running timeline
    Scheduled,
    /// Held without scheduling while the buffer fills
    Queued,
    /// Started playback; this many blocks were scheduled back-to-back
    Flushed(usize),
}

/// A chunk wrapped for the output device
#[derive(Debug, Clone)]
pub struct ScheduledBlock {
    pub id: BlockId,
    pub samples: Arc<[f32]>,
    /// Absolute output time, `None` while only queued
    pub start_at: Option<f64>,
}

impl ScheduledBlock {
    /// Duration in seconds at `sample_rate`
    pub fn duration(&self, sample_rate: u32) -> f64 {
        self.samples.len() as f64 / sample_rate as f64
    }
}

/// Playback buffer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    /// Chunks queued or scheduled
    pub admitted: u64,
    /// Chunks dropped over capacity
    pub discarded: u64,
    /// Bulk schedules of the whole queue
    pub flushes: u64,
    /// Transitions from idle to playing
    pub starts: u64,
    /// Times the queue drained and the buffer went cold
    pub underruns: u64,
}

/// Jitter buffer feeding one peer's output device
pub struct PlaybackBuffer {
    label: String,
    output: Arc<dyn OutputDevice>,
    sample_rate: u32,
    capacity: usize,
    queue: VecDeque<ScheduledBlock>,
    is_playing: bool,
    /// Output time the current run started at
    start_time: f64,
    /// Offset from `start_time` where the next block goes
    timeline_cursor: f64,
    next_id: u64,
    finished_tx: Sender<BlockId>,
    finished_rx: Receiver<BlockId>,
    stats: PlaybackStats,
}

impl PlaybackBuffer {
    /// Create a buffer that drops input once more than `capacity` blocks are queued
    pub fn new(label: impl Into<String>, output: Arc<dyn OutputDevice>, capacity: usize) -> Self {
        let (finished_tx, finished_rx) = unbounded();

        Self {
            label: label.into(),
            sample_rate: output.sample_rate(),
            output,
            capacity,
            queue: VecDeque::with_capacity(capacity + 1),
            is_playing: false,
            start_time: 0.0,
            timeline_cursor: 0.0,
            next_id: 0,
            finished_tx,
            finished_rx,
            stats: PlaybackStats::default(),
        }
    }

    /// Admit one chunk. Never blocks and never fails.
    pub fn add_chunk(&mut self, samples: impl Into<Arc<[f32]>>) -> Admission {
        self.reap();

        let len = self.queue.len();

        if self.is_playing && len > self.capacity {
            tracing::trace!("[{}] chunk discarded", self.label);
            self.stats.discarded += 1;
            return Admission::Discarded;
        }

        self.stats.admitted += 1;
        let block = self.wrap(samples.into());

        if self.is_playing && !self.has_unscheduled() {
            tracing::trace!("[{}] chunk accepted", self.label);
            self.push_scheduled(block);
            Admission::Scheduled
        } else if !self.is_playing && len * 2 < self.capacity {
            tracing::trace!("[{}] chunk queued", self.label);
            self.queue.push_back(block);
            Admission::Queued
        } else {
            self.queue.push_back(block);
            let count = self.flush();
            tracing::debug!("[{}] {} queued chunks scheduled", self.label, count);
            Admission::Flushed(count)
        }
    }

    /// Mark the buffer playing; scheduling still happens in `add_chunk`
    pub fn play(&mut self) {
        if !self.is_playing {
            self.stats.starts += 1;
        }
        self.is_playing = true;
    }

    /// Stop admitting onto the timeline; scheduled blocks still finish
    pub fn pause(&mut self) {
        self.is_playing = false;
    }

    /// Blocks queued or playing
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats
    }

    /// Queued blocks in arrival order
    pub fn blocks(&self) -> impl Iterator<Item = &ScheduledBlock> {
        self.queue.iter()
    }

    /// Apply completion signals from the output. Returns how many blocks finished.
    pub fn reap(&mut self) -> usize {
        let mut finished = 0;

        while let Ok(id) = self.finished_rx.try_recv() {
            if let Some(pos) = self.queue.iter().position(|b| b.id == id) {
                self.queue.remove(pos);
                finished += 1;
            }
        }

        if finished > 0 && self.queue.is_empty() {
            tracing::debug!("[{}] buffer drained, waiting for refill", self.label);
            self.stats.underruns += 1;
            self.reset_timeline();
        }

        finished
    }

    /// Cancel every in-flight block and return to the cold state
    pub fn stop(&mut self) {
        for block in self.queue.drain(..) {
            if block.start_at.is_some() {
                self.output.cancel(block.id);
            }
        }
        while self.finished_rx.try_recv().is_ok() {}
        self.reset_timeline();
    }

    fn wrap(&mut self, samples: Arc<[f32]>) -> ScheduledBlock {
        let id = BlockId(self.next_id);
        self.next_id += 1;

        ScheduledBlock {
            id,
            samples,
            start_at: None,
        }
    }

    fn has_unscheduled(&self) -> bool {
        self.queue.iter().any(|b| b.start_at.is_none())
    }

    /// Chain one block onto the end of the running timeline
    fn push_scheduled(&mut self, mut block: ScheduledBlock) {
        self.schedule_at_cursor(&mut block);
        self.queue.push_back(block);
    }

    fn schedule_at_cursor(&mut self, block: &mut ScheduledBlock) {
        let at = self.start_time + self.timeline_cursor;
        self.output.schedule(
            block.samples.clone(),
            at,
            Completion::new(block.id, self.finished_tx.clone()),
        );
        block.start_at = Some(at);
        self.timeline_cursor += block.duration(self.sample_rate);
    }

    /// Schedule the whole queue back-to-back from the current output time.
    /// Blocks already sounding keep their slot and the rest chain after them.
    fn flush(&mut self) -> usize {
        if !self.is_playing {
            self.stats.starts += 1;
        }
        self.stats.flushes += 1;
        self.is_playing = true;

        let now = self.output.current_time();
        self.start_time = now;
        self.timeline_cursor = 0.0;

        let mut queue = std::mem::take(&mut self.queue);
        let mut count = 0;
        for block in queue.iter_mut() {
            if let Some(at) = block.start_at.filter(|&at| at <= now) {
                let end = at + block.duration(self.sample_rate);
                self.timeline_cursor = self.timeline_cursor.max(end - now);
                continue;
            }
            self.schedule_at_cursor(block);
            count += 1;
        }
        self.queue = queue;
        count
    }

    fn reset_timeline(&mut self) {
        self.is_playing = false;
        self.start_time = 0.0;
        self.timeline_cursor = 0.0;
    }
}

impl Drop for PlaybackBuffer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::output::SimulatedOutput;
    use proptest::prelude::*;

    const RATE: u32 = 1000;

    fn buffer(capacity: usize) -> (PlaybackBuffer, Arc<SimulatedOutput>) {
        let output = Arc::new(SimulatedOutput::new(RATE));
        let buffer = PlaybackBuffer::new("peer", output.clone(), capacity);
        (buffer, output)
    }

    fn chunk(len: usize) -> Vec<f32> {
        vec![0.1; len]
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn test_fill_then_flush() {
        let (mut buffer, output) = buffer(6);
        output.advance(1.0);

        for _ in 0..3 {
            assert_eq!(buffer.add_chunk(chunk(100)), Admission::Queued);
        }
        assert!(!buffer.is_playing());
        assert_eq!(buffer.len(), 3);
        assert!(output.schedule_log().is_empty());

        assert_eq!(buffer.add_chunk(chunk(100)), Admission::Flushed(4));
        assert!(buffer.is_playing());
        assert_eq!(buffer.len(), 4);

        let starts: Vec<f64> = output.schedule_log().iter().map(|(_, at)| *at).collect();
        assert_eq!(starts.len(), 4);
        for (i, at) in starts.iter().enumerate() {
            assert_close(*at, 1.0 + 0.1 * i as f64);
        }
    }

    #[test]
    fn test_playing_chunks_chain_gaplessly() {
        let (mut buffer, output) = buffer(6);

        for _ in 0..4 {
            buffer.add_chunk(chunk(100));
        }
        assert_eq!(buffer.add_chunk(chunk(50)), Admission::Scheduled);
        assert_eq!(buffer.add_chunk(chunk(200)), Admission::Scheduled);

        let starts: Vec<f64> = buffer.blocks().map(|b| b.start_at.unwrap()).collect();
        assert_close(starts[4], 0.4);
        assert_close(starts[5], 0.45);
        assert_eq!(output.active_blocks(), 6);
    }

    #[test]
    fn test_over_capacity_discards() {
        let (mut buffer, _output) = buffer(4);

        // 2 queued, third flushes, then fill to capacity + 1
        for _ in 0..5 {
            assert_ne!(buffer.add_chunk(chunk(10)), Admission::Discarded);
        }
        assert_eq!(buffer.len(), 5);

        assert_eq!(buffer.add_chunk(chunk(10)), Admission::Discarded);
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.stats().discarded, 1);
    }

    #[test]
    fn test_underrun_resets_to_fill_phase() {
        let (mut buffer, output) = buffer(6);

        for _ in 0..4 {
            buffer.add_chunk(chunk(100));
        }
        output.advance(0.5);
        assert_eq!(buffer.reap(), 4);

        assert_eq!(buffer.len(), 0);
        assert!(!buffer.is_playing());
        assert_eq!(buffer.stats().underruns, 1);

        assert_eq!(buffer.add_chunk(chunk(100)), Admission::Queued);
        assert!(!buffer.is_playing());
        assert_eq!(output.schedule_log().len(), 4);
    }

    #[test]
    fn test_partial_completion_keeps_playing() {
        let (mut buffer, output) = buffer(6);

        for _ in 0..4 {
            buffer.add_chunk(chunk(100));
        }
        output.advance(0.25);
        assert_eq!(buffer.reap(), 2);
        assert_eq!(buffer.len(), 2);
        assert!(buffer.is_playing());

        // Still chained after the last scheduled block
        assert_eq!(buffer.add_chunk(chunk(100)), Admission::Scheduled);
        let last = buffer.blocks().last().unwrap().start_at.unwrap();
        assert_close(last, 0.4);
    }

    #[test]
    fn test_output_is_gapless() {
        let (mut buffer, output) = buffer(4);

        buffer.add_chunk(vec![1.0; 10]);
        buffer.add_chunk(vec![2.0; 10]);
        buffer.add_chunk(vec![3.0; 10]);

        let mixed = output.advance_frames(30);
        assert!(mixed[..10].iter().all(|s| *s == 1.0));
        assert!(mixed[10..20].iter().all(|s| *s == 2.0));
        assert!(mixed[20..].iter().all(|s| *s == 3.0));
    }

    #[test]
    fn test_pause_lets_scheduled_blocks_finish() {
        let (mut buffer, output) = buffer(4);

        for _ in 0..3 {
            buffer.add_chunk(chunk(10));
        }
        buffer.pause();
        assert!(!buffer.is_playing());
        assert_eq!(output.active_blocks(), 3);

        output.advance_frames(30);
        assert_eq!(buffer.reap(), 3);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_flush_after_pause_keeps_sounding_block() {
        let (mut buffer, output) = buffer(4);

        for _ in 0..3 {
            buffer.add_chunk(chunk(10));
        }
        buffer.pause();
        output.advance_frames(5);

        // Block 0 is half played; only the blocks behind it move
        assert_eq!(buffer.add_chunk(chunk(10)), Admission::Flushed(3));

        let starts: Vec<f64> = buffer.blocks().map(|b| b.start_at.unwrap()).collect();
        assert_close(starts[0], 0.0);
        assert_close(starts[1], 0.01);
        assert_close(starts[2], 0.02);
        assert_close(starts[3], 0.03);

        let first = buffer.blocks().next().unwrap().id;
        let log = output.schedule_log();
        assert_eq!(log.iter().filter(|(id, _)| *id == first).count(), 1);

        // No overlap: each frame carries exactly one block
        let rendered = output.advance_frames(35);
        assert!(rendered.iter().all(|s| (s - 0.1).abs() < 1e-6));
    }

    #[test]
    fn test_play_during_fill_flushes_on_next_chunk() {
        let (mut buffer, output) = buffer(8);

        buffer.add_chunk(chunk(100));
        buffer.add_chunk(chunk(100));
        buffer.play();
        assert!(output.schedule_log().is_empty());

        assert_eq!(buffer.add_chunk(chunk(100)), Admission::Flushed(3));
        assert_eq!(buffer.stats().starts, 1);
        let starts: Vec<f64> = buffer.blocks().map(|b| b.start_at.unwrap()).collect();
        assert_close(starts[0], 0.0);
        assert_close(starts[2], 0.2);
    }

    #[test]
    fn test_stop_cancels_in_flight_blocks() {
        let (mut buffer, output) = buffer(4);

        for _ in 0..3 {
            buffer.add_chunk(chunk(10));
        }
        assert_eq!(output.active_blocks(), 3);

        buffer.stop();
        assert_eq!(output.active_blocks(), 0);
        assert!(buffer.is_empty());
        assert!(!buffer.is_playing());

        let mixed = output.advance_frames(30);
        assert!(mixed.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_drop_cancels_blocks() {
        let output = Arc::new(SimulatedOutput::new(RATE));
        {
            let mut buffer = PlaybackBuffer::new("peer", output.clone(), 2);
            buffer.add_chunk(chunk(10));
            buffer.add_chunk(chunk(10));
        }
        assert_eq!(output.active_blocks(), 0);
    }

    proptest! {
        #[test]
        fn prop_scheduled_starts_are_cumulative(sizes in prop::collection::vec(1usize..400, 1..40)) {
            let (mut buffer, _output) = buffer(64);

            let mut expected = Vec::new();
            let mut cursor = 0.0;
            for len in &sizes {
                match buffer.add_chunk(chunk(*len)) {
                    Admission::Discarded => {}
                    _ => {
                        expected.push(*len);
                    }
                }
            }

            if buffer.is_playing() {
                let blocks: Vec<_> = buffer.blocks().collect();
                prop_assert_eq!(blocks.len(), expected.len());
                for (block, len) in blocks.iter().zip(&expected) {
                    let at = block.start_at.unwrap();
                    prop_assert!((at - cursor).abs() < 1e-9);
                    cursor += *len as f64 / RATE as f64;
                }
            } else {
                prop_assert!(buffer.blocks().all(|b| b.start_at.is_none()));
            }
            prop_assert!(buffer.len() <= buffer.capacity() + 1);
        }
    }
}
