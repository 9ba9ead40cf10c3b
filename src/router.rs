//! Per-peer routing of inbound voice chunks
//!
//! One [`PlaybackBuffer`] per peer, created on the peer's first chunk with its
//! own output context. Each buffer sits behind its own mutex so peers never
//! wait on each other.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::audio::output::OutputFactory;
use crate::audio::playback::{Admission, PlaybackBuffer, PlaybackStats};
use crate::config::PlaybackConfig;
use crate::error::{AudioError, ConfigError};

struct PeerSlot {
    buffer: Mutex<PlaybackBuffer>,
    rate_warned: AtomicBool,
}

/// Snapshot of one peer's buffer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerStatus {
    pub peer: String,
    pub queued: usize,
    pub is_playing: bool,
    pub stats: PlaybackStats,
}

/// Maps peer ids to playback buffers
pub struct StreamRouter {
    config: PlaybackConfig,
    outputs: Arc<dyn OutputFactory>,
    peers: DashMap<String, Arc<PeerSlot>>,
}

impl StreamRouter {
    /// Create a router; rejects a trigger threshold that is not below capacity
    pub fn new(config: PlaybackConfig, outputs: Arc<dyn OutputFactory>) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            config,
            outputs,
            peers: DashMap::new(),
        })
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    /// Route one chunk to `peer`'s buffer, creating it on first use
    pub fn add_chunk(
        &self,
        peer: &str,
        samples: Vec<f32>,
        sample_rate: u32,
    ) -> Result<Admission, AudioError> {
        if samples.is_empty() {
            tracing::trace!("Ignoring empty chunk from {}", peer);
            return Ok(Admission::Discarded);
        }

        let slot = self.slot(peer)?;
        let mut buffer = slot.buffer.lock();

        if sample_rate != buffer.sample_rate() && !slot.rate_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "Peer {} sends {} Hz audio, output runs at {} Hz; playing without resampling",
                peer,
                sample_rate,
                buffer.sample_rate()
            );
        }

        let admission = buffer.add_chunk(samples);

        if buffer.len() > self.config.trigger_buffer_length && !buffer.is_playing() {
            tracing::debug!("Trigger reached for {}, starting playback", peer);
            buffer.play();
        }

        Ok(admission)
    }

    /// Tear down a peer's buffer, cancelling its in-flight audio
    pub fn remove_peer(&self, peer: &str) -> bool {
        match self.peers.remove(peer) {
            Some((_, slot)) => {
                slot.buffer.lock().stop();
                tracing::info!("Removed playback buffer for {}", peer);
                true
            }
            None => false,
        }
    }

    /// Tear down every peer
    pub fn clear(&self) {
        for peer in self.peers() {
            self.remove_peer(&peer);
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.peers.contains_key(peer)
    }

    /// Ids of every peer with a buffer, sorted
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        peers.sort();
        peers
    }

    /// Current state of one peer, after applying finished blocks
    pub fn status(&self, peer: &str) -> Option<PeerStatus> {
        self.with_buffer(peer, |buffer| {
            buffer.reap();
            PeerStatus {
                peer: peer.to_string(),
                queued: buffer.len(),
                is_playing: buffer.is_playing(),
                stats: buffer.stats(),
            }
        })
    }

    /// Status of every peer
    pub fn statuses(&self) -> Vec<PeerStatus> {
        self.peers()
            .iter()
            .filter_map(|peer| self.status(peer))
            .collect()
    }

    /// Run `f` with exclusive access to a peer's buffer
    pub fn with_buffer<R>(&self, peer: &str, f: impl FnOnce(&mut PlaybackBuffer) -> R) -> Option<R> {
        let slot = self.peers.get(peer).map(|e| e.value().clone())?;
        let mut buffer = slot.buffer.lock();
        Some(f(&mut buffer))
    }

    /// Create the peer's buffer and open its output if it has none yet.
    ///
    /// Opening a device output can block until the stream starts, so async
    /// callers run this on a blocking thread before routing the first chunk.
    pub fn ensure_peer(&self, peer: &str) -> Result<(), AudioError> {
        self.slot(peer).map(|_| ())
    }

    fn slot(&self, peer: &str) -> Result<Arc<PeerSlot>, AudioError> {
        if let Some(slot) = self.peers.get(peer) {
            return Ok(slot.value().clone());
        }

        // Open the output outside the map lock; a racing insert wins
        let output = self.outputs.open(peer)?;
        let buffer = PlaybackBuffer::new(peer, output, self.config.max_buffer_length);

        let mut spare = None;
        let slot = match self.peers.entry(peer.to_string()) {
            Entry::Occupied(entry) => {
                spare = Some(buffer);
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let slot = Arc::new(PeerSlot {
                    buffer: Mutex::new(buffer),
                    rate_warned: AtomicBool::new(false),
                });
                entry.insert(slot.clone());
                slot
            }
        };

        match spare {
            // Dropped here, after the shard lock is released
            Some(buffer) => {
                tracing::debug!("Buffer for {} created concurrently, discarding ours", peer);
                drop(buffer);
            }
            None => tracing::info!("Created playback buffer for {}", peer),
        }

        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::output::{OutputDevice, SimulatedOutputFactory};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Weak;

    const RATE: u32 = 1000;

    fn router(max: usize, trigger: usize) -> (StreamRouter, Arc<SimulatedOutputFactory>) {
        let factory = Arc::new(SimulatedOutputFactory::new(RATE));
        let config = PlaybackConfig {
            max_buffer_length: max,
            trigger_buffer_length: trigger,
            teardown_on_leave: true,
        };
        let router = StreamRouter::new(config, factory.clone()).unwrap();
        (router, factory)
    }

    #[test]
    fn test_reversed_thresholds_rejected() {
        let factory = Arc::new(SimulatedOutputFactory::new(RATE));
        let config = PlaybackConfig {
            max_buffer_length: 12,
            trigger_buffer_length: 16,
            teardown_on_leave: true,
        };

        let result = StreamRouter::new(config, factory.clone());
        assert!(matches!(result, Err(ConfigError::TriggerNotBelowCapacity { .. })));
        assert_eq!(factory.opened(), 0);
    }

    #[test]
    fn test_buffers_created_lazily_per_peer() {
        let (router, factory) = router(16, 12);
        assert_eq!(router.peer_count(), 0);

        router.add_chunk("alice", vec![0.0; 10], RATE).unwrap();
        router.add_chunk("alice", vec![0.0; 10], RATE).unwrap();
        router.add_chunk("bob", vec![0.0; 10], RATE).unwrap();

        assert_eq!(router.peer_count(), 2);
        assert_eq!(router.peers(), vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(factory.opened(), 2);
        assert_eq!(router.status("alice").unwrap().queued, 2);
        assert_eq!(router.status("bob").unwrap().queued, 1);
    }

    #[test]
    fn test_default_thresholds_start_once() {
        let (router, _factory) = router(16, 12);

        for _ in 0..13 {
            router.add_chunk("alice", vec![0.0; 10], RATE).unwrap();
        }

        let status = router.status("alice").unwrap();
        assert!(status.is_playing);
        assert_eq!(status.queued, 13);
        assert_eq!(status.stats.starts, 1);
    }

    #[test]
    fn test_trigger_calls_play_once() {
        let (router, factory) = router(8, 2);

        router.add_chunk("alice", vec![0.0; 10], RATE).unwrap();
        router.add_chunk("alice", vec![0.0; 10], RATE).unwrap();
        assert!(!router.status("alice").unwrap().is_playing);

        // Third chunk exceeds the trigger while still filling
        assert_eq!(router.add_chunk("alice", vec![0.0; 10], RATE).unwrap(), Admission::Queued);
        let status = router.status("alice").unwrap();
        assert!(status.is_playing);
        assert_eq!(status.stats.starts, 1);
        assert!(factory.output("alice").unwrap().schedule_log().is_empty());

        assert_eq!(router.add_chunk("alice", vec![0.0; 10], RATE).unwrap(), Admission::Flushed(4));
        router.add_chunk("alice", vec![0.0; 10], RATE).unwrap();
        assert_eq!(router.status("alice").unwrap().stats.starts, 1);
    }

    #[test]
    fn test_empty_chunks_ignored() {
        let (router, factory) = router(16, 12);

        assert_eq!(router.add_chunk("alice", Vec::new(), RATE).unwrap(), Admission::Discarded);
        assert_eq!(router.peer_count(), 0);
        assert_eq!(factory.opened(), 0);
    }

    #[test]
    fn test_mismatched_rate_still_admitted() {
        let (router, _factory) = router(16, 12);

        assert_eq!(router.add_chunk("alice", vec![0.0; 10], 44100).unwrap(), Admission::Queued);
        assert_eq!(router.status("alice").unwrap().queued, 1);
    }

    #[test]
    fn test_remove_peer_cancels_audio() {
        let (router, factory) = router(4, 1);

        for _ in 0..3 {
            router.add_chunk("alice", vec![1.0; 10], RATE).unwrap();
        }
        let output = factory.output("alice").unwrap();
        assert!(output.active_blocks() > 0);

        assert!(router.remove_peer("alice"));
        assert!(!router.contains("alice"));
        assert_eq!(output.active_blocks(), 0);
        assert!(!router.remove_peer("alice"));
    }

    #[test]
    fn test_clear_removes_everyone() {
        let (router, _factory) = router(16, 12);
        router.add_chunk("alice", vec![0.0; 10], RATE).unwrap();
        router.add_chunk("bob", vec![0.0; 10], RATE).unwrap();

        router.clear();
        assert_eq!(router.peer_count(), 0);
        assert!(router.statuses().is_empty());
    }

    #[test]
    fn test_status_reflects_completed_blocks() {
        let (router, factory) = router(4, 1);

        router.add_chunk("alice", vec![0.0; 100], RATE).unwrap();
        router.add_chunk("alice", vec![0.0; 100], RATE).unwrap();
        router.add_chunk("alice", vec![0.0; 100], RATE).unwrap();

        factory.advance_all(1.0);
        let status = router.status("alice").unwrap();
        assert_eq!(status.queued, 0);
        assert!(!status.is_playing);
        assert_eq!(status.stats.underruns, 1);
    }

    #[test]
    fn test_ensure_peer_opens_once() {
        let (router, factory) = router(16, 12);

        router.ensure_peer("alice").unwrap();
        router.ensure_peer("alice").unwrap();
        router.add_chunk("alice", vec![0.0; 10], RATE).unwrap();

        assert_eq!(factory.opened(), 1);
        assert_eq!(router.status("alice").unwrap().queued, 1);
    }

    /// Creates the peer from inside its first `open`, like a second thread
    /// winning the insert
    struct RacingFactory {
        inner: SimulatedOutputFactory,
        router: Mutex<Option<Weak<StreamRouter>>>,
        opens: AtomicUsize,
    }

    impl OutputFactory for RacingFactory {
        fn open(&self, peer: &str) -> Result<Arc<dyn OutputDevice>, AudioError> {
            if self.opens.fetch_add(1, Ordering::SeqCst) == 0 {
                let router = self.router.lock().as_ref().and_then(Weak::upgrade);
                if let Some(router) = router {
                    router.ensure_peer(peer)?;
                }
            }
            self.inner.open(peer)
        }
    }

    #[test]
    fn test_racing_insert_keeps_one_buffer() {
        let factory = Arc::new(RacingFactory {
            inner: SimulatedOutputFactory::new(RATE),
            router: Mutex::new(None),
            opens: AtomicUsize::new(0),
        });
        let router = Arc::new(StreamRouter::new(PlaybackConfig::default(), factory.clone()).unwrap());
        *factory.router.lock() = Some(Arc::downgrade(&router));

        router.add_chunk("alice", vec![0.0; 10], RATE).unwrap();
        router.add_chunk("alice", vec![0.0; 10], RATE).unwrap();

        assert_eq!(factory.opens.load(Ordering::SeqCst), 2);
        assert_eq!(router.peer_count(), 1);
        assert_eq!(router.status("alice").unwrap().queued, 2);
    }
}
