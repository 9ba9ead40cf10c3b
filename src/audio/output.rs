//! Output devices: a monotonic clock plus block scheduling
//!
//! Every peer gets its own output context. [`CpalOutput`] renders through a
//! real device on a dedicated thread; [`SimulatedOutput`] advances only when
//! told to, which makes playback timing deterministic.

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::{find_output_device, stream_config};
use crate::audio::mixer::{BlockId, Completion, Mixer};
use crate::error::AudioError;

/// Audio output with an absolute clock and scheduled playback
pub trait OutputDevice: Send + Sync {
    /// Sample rate the clock runs at
    fn sample_rate(&self) -> u32;

    /// Output clock in seconds
    fn current_time(&self) -> f64;

    /// Start `samples` at absolute clock time `at`; `completion` fires from the
    /// render path once the last sample has played. Scheduling an id that is
    /// already pending moves it.
    fn schedule(&self, samples: Arc<[f32]>, at: f64, completion: Completion);

    /// Stop a block immediately; its completion never fires
    fn cancel(&self, id: BlockId);
}

/// Opens one output context per peer
pub trait OutputFactory: Send + Sync {
    fn open(&self, peer: &str) -> Result<Arc<dyn OutputDevice>, AudioError>;
}

/// Output rendering through a cpal device
pub struct CpalOutput {
    label: String,
    mixer: Arc<Mixer>,
    running: Arc<AtomicBool>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CpalOutput {
    /// Open an output stream on the named device (or the default one)
    pub fn open(device_name: Option<&str>, sample_rate: u32, label: &str) -> Result<Self, AudioError> {
        let mixer = Arc::new(Mixer::new(sample_rate));
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let device_name = device_name.map(str::to_string);
        let mixer_for_stream = mixer.clone();
        let running_for_loop = running.clone();
        let thread_label = label.to_string();

        let handle = thread::Builder::new()
            .name(format!("playback-{}", label))
            .spawn(move || {
                let stream = find_output_device(device_name.as_deref()).and_then(|device| {
                    let config = stream_config(&device, sample_rate, false)?;
                    let channels = config.channels as usize;
                    let label = thread_label.clone();

                    let stream = device.build_output_stream(
                        &config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            mixer_for_stream.render(data, channels);
                        },
                        move |err| {
                            tracing::warn!("Output stream error for {}: {}", label, err);
                        },
                        None,
                    )?;
                    stream.play()?;
                    Ok(stream)
                });

                match stream {
                    Ok(_stream) => {
                        let _ = ready_tx.send(Ok(()));

                        // Keep the stream alive while running
                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .map_err(|_| AudioError::StreamError("output thread exited".to_string()))
            .and_then(|r| r);

        if let Err(e) = ready {
            running.store(false, Ordering::SeqCst);
            let _ = handle.join();
            return Err(e);
        }

        tracing::debug!("Opened output for {} at {} Hz", label, sample_rate);

        Ok(Self {
            label: label.to_string(),
            mixer,
            running,
            thread_handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop the stream thread
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.lock().take() {
            let _ = handle.join();
            tracing::debug!("Closed output for {}", self.label);
        }
    }
}

impl OutputDevice for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.mixer.sample_rate()
    }

    fn current_time(&self) -> f64 {
        self.mixer.current_time()
    }

    fn schedule(&self, samples: Arc<[f32]>, at: f64, completion: Completion) {
        self.mixer.schedule(samples, at, completion);
    }

    fn cancel(&self, id: BlockId) {
        self.mixer.cancel(id);
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Opens a [`CpalOutput`] per peer on one device
pub struct CpalOutputFactory {
    device: Option<String>,
    sample_rate: u32,
}

impl CpalOutputFactory {
    pub fn new(device: Option<String>, sample_rate: u32) -> Self {
        Self { device, sample_rate }
    }
}

impl OutputFactory for CpalOutputFactory {
    fn open(&self, peer: &str) -> Result<Arc<dyn OutputDevice>, AudioError> {
        let output = CpalOutput::open(self.device.as_deref(), self.sample_rate, peer)?;
        Ok(Arc::new(output))
    }
}

/// Output whose clock moves only through [`SimulatedOutput::advance`]
pub struct SimulatedOutput {
    mixer: Mixer,
    /// Every `(block, start)` pair passed to `schedule`, in call order
    schedule_log: Mutex<Vec<(BlockId, f64)>>,
}

impl SimulatedOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            mixer: Mixer::new(sample_rate),
            schedule_log: Mutex::new(Vec::new()),
        }
    }

    /// Render `seconds` of audio and return the mono mix
    pub fn advance(&self, seconds: f64) -> Vec<f32> {
        let frames = (seconds * self.mixer.sample_rate() as f64).round() as usize;
        self.advance_frames(frames)
    }

    /// Render exactly `frames` frames and return the mono mix
    pub fn advance_frames(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames];
        self.mixer.render(&mut out, 1);
        out
    }

    pub fn schedule_log(&self) -> Vec<(BlockId, f64)> {
        self.schedule_log.lock().clone()
    }

    pub fn active_blocks(&self) -> usize {
        self.mixer.active_blocks()
    }
}

impl OutputDevice for SimulatedOutput {
    fn sample_rate(&self) -> u32 {
        self.mixer.sample_rate()
    }

    fn current_time(&self) -> f64 {
        self.mixer.current_time()
    }

    fn schedule(&self, samples: Arc<[f32]>, at: f64, completion: Completion) {
        self.schedule_log.lock().push((completion.id(), at));
        self.mixer.schedule(samples, at, completion);
    }

    fn cancel(&self, id: BlockId) {
        self.mixer.cancel(id);
    }
}

/// Hands out [`SimulatedOutput`]s and keeps them reachable by peer id
pub struct SimulatedOutputFactory {
    sample_rate: u32,
    outputs: Mutex<HashMap<String, Arc<SimulatedOutput>>>,
}

impl SimulatedOutputFactory {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            outputs: Mutex::new(HashMap::new()),
        }
    }

    /// Output most recently opened for `peer`
    pub fn output(&self, peer: &str) -> Option<Arc<SimulatedOutput>> {
        self.outputs.lock().get(peer).cloned()
    }

    /// Number of outputs opened so far
    pub fn opened(&self) -> usize {
        self.outputs.lock().len()
    }

    /// Advance every output's clock by the same amount
    pub fn advance_all(&self, seconds: f64) {
        let outputs: Vec<_> = self.outputs.lock().values().cloned().collect();
        for output in outputs {
            output.advance(seconds);
        }
    }
}

impl OutputFactory for SimulatedOutputFactory {
    fn open(&self, peer: &str) -> Result<Arc<dyn OutputDevice>, AudioError> {
        let output = Arc::new(SimulatedOutput::new(self.sample_rate));
        self.outputs.lock().insert(peer.to_string(), output.clone());
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_simulated_clock_advances() {
        let output = SimulatedOutput::new(1000);
        assert_eq!(output.current_time(), 0.0);

        output.advance(0.25);
        assert!((output.current_time() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_simulated_schedule_is_logged() {
        let output = SimulatedOutput::new(1000);
        let (tx, rx) = unbounded();

        output.schedule(Arc::from(vec![0.5; 100]), 0.1, Completion::new(BlockId(9), tx));
        assert_eq!(output.schedule_log(), vec![(BlockId(9), 0.1)]);

        let mixed = output.advance(0.15);
        assert_eq!(mixed[99], 0.0);
        assert_eq!(mixed[100], 0.5);
        assert!(rx.try_recv().is_err());

        output.advance(0.1);
        assert_eq!(rx.try_recv().unwrap(), BlockId(9));
    }

    #[test]
    fn test_factory_tracks_outputs() {
        let factory = SimulatedOutputFactory::new(48000);
        factory.open("alice").unwrap();
        factory.open("bob").unwrap();
        assert_eq!(factory.opened(), 2);

        factory.advance_all(0.5);
        let alice = factory.output("alice").unwrap();
        assert!((alice.current_time() - 0.5).abs() < 1e-9);
    }
}
