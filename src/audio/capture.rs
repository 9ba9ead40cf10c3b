//! Microphone capture sliced into fixed-size frames
//!
//! The device callback hands over blocks of whatever size the host picks.
//! A [`Framer`] re-slices them into exactly `buffer_size` mono samples and a
//! [`FrameProcessor`] pushes each frame to a [`FrameSink`]. When the sink
//! reports the transport gone, the processor disconnects for the rest of the
//! capture; it never retries or buffers locally.

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::{find_input_device, stream_config};
use crate::error::{AudioError, NetworkError};

/// One outbound frame
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFrame {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

/// Destination for captured frames
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: CaptureFrame) -> Result<(), NetworkError>;
}

impl<F> FrameSink for F
where
    F: Fn(CaptureFrame) -> Result<(), NetworkError> + Send + Sync,
{
    fn send_frame(&self, frame: CaptureFrame) -> Result<(), NetworkError> {
        self(frame)
    }
}

/// Re-slices interleaved input into fixed-length mono frames
pub struct Framer {
    frame_size: usize,
    pending: Vec<f32>,
}

impl Framer {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size * 2),
        }
    }

    /// Append interleaved samples, keeping channel 0
    pub fn push(&mut self, data: &[f32], channels: usize) {
        if channels <= 1 {
            self.pending.extend_from_slice(data);
        } else {
            self.pending.extend(data.iter().step_by(channels).copied());
        }
    }

    /// Take the next complete frame, if one is ready
    pub fn next_frame(&mut self) -> Option<Vec<f32>> {
        if self.pending.len() < self.frame_size {
            return None;
        }
        Some(self.pending.drain(..self.frame_size).collect())
    }

    /// Samples waiting for a full frame
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Runs inside the device callback: frames input and forwards it to the sink
pub struct FrameProcessor {
    framer: Framer,
    sample_rate: u32,
    sink: Arc<dyn FrameSink>,
    connected: Arc<AtomicBool>,
    frames_sent: Arc<AtomicU64>,
}

impl FrameProcessor {
    pub fn new(sample_rate: u32, buffer_size: usize, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            framer: Framer::new(buffer_size),
            sample_rate,
            sink,
            connected: Arc::new(AtomicBool::new(true)),
            frames_sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Feed one device callback's worth of interleaved samples
    pub fn process(&mut self, data: &[f32], channels: usize) {
        if !self.connected.load(Ordering::Relaxed) {
            return;
        }

        self.framer.push(data, channels);

        while let Some(samples) = self.framer.next_frame() {
            let frame = CaptureFrame {
                sample_rate: self.sample_rate,
                samples,
            };

            if let Err(e) = self.sink.send_frame(frame) {
                tracing::warn!("Capture processor disconnected: {}", e);
                self.connected.store(false, Ordering::Relaxed);
                self.framer.clear();
                return;
            }

            self.frames_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Shared flag that drops to false once the sink fails
    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    pub fn frames_counter(&self) -> Arc<AtomicU64> {
        self.frames_sent.clone()
    }
}

/// A running capture stream; stops when dropped
pub trait CaptureStream: Send {
    fn stop(&mut self);
}

/// Something that can open a microphone and drive a [`FrameProcessor`]
pub trait MicSource: Send + Sync {
    fn open(&self, processor: FrameProcessor) -> Result<Box<dyn CaptureStream>, AudioError>;
}

/// Microphone input through cpal
pub struct CpalMicrophone {
    device: Option<String>,
    sample_rate: u32,
}

impl CpalMicrophone {
    pub fn new(device: Option<String>, sample_rate: u32) -> Self {
        Self { device, sample_rate }
    }
}

impl MicSource for CpalMicrophone {
    fn open(&self, mut processor: FrameProcessor) -> Result<Box<dyn CaptureStream>, AudioError> {
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let device_name = self.device.clone();
        let sample_rate = self.sample_rate;

        let handle = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let stream = find_input_device(device_name.as_deref()).and_then(|device| {
                    let config = stream_config(&device, sample_rate, true)?;
                    let channels = config.channels as usize;

                    let stream = device.build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            processor.process(data, channels);
                        },
                        move |err| {
                            tracing::warn!("Input stream error: {}", err);
                        },
                        None,
                    )?;
                    stream.play()?;
                    Ok(stream)
                });

                match stream {
                    Ok(_stream) => {
                        let _ = ready_tx.send(Ok(()));

                        // Keep thread alive while running
                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }

                        // Stream is dropped here, stopping capture
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .map_err(|_| AudioError::DeviceUnavailable("capture thread exited".to_string()))
            .and_then(|r| r);

        let mut stream = CpalCaptureStream {
            running,
            thread_handle: Some(handle),
        };

        match ready {
            Ok(()) => Ok(Box::new(stream)),
            Err(e) => {
                stream.stop();
                Err(e)
            }
        }
    }
}

struct CpalCaptureStream {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CaptureStream for CpalCaptureStream {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalCaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Capture state
pub enum CaptureState {
    Idle,
    Capturing(ActiveCapture),
}

/// An open microphone stream and its processor's status
pub struct ActiveCapture {
    stream: Box<dyn CaptureStream>,
    connected: Arc<AtomicBool>,
    frames_sent: Arc<AtomicU64>,
}

/// Toggleable microphone capture feeding a frame sink
pub struct CapturePipeline {
    source: Arc<dyn MicSource>,
    sample_rate: u32,
    buffer_size: usize,
    state: CaptureState,
}

impl CapturePipeline {
    pub fn new(source: Arc<dyn MicSource>, sample_rate: u32, buffer_size: usize) -> Self {
        Self {
            source,
            sample_rate,
            buffer_size,
            state: CaptureState::Idle,
        }
    }

    /// Start capturing into `sink`. Does nothing if already capturing.
    pub fn enable(&mut self, sink: Arc<dyn FrameSink>) -> Result<(), AudioError> {
        if self.is_enabled() {
            return Ok(());
        }

        let processor = FrameProcessor::new(self.sample_rate, self.buffer_size, sink);
        let connected = processor.connected_flag();
        let frames_sent = processor.frames_counter();
        let stream = self.source.open(processor)?;

        tracing::info!(
            "Capture started: {} Hz, {} samples/frame",
            self.sample_rate,
            self.buffer_size
        );

        self.state = CaptureState::Capturing(ActiveCapture {
            stream,
            connected,
            frames_sent,
        });
        Ok(())
    }

    /// Stop capturing. Does nothing if idle.
    pub fn disable(&mut self) {
        if let CaptureState::Capturing(mut active) = std::mem::replace(&mut self.state, CaptureState::Idle) {
            active.stream.stop();
            tracing::info!(
                "Capture stopped after {} frames",
                active.frames_sent.load(Ordering::Relaxed)
            );
        }
    }

    /// Whether a capture stream exists
    pub fn is_enabled(&self) -> bool {
        matches!(self.state, CaptureState::Capturing(_))
    }

    /// Whether frames are still flowing to the sink
    pub fn is_processing(&self) -> bool {
        match &self.state {
            CaptureState::Capturing(active) => active.connected.load(Ordering::Relaxed),
            CaptureState::Idle => false,
        }
    }

    pub fn frames_sent(&self) -> u64 {
        match &self.state {
            CaptureState::Capturing(active) => active.frames_sent.load(Ordering::Relaxed),
            CaptureState::Idle => 0,
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.disable();
    }
}
