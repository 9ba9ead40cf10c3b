//! Audio subsystem module

pub mod capture;
pub mod device;
pub mod mixer;
pub mod output;
pub mod playback;

pub use capture::{CaptureFrame, CapturePipeline, CpalMicrophone, FrameSink, MicSource};
pub use device::{list_devices, AudioDeviceInfo};
pub use mixer::{BlockId, Completion};
pub use output::{CpalOutputFactory, OutputDevice, OutputFactory, SimulatedOutput, SimulatedOutputFactory};
pub use playback::{Admission, PlaybackBuffer, PlaybackStats};
