//! Contract consumed from the audio-to-face inference engine
//!
//! The server drives the engine exclusively through the traits in this
//! module: a bundle groups an executor, its per-track accumulators, and the
//! device stream they share. Results are delivered as device-memory views
//! that the server stages into pinned host memory and reads only after a
//! stream synchronize. The `reference` module provides a deterministic CPU
//! implementation of the same contract.

pub mod reference;

use std::cell::Cell;
use std::fmt;

use thiserror::Error;

pub use reference::{read_diffusion_bundle, read_regression_bundle, ModelDescriptor};

/// Failure from an engine operation. The message mirrors the engine's own
/// diagnostic; callers add the operation context.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct EngineError(String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Where an executor materializes its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultsType {
    Host,
    Device,
}

/// Output surfaces produced by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionOption {
    None,
    Skin,
    Tongue,
    #[default]
    SkinTongue,
}

impl ExecutionOption {
    /// Case-insensitive parse of the CLI and protocol spelling.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "none" => Some(ExecutionOption::None),
            "skin" => Some(ExecutionOption::Skin),
            "tongue" => Some(ExecutionOption::Tongue),
            "skintongue" => Some(ExecutionOption::SkinTongue),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOption::None => "None",
            ExecutionOption::Skin => "Skin",
            ExecutionOption::Tongue => "Tongue",
            ExecutionOption::SkinTongue => "SkinTongue",
        }
    }
}

impl fmt::Display for ExecutionOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// View of a weight vector in device memory.
///
/// Opaque on the host: only the length is observable, and the contents are
/// reachable solely through `DeviceStream::copy_to_host`.
#[derive(Debug, Clone, Copy)]
pub struct DeviceView<'a> {
    data: &'a [f32],
}

impl<'a> DeviceView<'a> {
    pub fn new(data: &'a [f32]) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(in crate::engine) fn data(&self) -> &'a [f32] {
        self.data
    }
}

/// Results delivered by the executor for one produced frame.
pub struct DeviceResults<'a> {
    pub track_index: usize,
    pub weights: DeviceView<'a>,
    pub stream: &'a dyn DeviceStream,
    pub ts_current: i64,
    pub ts_next: i64,
}

/// Receiver for device results, handed to `execute` by the caller.
///
/// Results arrive synchronously during `execute`; returning `false` cancels
/// delivery for the rest of the call and stops the executor from producing
/// further results until it is reset.
pub trait DeviceResultSink {
    fn on_device_results(&mut self, results: &DeviceResults<'_>) -> bool;
}

/// Asynchronous device work queue owned by a bundle.
pub trait DeviceStream: Send + Sync {
    /// Enqueue a device-to-host copy. The destination must not be read
    /// until `synchronize` returns.
    fn copy_to_host(&self, src: &DeviceView<'_>, dst: &mut [f32]) -> EngineResult<()>;

    /// Block until all enqueued work has completed.
    fn synchronize(&self) -> EngineResult<()>;
}

/// Blendshape pose-name table for one output surface.
pub trait BlendshapeSolver {
    fn pose_count(&self) -> usize;
    fn pose_name(&self, index: usize) -> &str;
}

/// Executor capabilities the server consumes. Only track 0 is used.
pub trait BlendshapeExecutor: Send {
    fn results_type(&self) -> ResultsType;
    fn sampling_rate(&self) -> usize;
    fn frame_rate(&self) -> (usize, usize);
    fn weight_count(&self) -> usize;

    /// Block until in-flight work for `track` has drained.
    fn wait(&mut self, track: usize) -> EngineResult<()>;

    fn reset(&mut self, track: usize) -> EngineResult<()>;

    /// Number of tracks with enough accumulated input for another step.
    fn ready_tracks(&self) -> usize;

    /// Run one execution step. Produced results are delivered synchronously
    /// through `sink`; a single step may deliver many frames.
    fn execute(&mut self, sink: &mut dyn DeviceResultSink) -> EngineResult<()>;

    fn next_audio_sample_to_read(&self, track: usize) -> usize;
    fn next_emotion_timestamp_to_read(&self, track: usize) -> i64;

    fn skin_solver(&self) -> Option<&dyn BlendshapeSolver>;
    fn tongue_solver(&self) -> Option<&dyn BlendshapeSolver>;
}

/// Per-track sink for audio samples.
///
/// `accumulated_samples` counts everything pushed since the last reset and
/// is not reduced by `drop_samples_before`, which only releases resident
/// memory.
pub trait AudioAccumulator: Send {
    fn accumulate(&mut self, samples: &[f32]) -> EngineResult<()>;
    fn accumulated_samples(&self) -> usize;
    fn reset(&mut self) -> EngineResult<()>;
    fn drop_samples_before(&mut self, sample_index: usize) -> EngineResult<()>;
}

/// Per-track sink for timestamped emotion vectors.
pub trait EmotionAccumulator: Send {
    fn emotion_size(&self) -> usize;
    fn accumulate(&mut self, timestamp: i64, values: &[f32]) -> EngineResult<()>;

    /// Mark the lane complete so the executor is free to consume audio.
    fn close(&mut self) -> EngineResult<()>;

    fn reset(&mut self) -> EngineResult<()>;
    fn drop_emotions_before(&mut self, timestamp: i64) -> EngineResult<()>;
}

/// One model instance: an executor plus its accumulators and the device
/// stream they share. Accumulators capture the bundle's stream at
/// construction, so call sites do not pass stream handles around.
pub trait ExecutorBundle: Send {
    fn executor(&self) -> &dyn BlendshapeExecutor;
    fn executor_mut(&mut self) -> &mut dyn BlendshapeExecutor;
    fn audio_accumulator_mut(&mut self, track: usize) -> &mut dyn AudioAccumulator;
    fn emotion_accumulator_mut(&mut self, track: usize) -> &mut dyn EmotionAccumulator;
    fn stream(&self) -> &dyn DeviceStream;
}

/// Pinned host staging memory for device-to-host copies, addressed as
/// fixed-width slots.
pub struct HostPinnedTensor {
    data: Vec<f32>,
}

impl HostPinnedTensor {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn slot(&self, slot: usize, width: usize) -> &[f32] {
        &self.data[slot * width..(slot + 1) * width]
    }

    pub fn slot_mut(&mut self, slot: usize, width: usize) -> &mut [f32] {
        &mut self.data[slot * width..(slot + 1) * width]
    }
}

/// Allocate pinned host staging memory. The CPU backend uses ordinary heap
/// memory; a GPU backend would page-lock it here.
pub fn create_host_pinned_tensor(len: usize) -> EngineResult<HostPinnedTensor> {
    Ok(HostPinnedTensor {
        data: vec![0.0; len],
    })
}

thread_local! {
    static ACTIVE_DEVICE: Cell<Option<i32>> = const { Cell::new(None) };
}

/// Assert the accelerator for the calling thread.
///
/// Device selection is thread-local, so every entry point that touches
/// device state calls this before any other engine operation. The CPU
/// backend has no device runtime to bind; a GPU backend performs the
/// `cudaSetDevice` here.
pub fn set_cuda_device_if_needed(device: i32) -> EngineResult<()> {
    ACTIVE_DEVICE.with(|active| {
        if active.get() != Some(device) {
            active.set(Some(device));
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_option_parse_is_case_insensitive() {
        assert_eq!(ExecutionOption::parse("SkinTongue"), Some(ExecutionOption::SkinTongue));
        assert_eq!(ExecutionOption::parse("skintongue"), Some(ExecutionOption::SkinTongue));
        assert_eq!(ExecutionOption::parse("SKIN"), Some(ExecutionOption::Skin));
        assert_eq!(ExecutionOption::parse("Tongue"), Some(ExecutionOption::Tongue));
        assert_eq!(ExecutionOption::parse("none"), Some(ExecutionOption::None));
        assert_eq!(ExecutionOption::parse("jaw"), None);
    }

    #[test]
    fn test_staging_tensor_slots_are_disjoint() {
        let mut tensor = create_host_pinned_tensor(12).unwrap();
        tensor.slot_mut(1, 4).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(tensor.slot(0, 4), &[0.0; 4]);
        assert_eq!(tensor.slot(1, 4), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(tensor.slot(2, 4), &[0.0; 4]);
    }

    #[test]
    fn test_device_view_hides_contents() {
        let data = [0.5f32; 8];
        let view = DeviceView::new(&data);
        assert_eq!(view.len(), 8);
        assert!(!view.is_empty());
    }
}
