//! Deterministic CPU reference engine
//!
//! Stands in for the GPU inference engine behind the `engine` contract so
//! the server runs and can be exercised without vendor hardware. Frame
//! pacing follows the audio clock exactly like the real executor: frame `f`
//! covers samples `[f*rate*den/num, (f+1)*rate*den/num)` and becomes ready
//! once the emotion lane is closed and that span has been accumulated.
//! Each execute step emits a single frame, leaving the rest of the backlog
//! ready for subsequent steps. Weights are deterministic functions of the
//! frame index, and timestamps are nanoseconds derived from the frame rate.

use std::sync::{Arc, Mutex};

use serde::Deserialize;

use super::{
    AudioAccumulator, BlendshapeExecutor, BlendshapeSolver, DeviceResultSink, DeviceResults,
    DeviceStream, DeviceView, EmotionAccumulator, EngineError, EngineResult, ExecutionOption,
    ExecutorBundle, ResultsType,
};

/// Model descriptor consumed by the reference backend.
///
/// The GPU engine reads a full network description from `model.json`; the
/// reference backend needs only the stream-facing facts.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelDescriptor {
    pub sampling_rate: usize,
    #[serde(default = "default_emotion_size")]
    pub emotion_size: usize,
    #[serde(default)]
    pub skin_channels: Vec<String>,
    #[serde(default)]
    pub tongue_channels: Vec<String>,
}

fn default_emotion_size() -> usize {
    10
}

impl ModelDescriptor {
    pub fn from_file(path: &str) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| EngineError::new(format!("failed to read model descriptor {path}: {err}")))?;
        serde_json::from_str(&raw)
            .map_err(|err| EngineError::new(format!("failed to parse model descriptor {path}: {err}")))
    }
}

/// Which model family a bundle emulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineVariant {
    Regression,
    Diffusion { identity: usize, constant_noise: bool },
}

/// Diffusion checkpoints run at a fixed rate; regression takes the rate
/// from the caller.
const DIFFUSION_FPS: (usize, usize) = (30, 1);

/// Construct a regression bundle from a model descriptor file.
pub fn read_regression_bundle(
    track_count: usize,
    model_json_path: &str,
    execution_option: ExecutionOption,
    use_gpu_solver: bool,
    fps_numerator: usize,
    fps_denominator: usize,
) -> EngineResult<Box<dyn ExecutorBundle>> {
    if !use_gpu_solver {
        return Err(EngineError::new("CPU blendshape solve is not available in this build"));
    }
    let descriptor = ModelDescriptor::from_file(model_json_path)?;
    bundle_from_descriptor(
        track_count,
        descriptor,
        execution_option,
        fps_numerator,
        fps_denominator,
        EngineVariant::Regression,
    )
}

/// Construct a diffusion bundle from a model descriptor file.
pub fn read_diffusion_bundle(
    track_count: usize,
    model_json_path: &str,
    execution_option: ExecutionOption,
    use_gpu_solver: bool,
    identity: usize,
    constant_noise: bool,
) -> EngineResult<Box<dyn ExecutorBundle>> {
    if !use_gpu_solver {
        return Err(EngineError::new("CPU blendshape solve is not available in this build"));
    }
    let descriptor = ModelDescriptor::from_file(model_json_path)?;
    bundle_from_descriptor(
        track_count,
        descriptor,
        execution_option,
        DIFFUSION_FPS.0,
        DIFFUSION_FPS.1,
        EngineVariant::Diffusion {
            identity,
            constant_noise,
        },
    )
}

/// Build a bundle directly from an in-memory descriptor. The file-reading
/// entry points are thin wrappers over this.
pub fn bundle_from_descriptor(
    track_count: usize,
    descriptor: ModelDescriptor,
    execution_option: ExecutionOption,
    fps_numerator: usize,
    fps_denominator: usize,
    variant: EngineVariant,
) -> EngineResult<Box<dyn ExecutorBundle>> {
    if track_count != 1 {
        return Err(EngineError::new(format!(
            "reference engine supports a single track, got {track_count}"
        )));
    }
    if descriptor.sampling_rate == 0 {
        return Err(EngineError::new("model descriptor has a zero sampling rate"));
    }
    if fps_numerator == 0 || fps_denominator == 0 {
        return Err(EngineError::new("frame rate must be positive"));
    }

    let skin = match execution_option {
        ExecutionOption::Skin | ExecutionOption::SkinTongue => Some(ReferenceSolver {
            names: descriptor.skin_channels.clone(),
        }),
        _ => None,
    };
    let tongue = match execution_option {
        ExecutionOption::Tongue | ExecutionOption::SkinTongue => Some(ReferenceSolver {
            names: descriptor.tongue_channels.clone(),
        }),
        _ => None,
    };
    let weight_count = skin.as_ref().map_or(0, |s| s.names.len())
        + tongue.as_ref().map_or(0, |s| s.names.len());

    let state = Arc::new(Mutex::new(TrackState::new(descriptor.emotion_size)));
    let stream = Arc::new(ReferenceStream);

    Ok(Box::new(ReferenceBundle {
        executor: ReferenceExecutor {
            state: Arc::clone(&state),
            stream: Arc::clone(&stream),
            sampling_rate: descriptor.sampling_rate,
            fps_numerator,
            fps_denominator,
            weight_count,
            variant,
            skin,
            tongue,
        },
        audio: ReferenceAudioAccumulator {
            state: Arc::clone(&state),
        },
        emotion: ReferenceEmotionAccumulator { state },
        stream,
    }))
}

/// Mutable per-track state shared by the executor and its accumulators.
struct TrackState {
    audio_resident: Vec<f32>,
    audio_dropped: usize,
    emotion_size: usize,
    emotions: Vec<(i64, Vec<f32>)>,
    emotion_closed: bool,
    next_frame: u64,
    primed: bool,
    cancelled: bool,
}

impl TrackState {
    fn new(emotion_size: usize) -> Self {
        Self {
            audio_resident: Vec::new(),
            audio_dropped: 0,
            emotion_size,
            emotions: Vec::new(),
            emotion_closed: false,
            next_frame: 0,
            primed: false,
            cancelled: false,
        }
    }

    fn audio_total(&self) -> usize {
        self.audio_dropped + self.audio_resident.len()
    }
}

/// CPU stand-in for the bundle's device stream. Copies complete eagerly, so
/// `synchronize` only fulfills the contract's ordering point.
struct ReferenceStream;

impl DeviceStream for ReferenceStream {
    fn copy_to_host(&self, src: &DeviceView<'_>, dst: &mut [f32]) -> EngineResult<()> {
        if src.len() != dst.len() {
            return Err(EngineError::new(format!(
                "copy size mismatch: device {} vs host {}",
                src.len(),
                dst.len()
            )));
        }
        dst.copy_from_slice(src.data());
        Ok(())
    }

    fn synchronize(&self) -> EngineResult<()> {
        Ok(())
    }
}

struct ReferenceSolver {
    names: Vec<String>,
}

impl BlendshapeSolver for ReferenceSolver {
    fn pose_count(&self) -> usize {
        self.names.len()
    }

    fn pose_name(&self, index: usize) -> &str {
        &self.names[index]
    }
}

struct ReferenceExecutor {
    state: Arc<Mutex<TrackState>>,
    stream: Arc<ReferenceStream>,
    sampling_rate: usize,
    fps_numerator: usize,
    fps_denominator: usize,
    weight_count: usize,
    variant: EngineVariant,
    skin: Option<ReferenceSolver>,
    tongue: Option<ReferenceSolver>,
}

impl ReferenceExecutor {
    /// First sample past the end of `frame`.
    fn frame_end_sample(&self, frame: u64) -> usize {
        ((frame as u128 + 1) * self.sampling_rate as u128 * self.fps_denominator as u128
            / self.fps_numerator as u128) as usize
    }

    /// First sample of `frame`.
    fn frame_start_sample(&self, frame: u64) -> usize {
        (frame as u128 * self.sampling_rate as u128 * self.fps_denominator as u128
            / self.fps_numerator as u128) as usize
    }

    fn frame_time_ns(&self, frame: u64) -> i64 {
        (frame as u128 * 1_000_000_000u128 * self.fps_denominator as u128
            / self.fps_numerator as u128) as i64
    }

    fn track_ready(&self, state: &TrackState) -> bool {
        !state.cancelled
            && state.emotion_closed
            && state.audio_total() >= self.frame_end_sample(state.next_frame)
    }

    /// Claim the next ready frame, advancing the track. Returns the frame
    /// index and whether it is a diffusion priming step.
    fn take_ready_frame(&self) -> Option<(u64, bool)> {
        let mut state = self.state.lock().unwrap();
        if !self.track_ready(&state) {
            return None;
        }
        let frame = state.next_frame;
        state.next_frame += 1;
        let priming = matches!(self.variant, EngineVariant::Diffusion { .. }) && !state.primed;
        if priming {
            state.primed = true;
        }
        Some((frame, priming))
    }

    fn synth_weights(&self, frame: u64) -> Vec<f32> {
        let (seed, frame_term) = match self.variant {
            EngineVariant::Regression => (0u64, frame),
            EngineVariant::Diffusion {
                identity,
                constant_noise,
            } => (identity as u64, if constant_noise { 0 } else { frame }),
        };
        (0..self.weight_count)
            .map(|pose| synth_weight(seed, frame, frame_term, pose))
            .collect()
    }
}

/// Cheap hash mapped into [0, 1); stable across runs.
fn synth_weight(seed: u64, frame: u64, noise_term: u64, pose: usize) -> f32 {
    let mut x = seed
        .wrapping_mul(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(frame.wrapping_mul(0xbf58_476d_1ce4_e5b9))
        .wrapping_add(noise_term.wrapping_mul(0x94d0_49bb_1331_11eb))
        .wrapping_add(pose as u64);
    x ^= x >> 31;
    x = x.wrapping_mul(0xd6e8_feb8_6659_fd93);
    ((x >> 40) as f32) / (1u64 << 24) as f32
}

impl BlendshapeExecutor for ReferenceExecutor {
    fn results_type(&self) -> ResultsType {
        ResultsType::Device
    }

    fn sampling_rate(&self) -> usize {
        self.sampling_rate
    }

    fn frame_rate(&self) -> (usize, usize) {
        (self.fps_numerator, self.fps_denominator)
    }

    fn weight_count(&self) -> usize {
        self.weight_count
    }

    fn wait(&mut self, _track: usize) -> EngineResult<()> {
        // Synchronous backend: nothing in flight.
        Ok(())
    }

    fn reset(&mut self, _track: usize) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.next_frame = 0;
        state.primed = false;
        state.cancelled = false;
        Ok(())
    }

    fn ready_tracks(&self) -> usize {
        let state = self.state.lock().unwrap();
        usize::from(self.track_ready(&state))
    }

    fn execute(&mut self, sink: &mut dyn DeviceResultSink) -> EngineResult<()> {
        // One frame per step. The caller interleaves flushes between steps,
        // so a long backlog (a large push, or a multi-second gap fill) must
        // not be drained inside a single call.
        let Some((frame, priming)) = self.take_ready_frame() else {
            return Err(EngineError::new("no track was ready to execute"));
        };
        let weights = if priming {
            Vec::new()
        } else {
            self.synth_weights(frame)
        };
        let results = DeviceResults {
            track_index: 0,
            weights: DeviceView::new(&weights),
            stream: &*self.stream,
            ts_current: self.frame_time_ns(frame),
            ts_next: self.frame_time_ns(frame + 1),
        };
        if !sink.on_device_results(&results) {
            self.state.lock().unwrap().cancelled = true;
        }
        Ok(())
    }

    fn next_audio_sample_to_read(&self, _track: usize) -> usize {
        let state = self.state.lock().unwrap();
        self.frame_start_sample(state.next_frame)
    }

    fn next_emotion_timestamp_to_read(&self, _track: usize) -> i64 {
        let state = self.state.lock().unwrap();
        self.frame_time_ns(state.next_frame)
    }

    fn skin_solver(&self) -> Option<&dyn BlendshapeSolver> {
        self.skin.as_ref().map(|s| s as &dyn BlendshapeSolver)
    }

    fn tongue_solver(&self) -> Option<&dyn BlendshapeSolver> {
        self.tongue.as_ref().map(|s| s as &dyn BlendshapeSolver)
    }
}

struct ReferenceAudioAccumulator {
    state: Arc<Mutex<TrackState>>,
}

impl AudioAccumulator for ReferenceAudioAccumulator {
    fn accumulate(&mut self, samples: &[f32]) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.audio_resident.extend_from_slice(samples);
        Ok(())
    }

    fn accumulated_samples(&self) -> usize {
        self.state.lock().unwrap().audio_total()
    }

    fn reset(&mut self) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.audio_resident.clear();
        state.audio_dropped = 0;
        Ok(())
    }

    fn drop_samples_before(&mut self, sample_index: usize) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if sample_index > state.audio_dropped {
            let drop = (sample_index - state.audio_dropped).min(state.audio_resident.len());
            state.audio_resident.drain(..drop);
            state.audio_dropped += drop;
        }
        Ok(())
    }
}

struct ReferenceEmotionAccumulator {
    state: Arc<Mutex<TrackState>>,
}

impl EmotionAccumulator for ReferenceEmotionAccumulator {
    fn emotion_size(&self) -> usize {
        self.state.lock().unwrap().emotion_size
    }

    fn accumulate(&mut self, timestamp: i64, values: &[f32]) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if values.len() != state.emotion_size {
            return Err(EngineError::new(format!(
                "emotion vector size mismatch: expected {}, got {}",
                state.emotion_size,
                values.len()
            )));
        }
        if state.emotion_closed {
            return Err(EngineError::new("emotion accumulator is closed"));
        }
        state.emotions.push((timestamp, values.to_vec()));
        Ok(())
    }

    fn close(&mut self) -> EngineResult<()> {
        self.state.lock().unwrap().emotion_closed = true;
        Ok(())
    }

    fn reset(&mut self) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.emotions.clear();
        state.emotion_closed = false;
        Ok(())
    }

    fn drop_emotions_before(&mut self, timestamp: i64) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        // Keep the latest entry at or before the cutoff: it is still the
        // active emotion for upcoming frames.
        let keep_from = state
            .emotions
            .iter()
            .rposition(|(ts, _)| *ts <= timestamp)
            .unwrap_or(0);
        state.emotions.drain(..keep_from);
        Ok(())
    }
}

struct ReferenceBundle {
    executor: ReferenceExecutor,
    audio: ReferenceAudioAccumulator,
    emotion: ReferenceEmotionAccumulator,
    stream: Arc<ReferenceStream>,
}

impl ExecutorBundle for ReferenceBundle {
    fn executor(&self) -> &dyn BlendshapeExecutor {
        &self.executor
    }

    fn executor_mut(&mut self) -> &mut dyn BlendshapeExecutor {
        &mut self.executor
    }

    fn audio_accumulator_mut(&mut self, _track: usize) -> &mut dyn AudioAccumulator {
        &mut self.audio
    }

    fn emotion_accumulator_mut(&mut self, _track: usize) -> &mut dyn EmotionAccumulator {
        &mut self.emotion
    }

    fn stream(&self) -> &dyn DeviceStream {
        &*self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_descriptor() -> ModelDescriptor {
        ModelDescriptor {
            sampling_rate: 16_000,
            emotion_size: 10,
            skin_channels: vec![
                "browDown_L".into(),
                "browDown_R".into(),
                "eyeBlink_L".into(),
                "eyeBlink_R".into(),
                "jawOpen".into(),
                "mouthSmile_L".into(),
                "mouthSmile_R".into(),
                "mouthPucker".into(),
            ],
            tongue_channels: vec!["tongueOut".into(), "tongueUp".into()],
        }
    }

    struct CollectingSink {
        frames: Vec<(usize, i64, i64)>,
        empty_results: usize,
        cancel_after: Option<usize>,
    }

    impl CollectingSink {
        fn new() -> Self {
            Self {
                frames: Vec::new(),
                empty_results: 0,
                cancel_after: None,
            }
        }
    }

    impl DeviceResultSink for CollectingSink {
        fn on_device_results(&mut self, results: &DeviceResults<'_>) -> bool {
            if results.weights.is_empty() {
                self.empty_results += 1;
                return true;
            }
            if let Some(limit) = self.cancel_after {
                if self.frames.len() >= limit {
                    return false;
                }
            }
            self.frames
                .push((results.weights.len(), results.ts_current, results.ts_next));
            true
        }
    }

    fn regression_bundle() -> Box<dyn ExecutorBundle> {
        bundle_from_descriptor(
            1,
            test_descriptor(),
            ExecutionOption::SkinTongue,
            60,
            1,
            EngineVariant::Regression,
        )
        .unwrap()
    }

    fn feed_seconds(bundle: &mut Box<dyn ExecutorBundle>, seconds: usize) {
        let emotion = bundle.emotion_accumulator_mut(0);
        let zeros = vec![0.0; emotion.emotion_size()];
        emotion.accumulate(0, &zeros).unwrap();
        emotion.close().unwrap();
        let samples = vec![0.0f32; seconds * 16_000];
        bundle.audio_accumulator_mut(0).accumulate(&samples).unwrap();
    }

    #[test]
    fn test_four_seconds_yields_240_frames() {
        let mut bundle = regression_bundle();
        feed_seconds(&mut bundle, 4);

        let mut sink = CollectingSink::new();
        while bundle.executor().ready_tracks() > 0 {
            bundle.executor_mut().execute(&mut sink).unwrap();
        }

        assert_eq!(sink.frames.len(), 240);
        assert_eq!(sink.empty_results, 0);
        for (count, _, _) in &sink.frames {
            assert_eq!(*count, 10);
        }
        // Timestamps advance by one frame period.
        for pair in sink.frames.windows(2) {
            assert!(pair[0].1 < pair[1].1);
            assert_eq!(pair[0].2, pair[1].1);
        }
        assert_eq!(sink.frames[0].1, 0);
        assert_eq!(sink.frames[0].2, 1_000_000_000 / 60);
    }

    #[test]
    fn test_track_not_ready_without_closed_emotion() {
        let mut bundle = regression_bundle();
        let samples = vec![0.0f32; 16_000];
        bundle.audio_accumulator_mut(0).accumulate(&samples).unwrap();
        assert_eq!(bundle.executor().ready_tracks(), 0);

        let emotion = bundle.emotion_accumulator_mut(0);
        let zeros = vec![0.0; emotion.emotion_size()];
        emotion.accumulate(0, &zeros).unwrap();
        emotion.close().unwrap();
        assert_eq!(bundle.executor().ready_tracks(), 1);
    }

    #[test]
    fn test_diffusion_emits_one_priming_result() {
        let mut bundle = bundle_from_descriptor(
            1,
            test_descriptor(),
            ExecutionOption::SkinTongue,
            60,
            1,
            EngineVariant::Diffusion {
                identity: 3,
                constant_noise: true,
            },
        )
        .unwrap();
        feed_seconds(&mut bundle, 1);

        let mut sink = CollectingSink::new();
        while bundle.executor().ready_tracks() > 0 {
            bundle.executor_mut().execute(&mut sink).unwrap();
        }

        assert_eq!(sink.empty_results, 1);
        assert_eq!(sink.frames.len(), 59);
    }

    #[test]
    fn test_execute_emits_one_frame_per_step() {
        let mut bundle = regression_bundle();
        feed_seconds(&mut bundle, 1);

        let mut sink = CollectingSink::new();
        bundle.executor_mut().execute(&mut sink).unwrap();
        assert_eq!(sink.frames.len(), 1);
        // The backlog stays ready for the next step.
        assert_eq!(bundle.executor().ready_tracks(), 1);

        bundle.executor_mut().execute(&mut sink).unwrap();
        assert_eq!(sink.frames.len(), 2);
    }

    #[test]
    fn test_cancel_latches_until_reset() {
        let mut bundle = regression_bundle();
        feed_seconds(&mut bundle, 1);

        let mut sink = CollectingSink::new();
        sink.cancel_after = Some(10);
        while bundle.executor().ready_tracks() > 0 {
            bundle.executor_mut().execute(&mut sink).unwrap();
        }
        assert_eq!(sink.frames.len(), 10);
        assert_eq!(bundle.executor().ready_tracks(), 0);

        bundle.executor_mut().reset(0).unwrap();
        bundle.audio_accumulator_mut(0).reset().unwrap();
        let emotion = bundle.emotion_accumulator_mut(0);
        emotion.reset().unwrap();
        feed_seconds(&mut bundle, 1);
        assert_eq!(bundle.executor().ready_tracks(), 1);
    }

    #[test]
    fn test_drop_samples_bounds_resident_audio() {
        let mut bundle = regression_bundle();
        feed_seconds(&mut bundle, 2);

        let mut sink = CollectingSink::new();
        while bundle.executor().ready_tracks() > 0 {
            bundle.executor_mut().execute(&mut sink).unwrap();
        }

        let next = bundle.executor().next_audio_sample_to_read(0);
        assert_eq!(next, 32_000);
        bundle.audio_accumulator_mut(0).drop_samples_before(next).unwrap();
        // Absolute accounting survives the drop.
        assert_eq!(bundle.audio_accumulator_mut(0).accumulated_samples(), 32_000);
    }

    #[test]
    fn test_execution_option_filters_channel_groups() {
        let bundle = bundle_from_descriptor(
            1,
            test_descriptor(),
            ExecutionOption::Skin,
            60,
            1,
            EngineVariant::Regression,
        )
        .unwrap();
        assert_eq!(bundle.executor().weight_count(), 8);
        assert!(bundle.executor().skin_solver().is_some());
        assert!(bundle.executor().tongue_solver().is_none());
    }

    #[test]
    fn test_descriptor_parses_with_defaults() {
        let descriptor: ModelDescriptor =
            serde_json::from_str(r#"{"sampling_rate": 16000, "skin_channels": ["jawOpen"]}"#)
                .unwrap();
        assert_eq!(descriptor.sampling_rate, 16_000);
        assert_eq!(descriptor.emotion_size, 10);
        assert_eq!(descriptor.skin_channels, vec!["jawOpen".to_string()]);
        assert!(descriptor.tongue_channels.is_empty());
    }

    #[test]
    fn test_multi_track_is_rejected() {
        let err = bundle_from_descriptor(
            2,
            test_descriptor(),
            ExecutionOption::SkinTongue,
            60,
            1,
            EngineVariant::Regression,
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("single track"));
    }
}
