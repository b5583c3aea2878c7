//! Session lifecycle: one inference pipeline per attached client
//!
//! A session owns an executor bundle, a pinned staging buffer for
//! device-to-host weight copies, and the queue of staged frames awaiting
//! flush. All mutable state lives behind one mutex; the pool hands a
//! session to at most one connection at a time.

pub mod pool;

use std::sync::{Arc, Mutex};

use rand::rngs::OsRng;
use rand::RngCore;

use crate::config::ServerConfig;
use crate::engine::{
    self, DeviceResultSink, DeviceResults, DeviceStream, EngineError, ExecutorBundle,
    HostPinnedTensor, ResultsType,
};
use crate::error::ServerError;
use crate::protocol::{
    self, ChannelGroup, FrameRate, ProtocolInfo, ServerMessage, SessionOptions, SessionStarted,
};
use crate::ws::frame::Opcode;
use crate::ws::WsSocket;

/// Upper bound on staged-but-unsent frames. Reaching it is the backpressure
/// signal: the result sink cancels and the client is told to slow down.
pub const MAX_STAGED_FRAMES: usize = 256;

/// Pending count at which the hot path flushes between executor steps.
pub const FLUSH_THRESHOLD_FRAMES: usize = 32;

/// Largest tolerated silence gap: 10 s at 16 kHz.
pub const MAX_GAP_SAMPLES: usize = 160_000;

/// A staged frame awaiting flush. `slot_index` addresses the staging
/// buffer; queued slots are dense from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingFrame {
    pub frame_index: u64,
    pub ts_current: i64,
    pub ts_next: i64,
    pub slot_index: usize,
}

/// Immutable facts captured at init time.
#[derive(Debug, Clone)]
struct SessionMeta {
    cuda_device: i32,
    model_json_path: String,
    execution_option: String,
    use_gpu_solver: bool,
    sampling_rate: usize,
    fps_numerator: usize,
    fps_denominator: usize,
    weight_count: usize,
    channels: Vec<String>,
    skin_count: usize,
    tongue_count: usize,
}

/// One pooled session.
pub struct SessionContext {
    meta: SessionMeta,
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    bundle: Box<dyn ExecutorBundle>,
    link: ClientLink,
}

/// The state the device-result sink touches: the attached client plus the
/// staging machinery. Kept apart from the bundle so the executor can borrow
/// it as a sink while being driven.
struct ClientLink {
    socket: Option<Arc<WsSocket>>,
    session_id: String,
    weight_count: usize,
    staging: HostPinnedTensor,
    scratch: Vec<f32>,
    pending: Vec<PendingFrame>,
    next_frame_index: u64,
}

impl ClientLink {
    /// Best-effort error report to the attached client.
    fn send_error(&self, message: &str) {
        let Some(socket) = &self.socket else {
            return;
        };
        if let Ok(text) = serde_json::to_string(&ServerMessage::error(message)) {
            let _ = socket.send_frame(Opcode::Text, text.as_bytes());
        }
    }

    /// Synchronize the staged copies once, then send every pending frame.
    ///
    /// A send failure aborts the flush; the dispatcher observes the dead
    /// socket on its next read and releases the session.
    fn flush_pending(&mut self, stream: &dyn DeviceStream) -> Result<(), ServerError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if let Err(err) = stream.synchronize() {
            self.send_error(&format!("CUDA stream synchronization failed: {err}"));
            return Err(ServerError::engine("CUDA stream synchronization failed", err));
        }
        let Some(socket) = self.socket.clone() else {
            // Detached mid-drive: nothing to deliver to.
            self.pending.clear();
            return Ok(());
        };
        for frame in &self.pending {
            let weights = self.staging.slot(frame.slot_index, self.weight_count);
            let payload = protocol::encode_animation_frame(
                frame.frame_index,
                frame.ts_current,
                frame.ts_next,
                weights,
            );
            socket.send_frame(Opcode::Binary, &payload)?;
        }
        self.pending.clear();
        Ok(())
    }
}

impl DeviceResultSink for ClientLink {
    fn on_device_results(&mut self, results: &DeviceResults<'_>) -> bool {
        if self.socket.is_none() {
            // Detached; cancel further results.
            return false;
        }
        if results.weights.is_empty() {
            // No-op frame, common while a diffusion model primes.
            return true;
        }
        if results.weights.len() != self.weight_count {
            self.send_error("Unexpected weight vector size from executor");
            return false;
        }
        if self.pending.len() >= MAX_STAGED_FRAMES {
            self.send_error("Too many pending frames (client too slow?)");
            return false;
        }

        let slot_index = self.pending.len();
        let dst = self.staging.slot_mut(slot_index, self.weight_count);
        if let Err(err) = results.stream.copy_to_host(&results.weights, dst) {
            self.send_error(&format!("CopyDeviceToHost failed: {err}"));
            return false;
        }

        let frame_index = self.next_frame_index;
        self.next_frame_index += 1;
        self.pending.push(PendingFrame {
            frame_index,
            ts_current: results.ts_current,
            ts_next: results.ts_next,
            slot_index,
        });
        true
    }
}

impl SessionContext {
    /// Build one session and its engine bundle from the server config.
    pub fn init(config: &ServerConfig) -> Result<Self, ServerError> {
        if !config.use_gpu_solver {
            return Err(ServerError::Validation(
                "Only GPU blendshape solver is supported by this server build".into(),
            ));
        }

        engine::set_cuda_device_if_needed(config.cuda_device)
            .map_err(|err| ServerError::engine("Failed to set CUDA device", err))?;

        let bundle = if config.diffusion {
            engine::read_diffusion_bundle(
                1,
                &config.model_json_path,
                config.execution_option,
                config.use_gpu_solver,
                config.diffusion_identity,
                config.diffusion_constant_noise,
            )
        } else {
            engine::read_regression_bundle(
                1,
                &config.model_json_path,
                config.execution_option,
                config.use_gpu_solver,
                config.fps_numerator,
                config.fps_denominator,
            )
        }
        .map_err(|err| {
            ServerError::engine(
                format!(
                    "Failed to create executor bundle from model {}",
                    config.model_json_path
                ),
                err,
            )
        })?;

        let executor = bundle.executor();
        if executor.results_type() != ResultsType::Device {
            return Err(ServerError::engine(
                "Executor validation failed",
                EngineError::new("expected DEVICE results from the GPU solver"),
            ));
        }

        let sampling_rate = executor.sampling_rate();
        let (fps_numerator, fps_denominator) = executor.frame_rate();
        let weight_count = executor.weight_count();

        let mut channels = Vec::with_capacity(weight_count);
        let mut skin_count = 0;
        let mut tongue_count = 0;
        if let Some(solver) = executor.skin_solver() {
            skin_count = solver.pose_count();
            for i in 0..skin_count {
                channels.push(solver.pose_name(i).to_string());
            }
        }
        if let Some(solver) = executor.tongue_solver() {
            tongue_count = solver.pose_count();
            for i in 0..tongue_count {
                channels.push(solver.pose_name(i).to_string());
            }
        }
        if channels.len() != weight_count {
            return Err(ServerError::engine(
                "Channel enumeration failed",
                EngineError::new(format!(
                    "channel count mismatch (channels={}, weights={weight_count})",
                    channels.len()
                )),
            ));
        }

        let staging = engine::create_host_pinned_tensor(weight_count * MAX_STAGED_FRAMES)
            .map_err(|err| {
                ServerError::engine("Failed to allocate pinned host staging buffer", err)
            })?;

        let session = Self {
            meta: SessionMeta {
                cuda_device: config.cuda_device,
                model_json_path: config.model_json_path.clone(),
                execution_option: config.execution_option.as_str().to_string(),
                use_gpu_solver: config.use_gpu_solver,
                sampling_rate,
                fps_numerator,
                fps_denominator,
                weight_count,
                channels,
                skin_count,
                tongue_count,
            },
            inner: Mutex::new(SessionInner {
                bundle,
                link: ClientLink {
                    socket: None,
                    session_id: String::new(),
                    weight_count,
                    staging,
                    scratch: Vec::new(),
                    pending: Vec::new(),
                    next_frame_index: 0,
                },
            }),
        };
        session.reset_for_reuse()?;
        Ok(session)
    }

    /// Return the pipeline to a clean state between attachments.
    /// Idempotent; safe to call on an idle session.
    pub fn reset_for_reuse(&self) -> Result<(), ServerError> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        let executor = inner.bundle.executor_mut();
        let _ = executor.wait(0);
        executor
            .reset(0)
            .map_err(|err| ServerError::engine("Executor reset failed", err))?;
        inner
            .bundle
            .audio_accumulator_mut(0)
            .reset()
            .map_err(|err| ServerError::engine("Audio accumulator reset failed", err))?;

        let emotion = inner.bundle.emotion_accumulator_mut(0);
        emotion
            .reset()
            .map_err(|err| ServerError::engine("Emotion accumulator reset failed", err))?;
        // Seed a neutral emotion and close the lane so the executor is free
        // to consume audio.
        let zeros = vec![0.0f32; emotion.emotion_size()];
        emotion
            .accumulate(0, &zeros)
            .map_err(|err| ServerError::engine("Failed to set neutral emotion", err))?;
        emotion
            .close()
            .map_err(|err| ServerError::engine("Failed to close emotion accumulator", err))?;

        inner.link.pending.clear();
        inner.link.next_frame_index = 0;
        Ok(())
    }

    /// Attach a connection and mint a fresh session id.
    pub fn start(&self, socket: Arc<WsSocket>) {
        let mut inner = self.inner.lock().unwrap();
        inner.link.socket = Some(socket);
        inner.link.session_id = random_hex(16);
        inner.link.pending.clear();
        inner.link.next_frame_index = 0;
    }

    /// Detach the connection. Late device results observe the cleared
    /// socket and cancel.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.link.socket = None;
    }

    pub fn session_id(&self) -> String {
        self.inner.lock().unwrap().link.session_id.clone()
    }

    /// The `SessionStarted` body advertising this session's configuration.
    pub fn describe_session_started(&self) -> SessionStarted {
        let inner = self.inner.lock().unwrap();
        SessionStarted {
            protocol: ProtocolInfo {
                version: protocol::PROTOCOL_VERSION,
            },
            session_id: inner.link.session_id.clone(),
            model: self.meta.model_json_path.clone(),
            options: SessionOptions {
                use_gpu_solver: self.meta.use_gpu_solver,
                execution_option: self.meta.execution_option.clone(),
            },
            sampling_rate: self.meta.sampling_rate,
            frame_rate: FrameRate {
                numerator: self.meta.fps_numerator,
                denominator: self.meta.fps_denominator,
            },
            weight_count: self.meta.weight_count,
            channels: self.meta.channels.clone(),
            channel_groups: vec![
                ChannelGroup {
                    name: "skin".into(),
                    count: self.meta.skin_count,
                },
                ChannelGroup {
                    name: "tongue".into(),
                    count: self.meta.tongue_count,
                },
            ],
        }
    }

    /// Feed one PushAudio chunk and drive the executor until it runs dry.
    ///
    /// Failures are also reported to the attached client as `Error`
    /// messages; every error leaves the session able to accept further
    /// messages.
    pub fn push_audio(&self, start_sample_index: i64, pcm: &[u8]) -> Result<(), ServerError> {
        if start_sample_index < 0 {
            let inner = self.inner.lock().unwrap();
            inner.link.send_error("startSampleIndex must be >= 0");
            return Err(ServerError::AudioOrder("startSampleIndex must be >= 0".into()));
        }

        if let Err(err) = engine::set_cuda_device_if_needed(self.meta.cuda_device) {
            let inner = self.inner.lock().unwrap();
            let wrapped = ServerError::engine("Failed to set CUDA device", err);
            inner.link.send_error(&wrapped.to_string());
            return Err(wrapped);
        }

        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        if inner.link.socket.is_none() {
            // Racing disconnect; drop the audio silently.
            return Ok(());
        }

        let accumulated = inner.bundle.audio_accumulator_mut(0).accumulated_samples();
        let start = start_sample_index as usize;
        if start < accumulated {
            let message = "PushAudio startSampleIndex is behind the accumulator (out-of-order audio)";
            inner.link.send_error(message);
            return Err(ServerError::AudioOrder(message.into()));
        }

        let gap = start - accumulated;
        if gap > MAX_GAP_SAMPLES {
            inner.link.send_error("Audio gap too large");
            return Err(ServerError::AudioOrder("Audio gap too large".into()));
        }

        if gap > 0 {
            inner.link.scratch.clear();
            inner.link.scratch.resize(gap, 0.0);
            if let Err(err) = inner.bundle.audio_accumulator_mut(0).accumulate(&inner.link.scratch)
            {
                inner.link.send_error(&format!("Failed to fill audio gap: {err}"));
                return Err(ServerError::engine("Failed to fill audio gap", err));
            }
        }

        inner.link.scratch.clear();
        inner.link.scratch.extend(
            pcm.chunks_exact(2)
                .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0),
        );
        if let Err(err) = inner.bundle.audio_accumulator_mut(0).accumulate(&inner.link.scratch) {
            inner.link.send_error(&format!("Failed to accumulate audio: {err}"));
            return Err(ServerError::engine("Failed to accumulate audio", err));
        }

        while inner.bundle.executor().ready_tracks() > 0 {
            if let Err(err) = inner.bundle.executor_mut().execute(&mut inner.link) {
                inner.link.send_error(&format!("Execute() failed: {err}"));
                return Err(ServerError::engine("Execute() failed", err));
            }
            if inner.link.pending.len() >= FLUSH_THRESHOLD_FRAMES {
                inner.link.flush_pending(inner.bundle.stream())?;
            }
        }

        inner.link.flush_pending(inner.bundle.stream())?;

        // Free consumed audio and emotion to bound resident buffers.
        let next_sample = inner.bundle.executor().next_audio_sample_to_read(0);
        let _ = inner
            .bundle
            .audio_accumulator_mut(0)
            .drop_samples_before(next_sample);
        let next_ts = inner.bundle.executor().next_emotion_timestamp_to_read(0);
        let _ = inner
            .bundle
            .emotion_accumulator_mut(0)
            .drop_emotions_before(next_ts);

        Ok(())
    }
}

/// Random lowercase hex string from `bytes` bytes of OS entropy.
fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    let mut out = String::with_capacity(bytes * 2);
    for byte in buf {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
