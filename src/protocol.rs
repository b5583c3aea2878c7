//! Streaming-protocol messages and payload codecs
//!
//! Text frames carry JSON control messages tagged by `type`. Binary frames
//! carry `PushAudio` (client to server) and animation frames (server to
//! client):
//!
//! ```text
//! animation frame                      PushAudio
//! ┌────────────────────┬─────────┐     ┌──────────────────┬──────────┐
//! │ magic,ver,count,0  │ index,  │     │ startSampleIndex │ PCM16 LE │
//! │ (4×u32 LE)         │ ts, ts' │     │ (i64 LE)         │ mono     │
//! │                    │ weights │     └──────────────────┴──────────┘
//! └────────────────────┴─────────┘
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ServerError;

/// Wire protocol version, carried in `SessionStarted.protocol.version` and
/// in every animation frame header.
pub const PROTOCOL_VERSION: u32 = 1;

/// Animation frame magic, "A2FB" when read as little-endian bytes.
pub const FRAME_MAGIC: u32 = 0x4246_3241;

/// Fixed animation-frame header ahead of the weight block.
pub const FRAME_HEADER_BYTES: usize = 40;

/// Inbound control messages.
///
/// Payload fields stay loosely typed so validation can report precise
/// per-field errors; unknown fields are ignored.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    StartSession(StartSessionRequest),
    EndSession(EndSessionRequest),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StartSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EndSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Value>,
}

impl ClientMessage {
    /// Parse a text frame, distinguishing malformed JSON from an
    /// unrecognized `type`.
    pub fn parse(text: &str) -> Result<Self, ServerError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|err| ServerError::Protocol(format!("Invalid JSON: {err}")))?;
        let msg_type = value.get("type").and_then(Value::as_str).unwrap_or_default();
        match msg_type {
            "StartSession" => serde_json::from_value(value)
                .map(ClientMessage::StartSession)
                .map_err(|err| ServerError::Protocol(format!("Invalid StartSession: {err}"))),
            "EndSession" => serde_json::from_value(value)
                .map(ClientMessage::EndSession)
                .map_err(|err| ServerError::Protocol(format!("Invalid EndSession: {err}"))),
            _ => Err(ServerError::Protocol("Unknown message type".into())),
        }
    }
}

/// Outbound control messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    SessionStarted(SessionStarted),
    SessionEnded { session_id: String },
    Error { message: String },
}

impl ServerMessage {
    /// Helper to construct an error reply.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

impl From<&ServerError> for ServerMessage {
    fn from(err: &ServerError) -> Self {
        ServerMessage::error(err.to_string())
    }
}

/// The configuration a session advertises on start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionStarted {
    pub protocol: ProtocolInfo,
    pub session_id: String,
    pub model: String,
    pub options: SessionOptions,
    pub sampling_rate: usize,
    pub frame_rate: FrameRate,
    pub weight_count: usize,
    pub channels: Vec<String>,
    pub channel_groups: Vec<ChannelGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolInfo {
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionOptions {
    pub use_gpu_solver: bool,
    pub execution_option: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameRate {
    pub numerator: usize,
    pub denominator: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelGroup {
    pub name: String,
    pub count: usize,
}

/// One decoded animation frame. The hot path encodes straight from the
/// staging buffer; this struct serves decoding and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct AnimationFrame {
    pub weight_count: u32,
    pub frame_index: u64,
    pub ts_current: i64,
    pub ts_next: i64,
    pub weights: Vec<f32>,
}

/// Encode one animation frame payload.
pub fn encode_animation_frame(
    frame_index: u64,
    ts_current: i64,
    ts_next: i64,
    weights: &[f32],
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(FRAME_HEADER_BYTES + weights.len() * 4);
    payload.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    payload.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    payload.extend_from_slice(&(weights.len() as u32).to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload.extend_from_slice(&frame_index.to_le_bytes());
    payload.extend_from_slice(&ts_current.to_le_bytes());
    payload.extend_from_slice(&ts_next.to_le_bytes());
    for weight in weights {
        payload.extend_from_slice(&weight.to_le_bytes());
    }
    payload
}

/// Decode an animation frame payload, checking magic, version, and the
/// weight block size.
pub fn decode_animation_frame(payload: &[u8]) -> Result<AnimationFrame, ServerError> {
    if payload.len() < FRAME_HEADER_BYTES {
        return Err(ServerError::Protocol(
            "animation frame payload too short".into(),
        ));
    }
    let magic = read_u32(payload, 0);
    if magic != FRAME_MAGIC {
        return Err(ServerError::Protocol(format!(
            "bad animation frame magic 0x{magic:08x}"
        )));
    }
    let version = read_u32(payload, 4);
    if version != PROTOCOL_VERSION {
        return Err(ServerError::Protocol(format!(
            "unsupported animation frame version {version}"
        )));
    }
    let weight_count = read_u32(payload, 8);
    let expected = FRAME_HEADER_BYTES + weight_count as usize * 4;
    if payload.len() != expected {
        return Err(ServerError::Protocol(format!(
            "animation frame size mismatch: expected {expected} bytes, got {}",
            payload.len()
        )));
    }
    let weights = payload[FRAME_HEADER_BYTES..]
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(AnimationFrame {
        weight_count,
        frame_index: read_u64(payload, 16),
        ts_current: read_i64(payload, 24),
        ts_next: read_i64(payload, 32),
        weights,
    })
}

/// Borrowed view of a PushAudio payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushAudio<'a> {
    pub start_sample_index: i64,
    /// Raw little-endian 16-bit mono PCM.
    pub pcm: &'a [u8],
}

impl PushAudio<'_> {
    pub fn sample_count(&self) -> usize {
        self.pcm.len() / 2
    }
}

/// Split a binary frame into the PushAudio header and PCM block. The
/// payload must hold the 8-byte header plus a whole number of samples.
pub fn decode_push_audio(payload: &[u8]) -> Result<PushAudio<'_>, ServerError> {
    if payload.len() < 8 || (payload.len() - 8) % 2 != 0 {
        return Err(ServerError::Protocol(
            "Invalid PushAudio binary payload".into(),
        ));
    }
    Ok(PushAudio {
        start_sample_index: read_i64(payload, 0),
        pcm: &payload[8..],
    })
}

fn read_u32(payload: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&payload[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(payload: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&payload[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn read_i64(payload: &[u8], offset: usize) -> i64 {
    read_u64(payload, offset) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_animation_frame_round_trip() {
        let weights = vec![0.0, 0.25, -1.0, 0.999, 42.5];
        let payload = encode_animation_frame(7, 116_666_666, 133_333_333, &weights);
        assert_eq!(payload.len(), FRAME_HEADER_BYTES + weights.len() * 4);
        assert_eq!(&payload[..4], b"A2FB");

        let frame = decode_animation_frame(&payload).unwrap();
        assert_eq!(frame.weight_count, 5);
        assert_eq!(frame.frame_index, 7);
        assert_eq!(frame.ts_current, 116_666_666);
        assert_eq!(frame.ts_next, 133_333_333);
        assert_eq!(frame.weights, weights);
    }

    #[test]
    fn test_animation_frame_negative_timestamps_round_trip() {
        let payload = encode_animation_frame(0, -1, i64::MIN, &[]);
        let frame = decode_animation_frame(&payload).unwrap();
        assert_eq!(frame.ts_current, -1);
        assert_eq!(frame.ts_next, i64::MIN);
        assert!(frame.weights.is_empty());
    }

    #[test]
    fn test_animation_frame_decode_rejects_bad_magic() {
        let mut payload = encode_animation_frame(0, 0, 0, &[1.0]);
        payload[0] ^= 0xff;
        assert!(decode_animation_frame(&payload).is_err());
    }

    #[test]
    fn test_animation_frame_decode_rejects_truncated_weights() {
        let mut payload = encode_animation_frame(0, 0, 0, &[1.0, 2.0]);
        payload.truncate(payload.len() - 4);
        assert!(decode_animation_frame(&payload).is_err());
    }

    #[test]
    fn test_push_audio_decode() {
        let mut payload = 16_000i64.to_le_bytes().to_vec();
        payload.extend_from_slice(&1234i16.to_le_bytes());
        payload.extend_from_slice(&(-1234i16).to_le_bytes());

        let push = decode_push_audio(&payload).unwrap();
        assert_eq!(push.start_sample_index, 16_000);
        assert_eq!(push.sample_count(), 2);
    }

    #[test]
    fn test_push_audio_rejects_short_and_odd_payloads() {
        assert!(decode_push_audio(&[0u8; 7]).is_err());
        assert!(decode_push_audio(&[0u8; 9]).is_err());
        // Header-only (zero samples) is valid.
        assert!(decode_push_audio(&[0u8; 8]).is_ok());
    }

    #[test]
    fn test_push_audio_preserves_negative_start_index() {
        let payload = (-5i64).to_le_bytes().to_vec();
        // The codec passes the value through; the session rejects it.
        assert_eq!(decode_push_audio(&payload).unwrap().start_sample_index, -5);
    }

    #[test]
    fn test_parse_start_session_with_hints() {
        let message = ClientMessage::parse(
            r#"{"type":"StartSession","fps":30,"model":"a/b.json","options":{"use_gpu_solver":true},"extra":"ignored"}"#,
        )
        .unwrap();
        let ClientMessage::StartSession(request) = message else {
            panic!("expected StartSession");
        };
        assert_eq!(request.fps, Some(serde_json::json!(30)));
        assert_eq!(request.model, Some(serde_json::json!("a/b.json")));
        assert!(request.options.is_some());
        assert!(request.frame_rate.is_none());
    }

    #[test]
    fn test_parse_invalid_json_and_unknown_type() {
        let err = ClientMessage::parse("{not json").unwrap_err();
        assert!(err.to_string().starts_with("Invalid JSON:"));

        let err = ClientMessage::parse(r#"{"type":"Reticulate"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Unknown message type");

        let err = ClientMessage::parse(r#"{"no_type":1}"#).unwrap_err();
        assert_eq!(err.to_string(), "Unknown message type");
    }

    #[test]
    fn test_server_message_json_shapes() {
        let json = serde_json::to_string(&ServerMessage::error("boom")).unwrap();
        assert_eq!(json, r#"{"type":"Error","message":"boom"}"#);

        let json = serde_json::to_string(&ServerMessage::SessionEnded {
            session_id: "abc123".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"SessionEnded","session_id":"abc123"}"#);
    }

    #[test]
    fn test_session_started_serializes_all_fields() {
        let started = SessionStarted {
            protocol: ProtocolInfo {
                version: PROTOCOL_VERSION,
            },
            session_id: "00ff".into(),
            model: "model.json".into(),
            options: SessionOptions {
                use_gpu_solver: true,
                execution_option: "SkinTongue".into(),
            },
            sampling_rate: 16_000,
            frame_rate: FrameRate {
                numerator: 60,
                denominator: 1,
            },
            weight_count: 2,
            channels: vec!["jawOpen".into(), "tongueOut".into()],
            channel_groups: vec![
                ChannelGroup {
                    name: "skin".into(),
                    count: 1,
                },
                ChannelGroup {
                    name: "tongue".into(),
                    count: 1,
                },
            ],
        };
        let value =
            serde_json::to_value(ServerMessage::SessionStarted(started)).unwrap();
        assert_eq!(value["type"], "SessionStarted");
        assert_eq!(value["protocol"]["version"], 1);
        assert_eq!(value["sampling_rate"], 16_000);
        assert_eq!(value["frame_rate"]["numerator"], 60);
        assert_eq!(value["frame_rate"]["denominator"], 1);
        assert_eq!(value["weight_count"], 2);
        assert_eq!(value["channels"].as_array().unwrap().len(), 2);
        assert_eq!(value["channel_groups"][0]["name"], "skin");
        assert_eq!(value["options"]["use_gpu_solver"], true);
    }
}
