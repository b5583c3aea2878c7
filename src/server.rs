//! Accept loop and per-connection protocol dispatcher
//!
//! The main thread accepts; each connection gets its own detached worker
//! thread that performs the handshake and then loops over frames. Control
//! messages are dispatched here; audio is handed to the bound session,
//! which reports its own failures to the client.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::protocol::{self, ClientMessage, ServerMessage, SessionStarted, StartSessionRequest};
use crate::session::pool::SessionPool;
use crate::ws::frame::Opcode;
use crate::ws::{self, handshake, WsSocket};

/// Largest accepted message payload.
pub const MAX_PAYLOAD_BYTES: usize = 4 * 1024 * 1024;

/// Listening server: the bound socket, the session pool, and the shutdown
/// flag polled by the accept loop.
pub struct Server {
    listener: TcpListener,
    pool: Arc<SessionPool>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Bind the listening endpoint.
    pub fn bind(config: &ServerConfig, pool: SessionPool) -> Result<Self> {
        let listener = ws::create_listener(&config.host, config.port)
            .with_context(|| format!("Failed to bind/listen on {}:{}", config.host, config.port))?;
        Ok(Self {
            listener,
            pool: Arc::new(pool),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The bound address (the port matters when binding port 0 in tests).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Flag that stops the accept loop when set; wire it to SIGINT/SIGTERM.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Accept connections until the shutdown flag is set, spawning one
    /// detached worker thread per connection.
    pub fn run(&self) -> Result<()> {
        // Non-blocking accept so the loop can observe the shutdown flag.
        self.listener.set_nonblocking(true)?;

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nonblocking(false)?;
                    debug!(%addr, "accepted connection");
                    let pool = Arc::clone(&self.pool);
                    thread::spawn(move || {
                        if let Err(err) = handle_connection(stream, &pool) {
                            debug!(error = %err, "connection ended with error");
                        }
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }

        info!("accept loop stopped");
        Ok(())
    }
}

/// One connection worker: handshake, dispatch loop, release on exit.
fn handle_connection(stream: TcpStream, pool: &SessionPool) -> Result<(), ServerError> {
    let socket = Arc::new(WsSocket::new(stream)?);
    handshake::perform_server_handshake(&socket)?;

    let mut session_index: Option<usize> = None;
    let result = connection_loop(&socket, pool, &mut session_index);

    // Whatever ended the loop, the session goes back to the pool.
    if let Some(idx) = session_index {
        pool.release(idx);
    }
    result
}

fn connection_loop(
    socket: &Arc<WsSocket>,
    pool: &SessionPool,
    session_index: &mut Option<usize>,
) -> Result<(), ServerError> {
    loop {
        let frame = match socket.read_frame(MAX_PAYLOAD_BYTES) {
            Ok(frame) => frame,
            Err(err) => {
                // Peer closed, or an unreadable frame; either way the
                // connection is done.
                debug!(error = %err, "read failed, closing connection");
                return Ok(());
            }
        };

        match frame.opcode {
            Opcode::Ping => {
                socket.send_frame(Opcode::Pong, &frame.payload)?;
            }
            Opcode::Close => {
                let _ = socket.send_frame(Opcode::Close, &[]);
                return Ok(());
            }
            Opcode::Text => {
                handle_text(socket, pool, session_index, &frame.payload)?;
            }
            Opcode::Binary => {
                handle_binary(socket, pool, session_index, &frame.payload)?;
            }
            Opcode::Pong | Opcode::Continuation => {}
        }
    }
}

fn handle_text(
    socket: &Arc<WsSocket>,
    pool: &SessionPool,
    session_index: &mut Option<usize>,
    payload: &[u8],
) -> Result<(), ServerError> {
    let text = String::from_utf8_lossy(payload);
    let message = match ClientMessage::parse(&text) {
        Ok(message) => message,
        Err(err) => {
            return send_error(socket, &err);
        }
    };

    match message {
        ClientMessage::StartSession(request) => {
            if session_index.is_some() {
                return send_error(
                    socket,
                    &ServerError::SessionState(
                        "Session already started for this connection".into(),
                    ),
                );
            }
            let Some(idx) = pool.acquire(Arc::clone(socket)) else {
                return send_error(
                    socket,
                    &ServerError::Capacity("Server busy (no free sessions)".into()),
                );
            };
            let started = pool.get(idx).describe_session_started();
            if let Err(err) = validate_start_session(&request, &started) {
                pool.release(idx);
                return send_error(socket, &err);
            }
            *session_index = Some(idx);
            send_message(socket, &ServerMessage::SessionStarted(started))
        }
        ClientMessage::EndSession(request) => {
            let Some(idx) = *session_index else {
                return send_error(
                    socket,
                    &ServerError::SessionState("No active session for this connection".into()),
                );
            };
            let session_id = pool.get(idx).session_id();
            if let Some(requested) = &request.session_id {
                let Some(requested) = requested.as_str() else {
                    return send_error(
                        socket,
                        &ServerError::Protocol("EndSession.session_id must be a string".into()),
                    );
                };
                if requested != session_id {
                    return send_error(
                        socket,
                        &ServerError::SessionState(
                            "EndSession.session_id does not match active session".into(),
                        ),
                    );
                }
            }
            pool.release(idx);
            *session_index = None;
            send_message(socket, &ServerMessage::SessionEnded { session_id })
        }
    }
}

fn handle_binary(
    socket: &Arc<WsSocket>,
    pool: &SessionPool,
    session_index: &mut Option<usize>,
    payload: &[u8],
) -> Result<(), ServerError> {
    let Some(idx) = *session_index else {
        return send_error(
            socket,
            &ServerError::SessionState("StartSession must be called before PushAudio".into()),
        );
    };
    let push = match protocol::decode_push_audio(payload) {
        Ok(push) => push,
        Err(err) => {
            return send_error(socket, &err);
        }
    };
    // Best effort: the session reports its own failures to the client.
    if let Err(err) = pool.get(idx).push_audio(push.start_sample_index, push.pcm) {
        debug!(error = %err, "push_audio failed");
    }
    Ok(())
}

fn send_message(socket: &WsSocket, message: &ServerMessage) -> Result<(), ServerError> {
    let text = serde_json::to_string(message)
        .map_err(|err| ServerError::Protocol(format!("failed to encode message: {err}")))?;
    socket.send_frame(Opcode::Text, text.as_bytes())?;
    Ok(())
}

/// Surface a non-fatal error to the client as an `Error` message.
fn send_error(socket: &WsSocket, err: &ServerError) -> Result<(), ServerError> {
    send_message(socket, &ServerMessage::from(err))
}

/// Canonicalize a model path for comparison: forward slashes, trimmed
/// whitespace and trailing slashes, leading `./` stripped, lowercased only
/// on case-insensitive filesystems.
fn canonicalize_model_path(path: &str) -> String {
    let mut s = path.trim().replace('\\', "/");
    if cfg!(windows) {
        s = s.to_lowercase();
    }
    while s.ends_with('/') {
        s.pop();
    }
    let s = s.trim();
    s.strip_prefix("./").unwrap_or(s).to_string()
}

/// Lowercase and keep alphanumerics only, so "Skin_Tongue" and "skintongue"
/// compare equal.
fn canonicalize_execution_option(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Parse a client frame-rate hint: a positive integer fps, or an object
/// with positive numerator and denominator.
fn parse_frame_rate(value: &Value) -> Result<(u64, u64), ServerError> {
    if let Some(fps) = value.as_i64() {
        if fps <= 0 {
            return Err(ServerError::Validation("fps must be > 0".into()));
        }
        return Ok((fps as u64, 1));
    }
    if let Some(object) = value.as_object() {
        let (Some(numerator), Some(denominator)) =
            (object.get("numerator"), object.get("denominator"))
        else {
            return Err(ServerError::Validation(
                "frame_rate must contain numerator and denominator".into(),
            ));
        };
        let (Some(numerator), Some(denominator)) = (numerator.as_i64(), denominator.as_i64())
        else {
            return Err(ServerError::Validation(
                "frame_rate numerator/denominator must be integers".into(),
            ));
        };
        if numerator <= 0 || denominator <= 0 {
            return Err(ServerError::Validation(
                "frame_rate numerator/denominator must be > 0".into(),
            ));
        }
        return Ok((numerator as u64, denominator as u64));
    }
    Err(ServerError::Validation(
        "fps must be an integer or an object {numerator,denominator}".into(),
    ))
}

/// Check the client's StartSession hints against the session's advertised
/// configuration. Unknown fields were already dropped at parse time.
fn validate_start_session(
    request: &StartSessionRequest,
    started: &SessionStarted,
) -> Result<(), ServerError> {
    if let Some(model) = &request.model {
        let Some(model) = model.as_str() else {
            return Err(ServerError::Validation(
                "StartSession.model must be a string".into(),
            ));
        };
        let requested = canonicalize_model_path(model);
        let actual = canonicalize_model_path(&started.model);
        if !actual.is_empty() && requested != actual {
            return Err(ServerError::Validation(
                "Requested model does not match server model".into(),
            ));
        }
    }

    if let Some(value) = request.frame_rate.as_ref().or(request.fps.as_ref()) {
        let (req_num, req_den) = parse_frame_rate(value)?;
        let num = started.frame_rate.numerator as u64;
        let den = started.frame_rate.denominator as u64;
        if req_num != num || req_den != den {
            return Err(ServerError::Validation(format!(
                "Requested frame_rate {req_num}/{req_den} does not match server {num}/{den}"
            )));
        }
    }

    if let Some(options) = &request.options {
        let Some(options) = options.as_object() else {
            return Err(ServerError::Validation(
                "StartSession.options must be an object".into(),
            ));
        };
        if let Some(gpu) = options.get("use_gpu_solver") {
            let Some(gpu) = gpu.as_bool() else {
                return Err(ServerError::Validation(
                    "options.use_gpu_solver must be boolean".into(),
                ));
            };
            if gpu != started.options.use_gpu_solver {
                return Err(ServerError::Validation(
                    "options.use_gpu_solver does not match server".into(),
                ));
            }
        }
        if let Some(exec) = options.get("execution_option") {
            let Some(exec) = exec.as_str() else {
                return Err(ServerError::Validation(
                    "options.execution_option must be a string".into(),
                ));
            };
            let requested = canonicalize_execution_option(exec);
            let actual = canonicalize_execution_option(&started.options.execution_option);
            if !actual.is_empty() && requested != actual {
                return Err(ServerError::Validation(
                    "options.execution_option does not match server".into(),
                ));
            }
        }
    }

    Ok(())
}
