//! HTTP upgrade handshake (RFC 6455 opening handshake)
//!
//! The server reads the request up to the blank line, requires
//! `Upgrade: websocket` plus a `Sec-WebSocket-Key`, and answers with the
//! literal 101 response. Anything else fails the connection.

use base64::engine::general_purpose;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use super::{WsSocket, MAX_HANDSHAKE_BYTES};
use crate::error::ServerError;

/// Fixed GUID appended to the client key, per RFC 6455 §1.3.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Derive the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(sec_websocket_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(sec_websocket_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    general_purpose::STANDARD.encode(hasher.finalize())
}

/// Extract the client key from a raw upgrade request.
///
/// Header names are matched case-insensitively. Returns the value of
/// `Sec-WebSocket-Key` once the request is confirmed to be a WebSocket
/// upgrade.
pub fn parse_upgrade_request(request: &str) -> Result<String, ServerError> {
    let mut sec_key: Option<String> = None;
    let mut is_websocket = false;

    for line in request.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            // Request line and any malformed header.
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        if name == "sec-websocket-key" {
            sec_key = Some(value.to_string());
        } else if name == "upgrade" && value.eq_ignore_ascii_case("websocket") {
            is_websocket = true;
        }
    }

    if !is_websocket {
        return Err(ServerError::Handshake(
            "request is not a WebSocket upgrade".into(),
        ));
    }
    match sec_key {
        Some(key) if !key.is_empty() => Ok(key),
        _ => Err(ServerError::Handshake(
            "missing Sec-WebSocket-Key header".into(),
        )),
    }
}

/// Run the server side of the opening handshake on a fresh connection.
pub fn perform_server_handshake(socket: &WsSocket) -> Result<(), ServerError> {
    let raw = socket.recv_until(b"\r\n\r\n", MAX_HANDSHAKE_BYTES)?;
    let request = String::from_utf8_lossy(&raw);
    let key = parse_upgrade_request(&request)?;

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(&key)
    );
    socket.send_all(response.as_bytes())?;
    Ok(())
}
