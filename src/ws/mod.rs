//! Blocking WebSocket transport
//!
//! One OS thread owns each accepted connection; reads happen only on that
//! thread, while writes may also come from a session flushing staged frames,
//! so the write path is serialized behind a mutex to keep frames whole.

pub mod frame;
pub mod handshake;

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Mutex;

use crate::ws::frame::{Frame, Opcode};

/// Cap on the HTTP upgrade request.
pub const MAX_HANDSHAKE_BYTES: usize = 16 * 1024;

/// A connected WebSocket peer.
pub struct WsSocket {
    stream: TcpStream,
    write_lock: Mutex<()>,
}

impl WsSocket {
    /// Wrap an accepted stream; interactive traffic wants `TCP_NODELAY`.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            write_lock: Mutex::new(()),
        })
    }

    /// Write the whole buffer or fail.
    pub fn send_all(&self, buf: &[u8]) -> io::Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        (&self.stream).write_all(buf)
    }

    /// Read exactly `buf.len()` bytes or fail; short reads are retried
    /// until the count arrives or the peer closes.
    pub fn recv_all(&self, buf: &mut [u8]) -> io::Result<()> {
        (&self.stream).read_exact(buf)
    }

    /// Accumulate bytes until `delimiter` appears, failing once `max_bytes`
    /// have been read without a match.
    pub fn recv_until(&self, delimiter: &[u8], max_bytes: usize) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 1024];
        while out.len() < max_bytes {
            let received = (&self.stream).read(&mut chunk)?;
            if received == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed before the delimiter arrived",
                ));
            }
            out.extend_from_slice(&chunk[..received]);
            if out.windows(delimiter.len()).any(|window| window == delimiter) {
                return Ok(out);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no delimiter within the first {max_bytes} bytes"),
        ))
    }

    /// Read one complete frame, rejecting payloads above `max_payload`.
    /// The codec's exact-count reads go through `recv_all`.
    pub fn read_frame(&self, max_payload: usize) -> io::Result<Frame> {
        frame::read_frame(&mut ExactReader { socket: self }, max_payload)
    }

    /// Send one unmasked FIN frame as a single write.
    pub fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> io::Result<()> {
        self.send_all(&frame::encode_frame(opcode, payload))
    }
}

/// Adapter routing the frame codec's reads through `WsSocket::recv_all`.
/// Each `read` fills the whole buffer, which is exactly what the codec's
/// `read_exact` calls ask for.
struct ExactReader<'a> {
    socket: &'a WsSocket,
}

impl Read for ExactReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv_all(buf)?;
        Ok(buf.len())
    }
}

/// Bind the listening endpoint. `TcpListener::bind` sets address reuse on
/// Unix, so restarts do not trip over sockets in TIME_WAIT.
pub fn create_listener(host: &str, port: u16) -> io::Result<TcpListener> {
    TcpListener::bind((host, port))
}
