//! RFC 6455 frame codec, no extensions, no fragmentation
//!
//! ```text
//! ┌─────────────┬──────────────────┬────────────┬─────────────┐
//! │ FIN+opcode  │ MASK + 7-bit len │ ext length │ [mask key]  │
//! │  (1 byte)   │     (1 byte)     │ (0/2/8 B)  │  (0/4 B)    │
//! └─────────────┴──────────────────┴────────────┴─────────────┘
//! ```
//!
//! Client frames arrive masked per the standard; server frames are sent
//! unmasked. The length cap is enforced before any payload allocation.

use std::io::{self, Read, Write};

/// Frame opcodes understood by this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xa,
}

impl Opcode {
    fn from_nibble(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xa => Some(Opcode::Pong),
            _ => None,
        }
    }
}

/// A single complete (FIN) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Read one frame from the wire.
pub fn read_frame<R: Read>(reader: &mut R, max_payload: usize) -> io::Result<Frame> {
    let mut header = [0u8; 2];
    reader.read_exact(&mut header)?;

    let fin = header[0] & 0x80 != 0;
    let opcode = Opcode::from_nibble(header[0] & 0x0f).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported opcode 0x{:x}", header[0] & 0x0f),
        )
    })?;
    let masked = header[1] & 0x80 != 0;
    let mut payload_len = u64::from(header[1] & 0x7f);

    if !fin {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "fragmented frames are not supported",
        ));
    }

    if payload_len == 126 {
        let mut ext = [0u8; 2];
        reader.read_exact(&mut ext)?;
        payload_len = u64::from(u16::from_be_bytes(ext));
    } else if payload_len == 127 {
        let mut ext = [0u8; 8];
        reader.read_exact(&mut ext)?;
        payload_len = u64::from_be_bytes(ext);
    }

    if payload_len > max_payload as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame payload of {payload_len} bytes exceeds the {max_payload} byte cap"),
        ));
    }

    let mut mask_key = [0u8; 4];
    if masked {
        reader.read_exact(&mut mask_key)?;
    }

    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload)?;

    if masked {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask_key[i % 4];
        }
    }

    Ok(Frame { opcode, payload })
}

/// Encode one unmasked FIN frame. Server-to-client frames are never masked
/// per the standard.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(10 + payload.len());
    frame.push(0x80 | (opcode as u8 & 0x0f));
    if payload.len() <= 125 {
        frame.push(payload.len() as u8);
    } else if payload.len() <= 0xffff {
        frame.push(126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }
    frame.extend_from_slice(payload);
    frame
}

/// Encode and write one frame.
pub fn write_frame<W: Write>(writer: &mut W, opcode: Opcode, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&encode_frame(opcode, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(opcode: Opcode, payload: &[u8]) -> Frame {
        let encoded = encode_frame(opcode, payload);
        let mut cursor = Cursor::new(encoded);
        read_frame(&mut cursor, payload.len()).unwrap()
    }

    fn encode_masked(opcode: Opcode, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.push(0x80 | (opcode as u8 & 0x0f));
        if payload.len() <= 125 {
            frame.push(0x80 | payload.len() as u8);
        } else if payload.len() <= 0xffff {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        frame.extend_from_slice(&key);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        frame
    }

    #[test]
    fn test_round_trip_at_length_boundaries() {
        for len in [0usize, 1, 125, 126, 65535, 65536] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            for opcode in [Opcode::Text, Opcode::Binary] {
                let frame = round_trip(opcode, &payload);
                assert_eq!(frame.opcode, opcode, "len {len}");
                assert_eq!(frame.payload, payload, "len {len}");
            }
        }
    }

    #[test]
    fn test_masked_payload_is_unmasked_on_read() {
        let payload = b"binary audio chunk".to_vec();
        let encoded = encode_masked(Opcode::Binary, &payload, [0x12, 0x34, 0x56, 0x78]);
        let frame = read_frame(&mut Cursor::new(encoded), 1024).unwrap();
        assert_eq!(frame.opcode, Opcode::Binary);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_fragmented_frame_is_rejected() {
        // FIN bit cleared on a text frame.
        let bytes = vec![0x01, 0x02, b'h', b'i'];
        let err = read_frame(&mut Cursor::new(bytes), 1024).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_unknown_opcode_is_rejected() {
        let bytes = vec![0x83, 0x00];
        assert!(read_frame(&mut Cursor::new(bytes), 1024).is_err());
    }

    #[test]
    fn test_payload_at_cap_accepted_and_cap_plus_one_rejected() {
        let payload = vec![0u8; 126];
        let encoded = encode_frame(Opcode::Binary, &payload);
        assert!(read_frame(&mut Cursor::new(encoded.clone()), 126).is_ok());
        assert!(read_frame(&mut Cursor::new(encoded), 125).is_err());
    }

    #[test]
    fn test_oversize_length_rejected_before_reading_body() {
        // 64-bit length of u64::MAX with no body at all: the cap check must
        // fire before any payload read or allocation.
        let mut bytes = vec![0x82, 127];
        bytes.extend_from_slice(&u64::MAX.to_be_bytes());
        let err = read_frame(&mut Cursor::new(bytes), 4 * 1024 * 1024).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_write_frame_matches_encode() {
        let mut out = Vec::new();
        write_frame(&mut out, Opcode::Text, b"ping").unwrap();
        assert_eq!(out, encode_frame(Opcode::Text, b"ping"));
    }
}
