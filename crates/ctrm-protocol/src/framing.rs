//! Length-prefixed JSON framing (spec §4.1).
//!
//! Framing: 4-byte big-endian length `L`, then `L` bytes of UTF-8 JSON
//! payload. `L` is rejected above [`MAX_FRAME_SIZE`] by aborting the stream
//! with a protocol error, mirroring both the guest-agent and sidecar control
//! wire formats (they share this framing verbatim, per spec §6).

use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

/// Maximum frame payload size: 16 MiB (spec §3, §4.1).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Encode a value as a length-prefixed frame: 4-byte BE length + JSON body.
pub fn encode_message<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(value)?;
    if body.len() as u64 > MAX_FRAME_SIZE as u64 {
        return Err(Error::FrameTooLarge {
            len: body.len() as u32,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a single frame from a byte slice that already holds the full
/// length prefix and body (used by tests and by callers that batch reads
/// themselves). Returns the decoded value and the number of bytes consumed.
pub fn decode_message<T: DeserializeOwned>(buf: &[u8]) -> Result<(T, usize)> {
    if buf.len() < 4 {
        return Err(Error::UnexpectedEof);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }
    let total = 4 + len as usize;
    if buf.len() < total {
        return Err(Error::UnexpectedEof);
    }
    let value = serde_json::from_slice(&buf[4..total])?;
    Ok((value, total))
}

/// Read exactly `buf.len()` bytes, retrying on `EINTR` and briefly sleeping
/// and retrying on `EAGAIN`/`EWOULDBLOCK` (spec §4.1). EOF mid-frame is a
/// protocol error rather than a silent short read.
fn read_exact_resilient<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(Error::UnexpectedEof),
            Ok(n) => filled += n,
            Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
            Err(e) if e.kind() == IoErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}

/// Write the full buffer, looping on partial writes and retrying on
/// `EINTR`; any other error aborts (spec §4.1: writes are all-or-error).
fn write_all_resilient<W: Write>(writer: &mut W, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => {
                return Err(Error::Io(std::io::Error::new(
                    IoErrorKind::WriteZero,
                    "write returned 0",
                )))
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}

/// Read one framed JSON value from a blocking stream.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let mut len_buf = [0u8; 4];
    read_exact_resilient(reader, &mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut body = vec![0u8; len as usize];
    read_exact_resilient(reader, &mut body)?;
    let value = serde_json::from_slice(&body)?;
    Ok(value)
}

/// Write one framed JSON value to a blocking stream.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<()> {
    let encoded = encode_message(value)?;
    write_all_resilient(writer, &encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn round_trips_in_memory() {
        let value = Sample {
            a: 7,
            b: "hello".into(),
        };
        let encoded = encode_message(&value).unwrap();
        let (decoded, consumed): (Sample, usize) = decode_message(&encoded).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn rejects_oversize_without_panicking() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        let err = decode_message::<Sample>(&buf).unwrap_err();
        matches!(err, Error::FrameTooLarge { .. });
    }

    #[test]
    fn short_buffer_is_unexpected_eof() {
        let err = decode_message::<Sample>(&[0, 0, 0, 5, 1, 2]).unwrap_err();
        matches!(err, Error::UnexpectedEof);
    }

    #[test]
    fn stream_round_trip_over_a_pipe() {
        use std::io::Cursor;
        let value = Sample {
            a: 99,
            b: "stream".into(),
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &value).unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded: Sample = read_frame(&mut cursor).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn stream_read_rejects_oversize_length_prefix() {
        use std::io::Cursor;
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_SIZE + 10).to_be_bytes());
        let mut cursor = Cursor::new(buf);
        let err = read_frame::<_, Sample>(&mut cursor).unwrap_err();
        matches!(err, Error::FrameTooLarge { .. });
    }

    #[test]
    fn stream_eof_mid_frame_is_protocol_error() {
        use std::io::Cursor;
        let mut buf = Vec::new();
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.extend_from_slice(b"short");
        let mut cursor = Cursor::new(buf);
        let err = read_frame::<_, Sample>(&mut cursor).unwrap_err();
        matches!(err, Error::UnexpectedEof);
    }
}
