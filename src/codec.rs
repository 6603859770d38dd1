//! Pluggable framing and payload codecs.
//!
//! Two capabilities live here, deliberately separate:
//!
//! - [`FrameCodec`] turns a byte stream into discrete frames and back. It is
//!   per-session state (a decoder may buffer) and its failures are fatal to
//!   the session: once framing is corrupt the stream position is
//!   unrecoverable.
//! - [`PayloadCodec`] turns a frame body into a logical value and back. It
//!   is stateless and shared; its failures are scoped to one packet.

use std::io::{BufRead, Read};
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::RemotingError;
use crate::packet::{Packet, PACKET_HEADER_LEN};

/// Framing capability: one frame in, one frame out.
pub trait FrameCodec: Send {
    /// Read exactly one complete frame's raw bytes from the stream.
    ///
    /// # Errors
    ///
    /// `Protocol` for framing violations (bad length field), `Io` for
    /// stream failures. Both are fatal to the session.
    fn read_frame(&mut self, reader: &mut dyn BufRead) -> Result<Vec<u8>, RemotingError>;

    /// Decode one raw frame into a packet.
    ///
    /// # Errors
    ///
    /// `Protocol` if the frame does not parse; fatal to the session.
    fn decode(&mut self, frame: Vec<u8>) -> Result<Packet, RemotingError>;

    /// Encode a packet into its full wire bytes.
    ///
    /// # Errors
    ///
    /// `Codec` if the packet cannot be represented in this framing; local
    /// to the packet.
    fn encode(&mut self, packet: &Packet) -> Result<Vec<u8>, RemotingError>;
}

/// Reads a big-endian 4-byte length prefix, validates it against `max`
/// strictly before allocating, then reads that many bytes.
fn read_length_prefixed(
    reader: &mut dyn BufRead,
    max: usize,
) -> Result<Vec<u8>, RemotingError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = i32::from_be_bytes(len_buf);
    if len <= 0 {
        return Err(RemotingError::Protocol(format!("frame length {len} <= 0")));
    }
    if len as usize > max {
        return Err(RemotingError::Protocol(format!(
            "frame length {len} exceeds max {max}"
        )));
    }
    let mut frame = vec![0u8; len as usize];
    reader.read_exact(&mut frame)?;
    Ok(frame)
}

/// Default framing: 4-byte length prefix followed by the 19-byte fixed
/// header and the body.
#[derive(Debug, Clone)]
pub struct HeaderFrameCodec {
    pub max_frame_bytes: usize,
}

impl HeaderFrameCodec {
    #[must_use]
    pub const fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl FrameCodec for HeaderFrameCodec {
    fn read_frame(&mut self, reader: &mut dyn BufRead) -> Result<Vec<u8>, RemotingError> {
        read_length_prefixed(reader, PACKET_HEADER_LEN + self.max_frame_bytes)
    }

    fn decode(&mut self, frame: Vec<u8>) -> Result<Packet, RemotingError> {
        Packet::from_frame(&frame, self.max_frame_bytes)
    }

    fn encode(&mut self, packet: &Packet) -> Result<Vec<u8>, RemotingError> {
        if packet.data.len() > self.max_frame_bytes {
            return Err(RemotingError::Codec(format!(
                "body of {} bytes exceeds max frame {}",
                packet.data.len(),
                self.max_frame_bytes
            )));
        }
        Ok(packet.marshal())
    }
}

/// Bare length-prefixed framing: 4-byte prefix, body only, no header.
///
/// Decoded packets carry default header fields; correlation, if any, is the
/// application's business.
#[derive(Debug, Clone)]
pub struct RawFrameCodec {
    pub max_frame_bytes: usize,
}

impl RawFrameCodec {
    #[must_use]
    pub const fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl FrameCodec for RawFrameCodec {
    fn read_frame(&mut self, reader: &mut dyn BufRead) -> Result<Vec<u8>, RemotingError> {
        read_length_prefixed(reader, self.max_frame_bytes)
    }

    fn decode(&mut self, frame: Vec<u8>) -> Result<Packet, RemotingError> {
        Ok(Packet::new(0, frame))
    }

    fn encode(&mut self, packet: &Packet) -> Result<Vec<u8>, RemotingError> {
        if packet.data.is_empty() || packet.data.len() > self.max_frame_bytes {
            return Err(RemotingError::Codec(format!(
                "raw frame body of {} bytes out of range",
                packet.data.len()
            )));
        }
        let mut wire = Vec::with_capacity(4 + packet.data.len());
        wire.extend_from_slice(&(packet.data.len() as i32).to_be_bytes());
        wire.extend_from_slice(&packet.data);
        Ok(wire)
    }
}

/// Newline-delimited text framing. The trailing `\n` (and an optional
/// `\r`) is stripped on read and appended on write.
#[derive(Debug, Clone)]
pub struct LineFrameCodec {
    pub max_line_bytes: usize,
}

impl LineFrameCodec {
    #[must_use]
    pub const fn new(max_line_bytes: usize) -> Self {
        Self { max_line_bytes }
    }
}

impl FrameCodec for LineFrameCodec {
    fn read_frame(&mut self, reader: &mut dyn BufRead) -> Result<Vec<u8>, RemotingError> {
        let mut line = Vec::new();
        let n = reader.take(self.max_line_bytes as u64 + 1).read_until(b'\n', &mut line)?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        if line.last() != Some(&b'\n') {
            return Err(RemotingError::Protocol(format!(
                "line exceeds max {} bytes or stream ended mid-line",
                self.max_line_bytes
            )));
        }
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(line)
    }

    fn decode(&mut self, frame: Vec<u8>) -> Result<Packet, RemotingError> {
        Ok(Packet::new(0, frame))
    }

    fn encode(&mut self, packet: &Packet) -> Result<Vec<u8>, RemotingError> {
        if packet.data.contains(&b'\n') {
            return Err(RemotingError::Codec(
                "line frame body may not contain a newline".into(),
            ));
        }
        let mut wire = Vec::with_capacity(packet.data.len() + 1);
        wire.extend_from_slice(&packet.data);
        wire.push(b'\n');
        Ok(wire)
    }
}

/// Payload capability: frame body bytes <-> logical value.
pub trait PayloadCodec: Send + Sync + 'static {
    /// Logical value this codec produces and consumes.
    type Value: Send + 'static;

    /// # Errors
    ///
    /// `Codec` if the value cannot be serialized.
    fn marshal(&self, value: &Self::Value) -> Result<Vec<u8>, RemotingError>;

    /// # Errors
    ///
    /// `Codec` if the bytes do not parse.
    fn unmarshal(&self, bytes: &[u8]) -> Result<Self::Value, RemotingError>;
}

/// Identity codec for services that speak raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl PayloadCodec for BytesCodec {
    type Value = Vec<u8>;

    fn marshal(&self, value: &Vec<u8>) -> Result<Vec<u8>, RemotingError> {
        Ok(value.clone())
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<Vec<u8>, RemotingError> {
        Ok(bytes.to_vec())
    }
}

/// JSON payload codec over any serde-able value type.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PayloadCodec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Value = T;

    fn marshal(&self, value: &T) -> Result<Vec<u8>, RemotingError> {
        serde_json::to_vec(value).map_err(|e| RemotingError::Codec(e.to_string()))
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<T, RemotingError> {
        serde_json::from_slice(bytes).map_err(|e| RemotingError::Codec(e.to_string()))
    }
}
