//! Wire packet model.
//!
//! ## Wire Format
//!
//! All multi-byte integers are big-endian. One frame:
//!
//! | Field        | Layout |
//! |--------------|--------|
//! | length       | `[4B total-frame-length = 19 + body_len]` |
//! | header       | `[opaque:4][cmd_type:1][version:2][extension:8][body_len:4]` |
//! | body         | `[body_len bytes]` |
//!
//! The opaque field is the correlation id: the sender assigns it, the
//! responder echoes it back. A value `<= 0` means "unassigned" and is filled
//! in by the client before transmission.

use crate::error::RemotingError;

/// Hard default ceiling on one frame's size (length prefix excluded).
pub const MAX_PACKET_BYTES: usize = 2 * 1024 * 1024;

/// Fixed header bytes following the 4-byte length prefix.
pub const PACKET_HEADER_LEN: usize = 4 + 1 + 2 + 8 + 4;

/// Sentinel for a not-yet-assigned correlation id.
pub const OPAQUE_UNSET: i32 = -1;

/// Protocol version stamped on outbound packets.
pub const PROTOCOL_VERSION: i16 = 1;

/// Fixed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Correlation id echoed in the response; `<= 0` means unassigned.
    pub opaque: i32,
    /// Application-defined command type.
    pub cmd_type: u8,
    /// Protocol version.
    pub version: i16,
    /// Reserved extension field.
    pub extension: i64,
    /// Body length in bytes.
    pub body_len: i32,
}

/// One decoded wire packet: fixed header plus raw body bytes.
///
/// The body is opaque to the transport; a [`crate::codec::PayloadCodec`]
/// turns it into a logical value at the orchestration layer.
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: PacketHeader,
    pub data: Vec<u8>,
}

/// Big-endian cursor over a byte slice; every `take_*` bounds-checks.
struct WireReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> WireReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn take_u8(&mut self) -> Result<u8, RemotingError> {
        if self.cursor + 1 > self.buf.len() {
            return Err(truncated(self.buf.len(), self.cursor + 1));
        }
        let v = self.buf[self.cursor];
        self.cursor += 1;
        Ok(v)
    }

    fn take_i16(&mut self) -> Result<i16, RemotingError> {
        let mut arr = [0u8; 2];
        self.take_into(&mut arr)?;
        Ok(i16::from_be_bytes(arr))
    }

    fn take_i32(&mut self) -> Result<i32, RemotingError> {
        let mut arr = [0u8; 4];
        self.take_into(&mut arr)?;
        Ok(i32::from_be_bytes(arr))
    }

    fn take_i64(&mut self) -> Result<i64, RemotingError> {
        let mut arr = [0u8; 8];
        self.take_into(&mut arr)?;
        Ok(i64::from_be_bytes(arr))
    }

    fn take_into(&mut self, out: &mut [u8]) -> Result<(), RemotingError> {
        if self.cursor + out.len() > self.buf.len() {
            return Err(truncated(self.buf.len(), self.cursor + out.len()));
        }
        out.copy_from_slice(&self.buf[self.cursor..self.cursor + out.len()]);
        self.cursor += out.len();
        Ok(())
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.cursor..]
    }
}

fn truncated(have: usize, need: usize) -> RemotingError {
    RemotingError::Protocol(format!("truncated input: need {need} bytes, have {have}"))
}

impl Packet {
    /// New request packet with an unassigned opaque.
    #[must_use]
    pub fn new(cmd_type: u8, data: Vec<u8>) -> Self {
        Self {
            header: PacketHeader {
                opaque: OPAQUE_UNSET,
                cmd_type,
                version: PROTOCOL_VERSION,
                extension: 0,
                body_len: data.len() as i32,
            },
            data,
        }
    }

    /// New response packet echoing `opaque`.
    #[must_use]
    pub fn response(opaque: i32, cmd_type: u8, data: Vec<u8>) -> Self {
        let mut p = Self::new(cmd_type, data);
        p.header.opaque = opaque;
        p
    }

    /// Wire length of this packet including the 4-byte length prefix.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        4 + PACKET_HEADER_LEN + self.data.len()
    }

    /// Serialize into full wire bytes (length prefix, header, body).
    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        let body_len = self.data.len();
        let mut buf = Vec::with_capacity(self.wire_len());
        buf.extend_from_slice(&((PACKET_HEADER_LEN + body_len) as i32).to_be_bytes());
        buf.extend_from_slice(&self.header.opaque.to_be_bytes());
        buf.push(self.header.cmd_type);
        buf.extend_from_slice(&self.header.version.to_be_bytes());
        buf.extend_from_slice(&self.header.extension.to_be_bytes());
        buf.extend_from_slice(&(body_len as i32).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Parse full wire bytes (length prefix included) with the default
    /// frame ceiling.
    ///
    /// # Errors
    ///
    /// [`RemotingError::Protocol`] on short input, a length prefix that
    /// disagrees with the remaining bytes, or an out-of-range body length.
    pub fn unmarshal(wire: &[u8]) -> Result<Self, RemotingError> {
        let mut r = WireReader::new(wire);
        let frame_len = r.take_i32()?;
        let rest = r.remaining();
        if frame_len < PACKET_HEADER_LEN as i32 || frame_len as usize != rest.len() {
            return Err(RemotingError::Protocol(format!(
                "length prefix {frame_len} disagrees with frame of {} bytes",
                rest.len()
            )));
        }
        Self::from_frame(rest, MAX_PACKET_BYTES)
    }

    /// Parse one frame's bytes (length prefix already consumed by the
    /// framing decoder).
    ///
    /// The body length is validated against `max_frame_bytes` before the
    /// body is copied out.
    ///
    /// # Errors
    ///
    /// [`RemotingError::Protocol`] on short input, a negative or oversize
    /// body length, or a body length that disagrees with the frame size.
    pub fn from_frame(frame: &[u8], max_frame_bytes: usize) -> Result<Self, RemotingError> {
        let mut r = WireReader::new(frame);
        let opaque = r.take_i32()?;
        let cmd_type = r.take_u8()?;
        let version = r.take_i16()?;
        let extension = r.take_i64()?;
        let body_len = r.take_i32()?;

        if body_len < 0 || body_len as usize > max_frame_bytes {
            return Err(RemotingError::Protocol(format!(
                "body length {body_len} out of range (max {max_frame_bytes})"
            )));
        }
        let body = r.remaining();
        if body.len() != body_len as usize {
            return Err(RemotingError::Protocol(format!(
                "body length field {body_len} disagrees with {} body bytes",
                body.len()
            )));
        }

        Ok(Self {
            header: PacketHeader {
                opaque,
                cmd_type,
                version,
                extension,
                body_len,
            },
            data: body.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut p = Packet::new(7, b"hello world".to_vec());
        p.header.opaque = 42;
        p.header.extension = -9;

        let wire = p.marshal();
        assert_eq!(wire.len(), 4 + PACKET_HEADER_LEN + 11);

        let back = Packet::unmarshal(&wire).unwrap();
        assert_eq!(back.header, p.header);
        assert_eq!(back.data, p.data);
    }

    #[test]
    fn roundtrip_empty_body() {
        let p = Packet::response(9, 1, Vec::new());
        let back = Packet::unmarshal(&p.marshal()).unwrap();
        assert_eq!(back.header.opaque, 9);
        assert!(back.data.is_empty());
    }

    #[test]
    fn new_packet_is_unassigned() {
        let p = Packet::new(1, vec![1, 2, 3]);
        assert_eq!(p.header.opaque, OPAQUE_UNSET);
        assert_eq!(p.header.body_len, 3);
        assert_eq!(p.header.version, PROTOCOL_VERSION);
    }

    #[test]
    fn short_input_is_protocol_error() {
        // anything under prefix + fixed header must fail
        for n in 0..(4 + PACKET_HEADER_LEN) {
            let wire = vec![0u8; n];
            assert!(
                matches!(Packet::unmarshal(&wire), Err(RemotingError::Protocol(_))),
                "length {n} should be rejected"
            );
        }
    }

    #[test]
    fn length_prefix_mismatch_rejected() {
        let mut wire = Packet::new(1, b"abc".to_vec()).marshal();
        // claim one byte more than is present
        let claimed = (PACKET_HEADER_LEN as i32 + 4).to_be_bytes();
        wire[..4].copy_from_slice(&claimed);
        assert!(matches!(
            Packet::unmarshal(&wire),
            Err(RemotingError::Protocol(_))
        ));
    }

    #[test]
    fn oversize_body_len_rejected_before_alloc() {
        let mut frame = vec![0u8; PACKET_HEADER_LEN];
        // body_len field at offset 15, claiming far beyond the ceiling
        frame[15..19].copy_from_slice(&(i32::MAX).to_be_bytes());
        assert!(matches!(
            Packet::from_frame(&frame, MAX_PACKET_BYTES),
            Err(RemotingError::Protocol(_))
        ));
    }

    #[test]
    fn negative_body_len_rejected() {
        let mut frame = vec![0u8; PACKET_HEADER_LEN];
        frame[15..19].copy_from_slice(&(-1i32).to_be_bytes());
        assert!(matches!(
            Packet::from_frame(&frame, MAX_PACKET_BYTES),
            Err(RemotingError::Protocol(_))
        ));
    }

    #[test]
    fn body_len_field_must_match_frame() {
        let p = Packet::new(1, b"abcd".to_vec());
        let wire = p.marshal();
        // strip the prefix, then lie about body_len
        let mut frame = wire[4..].to_vec();
        frame[15..19].copy_from_slice(&2i32.to_be_bytes());
        assert!(matches!(
            Packet::from_frame(&frame, MAX_PACKET_BYTES),
            Err(RemotingError::Protocol(_))
        ));
    }
}
