//! Wire-level packet layout.
//!
//! Every multi-byte integer on the wire is little-endian unsigned. Requests
//! and replies share a 4-byte header: one ASCII command byte followed by a
//! 3-byte reply id chosen by the client. The server echoes the reply id
//! verbatim on every packet belonging to the same transaction.

use bytes::{BufMut, BytesMut};

/// Minimum length of any frame: command byte plus reply id.
pub const HEADER_LEN: usize = 4;

/// A 24-bit client-chosen transaction correlator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rid(pub [u8; 3]);

impl Rid {
    /// Extracts the reply id from a frame. Caller must have checked that at
    /// least [`HEADER_LEN`] bytes are present.
    pub fn from_frame(buf: &[u8]) -> Self {
        Rid([buf[1], buf[2], buf[3]])
    }

    pub fn as_u32(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], 0])
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:06x}", self.as_u32())
    }
}

/// Reads a little-endian u32 at `off`. Callers check frame length first; the
/// dispatcher rejects short frames with `EINVAL` before decoding fields.
pub fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Writes a little-endian u32 at `off`.
pub fn write_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn header(out: &mut BytesMut, cmd: u8, rid: Rid) {
    out.put_u8(cmd);
    out.put_slice(&rid.0);
}

/// `R` frame: command result with an opaque payload.
pub fn reply_frame(rid: Rid, payload: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    header(&mut out, b'R', rid);
    out.put_slice(payload);
    out
}

/// `E` frame: error result. `code` is the low 8 bits of a POSIX-family
/// error number, padded to 8 bytes total.
pub fn error_frame(rid: Rid, code: u8) -> [u8; 8] {
    [b'E', rid.0[0], rid.0[1], rid.0[2], code, 0, 0, 0]
}

/// `D` frame: raw data reply (handle-framing READ).
pub fn data_frame(rid: Rid, data: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(HEADER_LEN + data.len());
    header(&mut out, b'D', rid);
    out.put_slice(data);
    out
}

/// `w` frame: request for client data, window `[rel_pos, rel_end)` relative
/// to the transfer start.
pub fn data_request_frame(rid: Rid, rel_pos: u32, rel_end: u32) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0] = b'w';
    out[1..4].copy_from_slice(&rid.0);
    write_u32(&mut out, 4, rel_pos);
    write_u32(&mut out, 8, 0);
    write_u32(&mut out, 12, rel_end);
    out
}

/// `S`+`B` compound frame carrying file data: header, the data itself, then
/// a 12-byte trailer restating the length and the new file position.
pub fn read_reply(rid: Rid, data: &[u8], new_pos: u32) -> BytesMut {
    let mut out = BytesMut::with_capacity(HEADER_LEN * 2 + 8 + data.len() + 8);
    header(&mut out, b'S', rid);
    out.put_u32_le(data.len() as u32);
    out.put_u32_le(0x0C);
    out.put_slice(data);
    header(&mut out, b'B', rid);
    out.put_u32_le(data.len() as u32);
    out.put_u32_le(new_pos);
    out
}

/// `S`+`B` compound frame carrying a directory catalogue. `trailer` is the
/// framing-specific word sequence; its length on the wire includes the `B`
/// header, which is how the client learns where the entries stop.
pub fn catalogue_reply(rid: Rid, entries: &[u8], trailer: &[u32]) -> BytesMut {
    let trailer_len = HEADER_LEN + trailer.len() * 4;
    let mut out = BytesMut::with_capacity(HEADER_LEN + 8 + entries.len() + trailer_len);
    header(&mut out, b'S', rid);
    out.put_u32_le(entries.len() as u32);
    out.put_u32_le(trailer_len as u32);
    out.put_slice(entries);
    header(&mut out, b'B', rid);
    for word in trailer {
        out.put_u32_le(*word);
    }
    out
}
