//! Frame wire format
//!
//! Every frame starts with a 16-byte prefix: the header length and its
//! hash, both big-endian u64. The header payload carries length-prefixed
//! bucket/objname/opaque fields followed by the session id and the
//! object size; exactly `dsize` payload bytes follow the header. A frame
//! whose `dsize` equals [`LAST_MARKER`] terminates the session and
//! carries no payload.
//!
//! ```text
//! +------------+------------------------------+
//! | hlen:u64   | hash:u64 = hash64(hlen)      |
//! +------------+------------------------------+
//! | bucket:  u64 len | bytes                  |
//! | objname: u64 len | bytes                  |
//! | opaque:  u64 len | bytes                  |
//! | sessid:  u64                              |
//! | dsize:   u64                              |
//! +-------------------------------------------+
//! | object payload: exactly dsize bytes       |
//! +-------------------------------------------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

/// Maximum header length; identical on the send and receive side
pub const MAX_HEADER_SIZE: usize = 1024;

/// Size of one wire word
pub const SIZEOF_U64: usize = 8;

/// `dsize` sentinel marking the last frame of a session. Far outside the
/// valid object-size range, so zero-byte objects remain legal frames.
pub const LAST_MARKER: u64 = u64::MAX;

/// xoshiro256-family seeding hash guarding the header-length word.
/// Both ends of the wire must agree on it.
#[must_use]
pub fn hash64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Object header as carried on the wire
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjHdr {
    pub bucket: String,
    pub objname: String,
    pub opaque: Vec<u8>,
    pub dsize: u64,
}

impl ObjHdr {
    #[must_use]
    pub fn new(bucket: impl Into<String>, objname: impl Into<String>, dsize: u64) -> Self {
        Self { bucket: bucket.into(), objname: objname.into(), opaque: Vec::new(), dsize }
    }

    /// Whether this header marks the end of its session
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.dsize == LAST_MARKER
    }

    /// Length of the serialized header payload (prefix words excluded)
    #[must_use]
    pub fn serialized_len(&self) -> usize {
        5 * SIZEOF_U64 + self.bucket.len() + self.objname.len() + self.opaque.len()
    }
}

/// Serialize one frame header (prefix words included); the caller sends
/// exactly `hdr.dsize` payload bytes right after.
pub fn serialize_frame(hdr: &ObjHdr, sessid: u64) -> std::io::Result<Bytes> {
    let hlen = hdr.serialized_len();
    if hlen > MAX_HEADER_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("header length {hlen} exceeds {MAX_HEADER_SIZE}"),
        ));
    }
    let mut buf = BytesMut::with_capacity(hlen + 2 * SIZEOF_U64);
    buf.put_u64(hlen as u64);
    buf.put_u64(hash64(hlen as u64));
    put_bytes(&mut buf, hdr.bucket.as_bytes());
    put_bytes(&mut buf, hdr.objname.as_bytes());
    put_bytes(&mut buf, &hdr.opaque);
    buf.put_u64(sessid);
    buf.put_u64(hdr.dsize);
    Ok(buf.freeze())
}

/// Serialize the session-terminating frame
#[must_use]
pub fn serialize_last(sessid: u64) -> Bytes {
    let hdr = ObjHdr { dsize: LAST_MARKER, ..ObjHdr::default() };
    serialize_frame(&hdr, sessid).expect("empty last-frame header always fits")
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u64(b.len() as u64);
    buf.put_slice(b);
}

/// Parse a header payload (the `hlen` bytes after the prefix words).
/// Returns `None` when the buffer does not decode cleanly to its end.
#[must_use]
pub fn ext_headers(buf: &[u8]) -> Option<(ObjHdr, u64)> {
    let mut off = 0;
    let bucket = String::from_utf8(ext_bytes(buf, &mut off)?.to_vec()).ok()?;
    let objname = String::from_utf8(ext_bytes(buf, &mut off)?.to_vec()).ok()?;
    let opaque = ext_bytes(buf, &mut off)?.to_vec();
    let sessid = ext_u64(buf, &mut off)?;
    let dsize = ext_u64(buf, &mut off)?;
    if off != buf.len() {
        return None;
    }
    Some((ObjHdr { bucket, objname, opaque, dsize }, sessid))
}

fn ext_u64(buf: &[u8], off: &mut usize) -> Option<u64> {
    let end = off.checked_add(SIZEOF_U64)?;
    let bytes: [u8; 8] = buf.get(*off..end)?.try_into().ok()?;
    *off = end;
    Some(u64::from_be_bytes(bytes))
}

fn ext_bytes<'a>(buf: &'a [u8], off: &mut usize) -> Option<&'a [u8]> {
    let len = usize::try_from(ext_u64(buf, off)?).ok()?;
    let end = off.checked_add(len)?;
    let slice = buf.get(*off..end)?;
    *off = end;
    Some(slice)
}
