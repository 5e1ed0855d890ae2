//! Frame codec.
//!
//! Every message exchanged with the host is a [`Frame`]. On the wire a frame is a fixed
//! 12-byte header followed by a metadata section and the payload:
//!
//! ```text
//! +---------+------+-------+----------+---------------+---------------+
//! | version | kind | flags | reserved | metadata len  | payload len   |
//! |   u8    |  u8  |  u8   |   u8     |   u32 (BE)    |   u32 (BE)    |
//! +---------+------+-------+----------+---------------+---------------+
//! | metadata: bincode(id, status, headers)                            |
//! | payload: raw bytes                                                |
//! +-------------------------------------------------------------------+
//! ```
//!
//! The metadata section is encoded with the same big-endian, fixed-int bincode
//! configuration used everywhere else in the crate. A frame is only accepted when
//! every declared length matches what is actually present.
use std::{
    fmt, io,
    io::{Read, Write},
};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint, Limit},
    decode_from_slice, encode_to_vec,
};
use thiserror::Error;

pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 12;

/// Largest payload accepted by default: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 << 20;
/// Largest metadata section accepted, independent of the payload limit.
pub const MAX_METADATA: usize = 1 << 20;
/// Memory bincode may claim while decoding one metadata section. Decoded headers
/// take at most three times their encoded size.
const METADATA_DECODE_LIMIT: usize = 4 * MAX_METADATA;

/// Set on the final frame of an exchange.
pub const FLAG_END_OF_STREAM: u8 = 0b0000_0001;
/// Set on a Response frame whose body follows as StreamChunk frames.
pub const FLAG_STREAMED: u8 = 0b0000_0010;
const KNOWN_FLAGS: u8 = FLAG_END_OF_STREAM | FLAG_STREAMED;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode frame metadata: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode frame metadata: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("{0}")]
    Malformed(String),
    #[error("frame section of length {len} is too large (max {max})")]
    TooLarge { len: usize, max: usize },
    #[error("codec IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
    StreamChunk,
    StreamStop,
    Error,
}

impl TryFrom<u8> for FrameKind {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0x1 => Ok(FrameKind::Request),
            0x2 => Ok(FrameKind::Response),
            0x3 => Ok(FrameKind::StreamChunk),
            0x4 => Ok(FrameKind::StreamStop),
            0x5 => Ok(FrameKind::Error),
            kind => Err(CodecError::Malformed(format!("unknown frame kind {kind:#x}"))),
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(value: FrameKind) -> Self {
        match value {
            FrameKind::Request => 0x1,
            FrameKind::Response => 0x2,
            FrameKind::StreamChunk => 0x3,
            FrameKind::StreamStop => 0x4,
            FrameKind::Error => 0x5,
        }
    }
}

/// Correlation token tying responses and stream frames to a request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Header map where each name holds an ordered list of values. Names keep the order
/// in which they were first added.
#[derive(Debug, Default, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Headers(Vec<(String, Vec<String>)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|(n, _)| n == name)
    }

    /// Adds a value after any existing values for `name`.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.position(&name) {
            Some(i) => self.0[i].1.push(value.into()),
            None => self.0.push((name, vec![value.into()])),
        }
    }

    /// Replaces all values for `name`.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<String>) {
        let name = name.into();
        match self.position(&name) {
            Some(i) => self.0[i].1 = values,
            None => self.0.push((name, values)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.position(name).map(|i| self.0[i].1.as_slice())
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.position(name).map(|i| self.0.remove(i).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

/// A single unit of transfer on the duplex stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub id: RequestId,
    /// Response status; zero for every other kind.
    pub status: u16,
    pub flags: u8,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

impl Frame {
    fn new(kind: FrameKind, id: RequestId) -> Self {
        Self {
            kind,
            id,
            status: 0,
            flags: 0,
            headers: Headers::default(),
            payload: Vec::new(),
        }
    }

    pub fn request(id: RequestId, headers: Headers, body: Vec<u8>) -> Self {
        Self {
            headers,
            payload: body,
            ..Self::new(FrameKind::Request, id)
        }
    }

    pub fn response(id: RequestId, status: u16, headers: Headers, body: Vec<u8>, flags: u8) -> Self {
        Self {
            status,
            flags,
            headers,
            payload: body,
            ..Self::new(FrameKind::Response, id)
        }
    }

    pub fn chunk(id: RequestId, bytes: Vec<u8>) -> Self {
        Self {
            payload: bytes,
            ..Self::new(FrameKind::StreamChunk, id)
        }
    }

    /// Zero-length chunk closing a streamed body.
    pub fn end_marker(id: RequestId) -> Self {
        Self {
            flags: FLAG_END_OF_STREAM,
            ..Self::new(FrameKind::StreamChunk, id)
        }
    }

    pub fn stream_stop(id: RequestId) -> Self {
        Self::new(FrameKind::StreamStop, id)
    }

    pub fn error(id: RequestId, message: &str) -> Self {
        Self {
            payload: message.as_bytes().to_vec(),
            ..Self::new(FrameKind::Error, id)
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags & FLAG_END_OF_STREAM != 0
    }

    pub fn is_streamed(&self) -> bool {
        self.flags & FLAG_STREAMED != 0
    }

    pub fn is_end_marker(&self) -> bool {
        self.kind == FrameKind::StreamChunk && self.is_end_of_stream() && self.payload.is_empty()
    }
}

#[derive(Encode)]
struct MetadataRef<'a> {
    id: RequestId,
    status: u16,
    headers: &'a Headers,
}

#[derive(Decode)]
struct Metadata {
    id: RequestId,
    status: u16,
    headers: Headers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    kind: FrameKind,
    flags: u8,
    metadata_len: usize,
    payload_len: usize,
}

impl FrameHeader {
    fn body_len(&self) -> usize {
        self.metadata_len + self.payload_len
    }
}

/// Encodes and decodes [`Frame`]s.
#[derive(Clone, Copy)]
pub struct FrameCodec {
    config: Configuration<BigEndian, Fixint, Limit<METADATA_DECODE_LIMIT>>,
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding()
            .with_limit::<METADATA_DECODE_LIMIT>();
        Self {
            config,
            max_payload,
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, CodecError> {
        let metadata = encode_to_vec(
            MetadataRef {
                id: frame.id,
                status: frame.status,
                headers: &frame.headers,
            },
            self.config,
        )?;
        check_len(metadata.len(), MAX_METADATA)?;
        check_len(frame.payload.len(), self.max_payload)?;

        let mut out = Vec::with_capacity(HEADER_SIZE + metadata.len() + frame.payload.len());
        out.push(PROTOCOL_VERSION);
        out.push(frame.kind.into());
        out.push(frame.flags);
        out.push(0);
        out.extend_from_slice(&(metadata.len() as u32).to_be_bytes());
        out.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&metadata);
        out.extend_from_slice(&frame.payload);
        Ok(out)
    }

    /// Decodes the frame at the start of `buf`, returning it along with the number of
    /// bytes it occupied.
    pub fn decode(&self, buf: &[u8]) -> Result<(Frame, usize), CodecError> {
        if buf.len() < HEADER_SIZE {
            return Err(CodecError::Malformed(format!(
                "truncated header: {} of {HEADER_SIZE} bytes",
                buf.len()
            )));
        }
        let header = self.parse_header(&buf[..HEADER_SIZE])?;
        let total = HEADER_SIZE + header.body_len();
        if buf.len() < total {
            return Err(CodecError::Malformed(format!(
                "truncated frame: declared {total} bytes, got {}",
                buf.len()
            )));
        }

        let frame = self.assemble(header, &buf[HEADER_SIZE..total])?;
        Ok((frame, total))
    }

    /// Reads one frame from `reader`. Returns `None` when the stream ends cleanly on a
    /// frame boundary.
    pub fn read_frame<R: Read>(&self, reader: &mut R) -> Result<Option<Frame>, CodecError> {
        let mut head = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            match reader.read(&mut head[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(CodecError::Malformed(format!(
                        "stream closed inside frame header after {filled} bytes"
                    )));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let header = self.parse_header(&head)?;
        let mut body = vec![0u8; header.body_len()];
        reader.read_exact(&mut body).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => CodecError::Malformed(format!(
                "stream closed inside frame body of {} bytes",
                header.body_len()
            )),
            _ => CodecError::Io(e),
        })?;

        self.assemble(header, &body).map(Some)
    }

    pub fn write_frame<W: Write>(&self, writer: &mut W, frame: &Frame) -> Result<(), CodecError> {
        let bytes = self.encode(frame)?;
        writer.write_all(&bytes)?;
        Ok(())
    }

    fn parse_header(&self, head: &[u8]) -> Result<FrameHeader, CodecError> {
        if head[0] != PROTOCOL_VERSION {
            return Err(CodecError::Malformed(format!(
                "unsupported protocol version {}",
                head[0]
            )));
        }
        let kind = FrameKind::try_from(head[1])?;
        let flags = head[2];
        if flags & !KNOWN_FLAGS != 0 {
            return Err(CodecError::Malformed(format!("unknown frame flags {flags:#010b}")));
        }
        if head[3] != 0 {
            return Err(CodecError::Malformed("reserved header byte is set".into()));
        }

        let metadata_len = u32::from_be_bytes([head[4], head[5], head[6], head[7]]) as usize;
        let payload_len = u32::from_be_bytes([head[8], head[9], head[10], head[11]]) as usize;
        check_len(metadata_len, MAX_METADATA)?;
        check_len(payload_len, self.max_payload)?;

        Ok(FrameHeader {
            kind,
            flags,
            metadata_len,
            payload_len,
        })
    }

    fn assemble(&self, header: FrameHeader, body: &[u8]) -> Result<Frame, CodecError> {
        let (metadata, payload) = body.split_at(header.metadata_len);
        let (meta, read): (Metadata, usize) = decode_from_slice(metadata, self.config)?;
        if read != header.metadata_len {
            return Err(CodecError::Malformed(format!(
                "metadata declared {} bytes but decoded from {read}",
                header.metadata_len
            )));
        }

        Ok(Frame {
            kind: header.kind,
            id: meta.id,
            status: meta.status,
            flags: header.flags,
            headers: meta.headers,
            payload: payload.to_vec(),
        })
    }
}

fn check_len(len: usize, max: usize) -> Result<(), CodecError> {
    if len > max || len > u32::MAX as usize {
        return Err(CodecError::TooLarge { len, max });
    }
    Ok(())
}
