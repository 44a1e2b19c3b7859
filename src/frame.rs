//! The multiplexed output framing used by the container runtime.
//!
//! Each frame is an 8 byte header followed by its payload:
//!
//! ```text
//! [stream: u8] [0u8; 3] [length: u32 big-endian] [payload; length]
//! ```

use crate::decoder::DecodeError;
use std::convert::TryFrom;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn tag(self) -> u8 {
        match self {
            StreamKind::Stdout => 1,
            StreamKind::Stderr => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            // Stdin frames are written to stdout.
            0 | 1 => Ok(StreamKind::Stdout),
            2 => Ok(StreamKind::Stderr),
            other => Err(DecodeError::UnknownStream { tag: other }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub stream: StreamKind,
    pub len: usize,
}

impl Header {
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self, DecodeError> {
        let stream = StreamKind::from_tag(bytes[0])?;
        let len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        Ok(Header { stream, len })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: StreamKind,
    pub payload: Vec<u8>,
}

/// Splits a fully buffered output stream into its frames.
pub fn split(mut buf: &[u8]) -> Result<Vec<Frame>, DecodeError> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while !buf.is_empty() {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::TruncatedHeader {
                offset,
                available: buf.len(),
            });
        }

        let (head, rest) = buf.split_at(HEADER_LEN);
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(head);
        let header = Header::parse(&header)?;

        if rest.len() < header.len {
            return Err(DecodeError::TruncatedFrame {
                offset,
                declared: header.len,
                remaining: rest.len(),
            });
        }

        let (payload, rest) = rest.split_at(header.len);
        frames.push(Frame {
            stream: header.stream,
            payload: payload.to_vec(),
        });

        offset += HEADER_LEN + header.len;
        buf = rest;
    }

    Ok(frames)
}

/// Reads frames one at a time from an output stream.
pub struct FrameReader<'a, R: ?Sized> {
    inner: &'a mut R,
    offset: usize,
}

impl<'a, R> FrameReader<'a, R>
where
    R: AsyncRead + Unpin + ?Sized,
{
    pub fn new(inner: &'a mut R) -> Self {
        FrameReader { inner, offset: 0 }
    }

    /// Returns `None` once the stream ends on a frame boundary.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, DecodeError> {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = self
                .inner
                .read(&mut header[filled..])
                .await
                .map_err(|e| DecodeError::Read { source: e })?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(DecodeError::TruncatedHeader {
                    offset: self.offset,
                    available: filled,
                });
            }
            filled += n;
        }

        let header = Header::parse(&header)?;
        let mut payload = Vec::with_capacity(header.len.min(64 * 1024));
        (&mut *self.inner)
            .take(header.len as u64)
            .read_to_end(&mut payload)
            .await
            .map_err(|e| DecodeError::Read { source: e })?;

        if payload.len() < header.len {
            return Err(DecodeError::TruncatedFrame {
                offset: self.offset,
                declared: header.len,
                remaining: payload.len(),
            });
        }

        self.offset += HEADER_LEN + header.len;
        Ok(Some(Frame {
            stream: header.stream,
            payload,
        }))
    }
}

/// Encodes one frame. Payloads longer than `u32::MAX` are split.
pub fn encode_frame(stream: StreamKind, payload: &[u8], out: &mut Vec<u8>) {
    let max = u32::MAX as usize;
    let mut chunks = payload.chunks(max).peekable();
    if chunks.peek().is_none() {
        push_header(stream, 0, out);
        return;
    }

    for chunk in chunks {
        let len = u32::try_from(chunk.len()).unwrap_or(u32::MAX);
        push_header(stream, len, out);
        out.extend_from_slice(chunk);
    }
}

fn push_header(stream: StreamKind, len: u32, out: &mut Vec<u8>) {
    out.push(stream.tag());
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&len.to_be_bytes());
}
