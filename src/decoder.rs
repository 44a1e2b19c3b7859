//! Demultiplexes the runtime's framed output into an [`ExecutionResult`].
//!
//! The runner writes its result envelope last on stdout, normally as a frame
//! of its own. Anything written before it, on either stream, is kept as the
//! [`Transcript`]. The buffered and the streaming decoder feed the same
//! demultiplexer, so they always agree on the outcome.

use crate::{
    frame::{self, Frame, FrameReader, StreamKind},
    submission::ExecutionResult,
};
use std::{io, iter, mem};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::mpsc,
};

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Frame header at byte {offset} is truncated ({available} bytes available)")]
    TruncatedHeader { offset: usize, available: usize },
    #[error("Frame at byte {offset} declares {declared} bytes but only {remaining} remain")]
    TruncatedFrame {
        offset: usize,
        declared: usize,
        remaining: usize,
    },
    #[error("Unknown stream tag {tag}")]
    UnknownStream { tag: u8 },
    #[error("Output did not contain a result")]
    MissingResult,
    #[error("Unable to parse the result: {source}")]
    InvalidResult { source: serde_json::Error },
    #[error("Unable to read the output stream: {source}")]
    Read { source: io::Error },
}

/// Program output observed while a streaming decode is in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub bytes: Vec<u8>,
}

/// Output the runner wrote before its result envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub result: ExecutionResult,
    pub transcript: Transcript,
}

/// Stdout bytes of one line, with the offsets at which frames began.
#[derive(Debug, Default)]
struct Line {
    bytes: Vec<u8>,
    starts: Vec<usize>,
}

/// Accumulates frames in order. Stdout is released one non-blank line late,
/// since the envelope sits on the last line that is not blank.
#[derive(Debug, Default)]
struct Demuxer {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    held: Line,
    // Blank lines completed after `held`.
    trailing: Vec<u8>,
    partial: Line,
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}

fn opens_object(bytes: &[u8]) -> bool {
    bytes.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{')
}

/// Finds the envelope on the last line. It starts at the line start or at a
/// frame boundary, so output the program left without a trailing newline
/// stays in the transcript.
fn split_envelope(line: &Line) -> Result<(usize, ExecutionResult), DecodeError> {
    let candidates = iter::once(0)
        .chain(line.starts.iter().copied())
        .filter(|&at| opens_object(&line.bytes[at..]));

    let mut first_err = None;
    for at in candidates {
        match serde_json::from_slice(&line.bytes[at..]) {
            Ok(result) => return Ok((at, result)),
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
    }

    let source = match first_err {
        Some(e) => e,
        None => match serde_json::from_slice(&line.bytes) {
            Ok(result) => return Ok((0, result)),
            Err(e) => e,
        },
    };
    Err(DecodeError::InvalidResult { source })
}

impl Demuxer {
    fn push(&mut self, frame: Frame) -> Option<OutputChunk> {
        if frame.payload.is_empty() {
            return None;
        }

        match frame.stream {
            StreamKind::Stderr => {
                self.stderr.extend_from_slice(&frame.payload);
                Some(OutputChunk {
                    stream: StreamKind::Stderr,
                    bytes: frame.payload,
                })
            }
            StreamKind::Stdout => {
                let mut released = Vec::new();
                let mut rest = &frame.payload[..];
                self.partial.starts.push(self.partial.bytes.len());

                while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
                    let (line, tail) = rest.split_at(pos + 1);
                    self.partial.bytes.extend_from_slice(line);
                    let line = mem::take(&mut self.partial);
                    if is_blank(&line.bytes) {
                        self.trailing.extend(line.bytes);
                    } else {
                        released.extend(mem::replace(&mut self.held, line).bytes);
                        released.append(&mut self.trailing);
                    }
                    rest = tail;
                }
                self.partial.bytes.extend_from_slice(rest);

                self.release(released)
            }
        }
    }

    fn release(&mut self, bytes: Vec<u8>) -> Option<OutputChunk> {
        if bytes.is_empty() {
            return None;
        }
        self.stdout.extend_from_slice(&bytes);
        Some(OutputChunk {
            stream: StreamKind::Stdout,
            bytes,
        })
    }

    fn finish(mut self) -> (Option<OutputChunk>, Result<Decoded, DecodeError>) {
        let mut released = Vec::new();
        let mut after = Vec::new();
        let last = if is_blank(&self.partial.bytes) {
            after = mem::take(&mut self.trailing);
            after.append(&mut self.partial.bytes);
            mem::take(&mut self.held)
        } else {
            released = mem::take(&mut self.held).bytes;
            released.append(&mut self.trailing);
            mem::take(&mut self.partial)
        };

        if is_blank(&last.bytes) {
            released.extend(after);
            return (self.release(released), Err(DecodeError::MissingResult));
        }

        let (at, result) = match split_envelope(&last) {
            Ok(found) => found,
            Err(e) => return (self.release(released), Err(e)),
        };
        released.extend_from_slice(&last.bytes[..at]);
        released.extend(after);
        let chunk = self.release(released);

        let decoded = Decoded {
            result,
            transcript: Transcript {
                stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            },
        };
        (chunk, Ok(decoded))
    }
}

/// Decodes an output stream that has already been fully collected.
pub fn decode_bytes(buf: &[u8]) -> Result<Decoded, DecodeError> {
    let mut demux = Demuxer::default();
    for frame in frame::split(buf)? {
        demux.push(frame);
    }
    demux.finish().1
}

/// Reads the whole output stream, then decodes it.
pub async fn decode_buffered<R>(output: &mut R) -> Result<Decoded, DecodeError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::new();
    output
        .read_to_end(&mut buf)
        .await
        .map_err(|e| DecodeError::Read { source: e })?;

    log::debug!("Read {} bytes of container output", buf.len());
    decode_bytes(&buf)
}

/// Decodes the output stream frame by frame, forwarding program output to
/// `observer` as it arrives.
pub async fn decode_streaming<R>(
    output: &mut R,
    observer: Option<&mpsc::Sender<OutputChunk>>,
) -> Result<Decoded, DecodeError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut reader = FrameReader::new(output);
    let mut demux = Demuxer::default();

    while let Some(frame) = reader.next_frame().await? {
        log::trace!("{:?} frame of {} bytes", frame.stream, frame.payload.len());
        if let Some(chunk) = demux.push(frame) {
            forward(observer, chunk).await;
        }
    }

    let (chunk, decoded) = demux.finish();
    if let Some(chunk) = chunk {
        forward(observer, chunk).await;
    }
    decoded
}

async fn forward(observer: Option<&mpsc::Sender<OutputChunk>>, chunk: OutputChunk) {
    if let Some(tx) = observer {
        // A caller that stopped listening doesn't stop the decode.
        let _ = tx.send(chunk).await;
    }
}

pub async fn decode<R>(
    output: &mut R,
    streaming: bool,
    observer: Option<&mpsc::Sender<OutputChunk>>,
) -> Result<Decoded, DecodeError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if streaming {
        decode_streaming(output, observer).await
    } else {
        decode_buffered(output).await
    }
}
