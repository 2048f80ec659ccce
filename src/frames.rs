//! Multi-frame request body assembly.
//!
//! Request bodies arrive as an ordered sequence of frames, each carrying its
//! byte offset and a final-frame flag. Two consumers share the protocol:
//! bounded JSON bodies that are buffered whole before parsing, and streaming
//! transfers (file upload, firmware flash) that hand each frame to a sink as
//! it arrives. Frame ordering is strict; an out-of-order or duplicate offset
//! kills the session.

use axum::body::{Body, Bytes};
use http_body_util::BodyExt;
use futures_util::stream::StreamExt;
use serde::de::DeserializeOwned;
use std::fmt;

use crate::config::MAX_JSON_BODY_BYTES;
use crate::error::ApiError;

#[derive(Debug, Clone)]
pub struct Frame {
    pub offset: u64,
    pub bytes: Bytes,
    pub is_final: bool,
}

#[derive(Debug)]
pub enum FrameError {
    OutOfOrder { expected: u64, got: u64 },
    TooLarge { limit: usize },
    SessionFinished,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::OutOfOrder { expected, got } => {
                write!(f, "frame offset {got} does not match expected offset {expected}")
            }
            FrameError::TooLarge { limit } => {
                write!(f, "request body exceeds {limit} bytes")
            }
            FrameError::SessionFinished => write!(f, "frame received after final frame"),
        }
    }
}

impl From<FrameError> for ApiError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::TooLarge { .. } => ApiError::PayloadTooLarge(err.to_string()),
            _ => ApiError::BadRequest(err.to_string()),
        }
    }
}

/// Tracks the strict in-order delivery invariant shared by every session
/// kind.
#[derive(Debug, Default)]
pub struct FrameCursor {
    next_offset: u64,
    finished: bool,
}

impl FrameCursor {
    pub fn accept(&mut self, frame: &Frame) -> Result<(), FrameError> {
        if self.finished {
            return Err(FrameError::SessionFinished);
        }
        if frame.offset != self.next_offset {
            return Err(FrameError::OutOfOrder {
                expected: self.next_offset,
                got: frame.offset,
            });
        }
        self.next_offset += frame.bytes.len() as u64;
        if frame.is_final {
            self.finished = true;
        }
        Ok(())
    }

    pub fn received(&self) -> u64 {
        self.next_offset
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Buffers a complete bounded body across frames, parsed only once the
/// final frame lands. Bodies over the limit are rejected outright instead of
/// being silently truncated to their first frame.
#[derive(Debug)]
pub struct BoundedJsonAssembler {
    cursor: FrameCursor,
    buf: Vec<u8>,
    limit: usize,
}

impl BoundedJsonAssembler {
    pub fn new(limit: usize) -> Self {
        Self {
            cursor: FrameCursor::default(),
            buf: Vec::new(),
            limit,
        }
    }

    pub fn push(&mut self, frame: Frame) -> Result<(), FrameError> {
        self.cursor.accept(&frame)?;
        if self.buf.len() + frame.bytes.len() > self.limit {
            return Err(FrameError::TooLarge { limit: self.limit });
        }
        self.buf.extend_from_slice(&frame.bytes);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.cursor.is_finished()
    }

    pub fn body(&self) -> &[u8] {
        &self.buf
    }
}

/// Drains an HTTP body into frames and parses the assembled bytes as JSON.
pub async fn read_bounded_json<T: DeserializeOwned>(body: Body) -> Result<T, ApiError> {
    let mut assembler = BoundedJsonAssembler::new(MAX_JSON_BODY_BYTES);
    let mut stream = BodyExt::into_data_stream(body);
    let mut offset = 0u64;

    while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(|err| ApiError::BadRequest(err.to_string()))?;
        let len = bytes.len() as u64;
        assembler.push(Frame {
            offset,
            bytes,
            is_final: false,
        })?;
        offset += len;
    }
    assembler.push(Frame {
        offset,
        bytes: Bytes::new(),
        is_final: true,
    })?;

    serde_json::from_slice(assembler.body())
        .map_err(|err| ApiError::BadRequest(format!("invalid JSON: {err}")))
}
