//! Wire format between master and worker.
//!
//! Each work item travels as a single length-framed document over a
//! freshly-accepted connection; the master closing the connection is
//! the end-of-item delimiter. The payload is a tagged JSON encoding
//! of a [`Tuple`], so every value in the domain round-trips without
//! ambiguity (an integer never comes back as a float, bytes never
//! come back as a list of numbers pretending to be something else).

use std::collections::BTreeMap;
use std::io::{self, Read};

use serde::{Deserialize, Serialize};

use crate::error::{DivvyError, Result};

/// Upper bound on a single frame. Anything larger is treated as a
/// corrupt length prefix rather than an allocation request.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One marshallable value inside an argument tuple.
///
/// Floats must be finite; the JSON encoding has no NaN or infinity
/// and the codec surfaces an encode error for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Text(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// The argument tuple a generator emits and a processor receives.
pub type Tuple = Vec<Value>;

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// Serialize a tuple into a ready-to-write frame: a u32 big-endian
/// byte length followed by the tagged JSON document.
pub fn encode(tuple: &Tuple) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(tuple)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(DivvyError::FrameTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read one frame from a stream.
///
/// Returns `Ok(None)` on clean end-of-stream before the length
/// prefix (the listener went away). A stream that ends mid-frame is
/// an I/O error, not an end-of-stream.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Tuple>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(DivvyError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(serde_json::from_slice(&body)?))
}
