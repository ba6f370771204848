//! Binary framing of the receiver's downstream stream.
//!
//! Each WebSocket message carries one frame:
//! `[metadata_len: u32 LE][metadata: UTF-8 JSON][samples: i16 LE ...]`.
//! `metadata_len` may be zero, in which case the whole body is PCM.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Size of the little-endian metadata length prefix.
pub const HEADER_LEN: usize = 4;

/// Divisor used to normalize a signed 16-bit sample into [-1, 1].
pub const SAMPLE_SCALE: f32 = 32767.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("Frame too short for header: {0} bytes")]
    Truncated(usize),

    #[error("Metadata length {declared} exceeds remaining {available} bytes")]
    MetadataOverrun { declared: u32, available: usize },

    #[error("Failed to encode status record: {0}")]
    Encode(String),
}

/// Why a frame's metadata block could not be turned into a [`StatusRecord`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetadataFault {
    #[error("Metadata is not valid UTF-8")]
    InvalidUtf8,

    #[error("Metadata is not a valid status record: {0}")]
    InvalidJson(String),
}

/// Radio status as reported by the receiver.
///
/// Field names on the wire are the receiver's short keys. The scan/seek flags
/// are sent as `0`/`1` by the receiver, so both integers and booleans are
/// accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusRecord {
    #[serde(rename = "fc")]
    pub center_frequency_hz: i64,
    #[serde(rename = "fs")]
    pub sample_rate_hz: i64,
    pub mode: String,
    pub throughput: f64,
    #[serde(rename = "snr")]
    pub signal_to_noise_ratio: f64,
    #[serde(deserialize_with = "flag")]
    pub scanning: bool,
    #[serde(deserialize_with = "flag")]
    pub seeking: bool,
    #[serde(rename = "lastStationFound")]
    pub last_station_found: i64,
}

impl Default for StatusRecord {
    fn default() -> Self {
        Self {
            center_frequency_hz: 0,
            sample_rate_hz: 0,
            mode: String::new(),
            throughput: 0.0,
            signal_to_noise_ratio: 0.0,
            scanning: false,
            seeking: false,
            last_station_found: -1,
        }
    }
}

fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(n) => n != 0,
    })
}

/// Result of decoding one frame whose offsets were consistent.
#[derive(Debug, Clone, Default)]
pub struct DecodedFrame {
    pub status: Option<StatusRecord>,
    pub samples: Vec<f32>,
    /// Set when a metadata block was present but unusable. The samples are
    /// still valid in that case.
    pub metadata_fault: Option<MetadataFault>,
}

/// Decode one inbound message.
///
/// Structural problems (no room for the header, or a metadata length running
/// past the end of the message) make the sample boundary unknowable and
/// return an error. A malformed metadata block only costs the status record.
pub fn decode_frame(message: &[u8]) -> Result<DecodedFrame, FrameError> {
    if message.len() < HEADER_LEN {
        return Err(FrameError::Truncated(message.len()));
    }

    let declared = u32::from_le_bytes([message[0], message[1], message[2], message[3]]);
    let body = &message[HEADER_LEN..];
    let metadata_len = declared as usize;
    if metadata_len > body.len() {
        return Err(FrameError::MetadataOverrun {
            declared,
            available: body.len(),
        });
    }

    let (metadata, payload) = body.split_at(metadata_len);

    let (status, metadata_fault) = if metadata.is_empty() {
        (None, None)
    } else {
        match parse_status(metadata) {
            Ok(status) => (Some(status), None),
            Err(fault) => (None, Some(fault)),
        }
    };

    Ok(DecodedFrame {
        status,
        samples: samples(payload).collect(),
        metadata_fault,
    })
}

/// Parse a metadata block into a status record.
pub fn parse_status(metadata: &[u8]) -> Result<StatusRecord, MetadataFault> {
    let text = std::str::from_utf8(metadata).map_err(|_| MetadataFault::InvalidUtf8)?;
    serde_json::from_str(text).map_err(|e| MetadataFault::InvalidJson(e.to_string()))
}

/// Iterate normalized samples of a PCM payload; an odd trailing byte is ignored.
pub fn samples(payload: &[u8]) -> impl Iterator<Item = f32> + '_ {
    payload
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / SAMPLE_SCALE)
}

/// Build a frame the way the receiver does. Used by the test server and tools.
pub fn encode_frame(status: Option<&StatusRecord>, pcm: &[i16]) -> Result<Vec<u8>, FrameError> {
    let metadata = match status {
        Some(status) => {
            serde_json::to_vec(status).map_err(|e| FrameError::Encode(e.to_string()))?
        }
        None => Vec::new(),
    };

    let mut bytes = Vec::with_capacity(HEADER_LEN + metadata.len() + pcm.len() * 2);
    bytes.extend_from_slice(&(metadata.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&metadata);
    for sample in pcm {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    Ok(bytes)
}
