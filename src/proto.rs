//! Wire protocol definitions.
//!
//! Steady-state traffic is framed as a 12-byte little-endian header
//! (token low 32 bits, token high 32 bits, payload length) followed by a
//! UTF-8 JSON payload. Handshake traffic is NUL-terminated JSON with no
//! header; see [`crate::connection::handshake`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DriverError, Result};

/// Version preamble for the V1_0 handshake, written little-endian.
pub const VERSION_V1_0: u32 = 0x34c2_bdc3;

/// Handshake messages are terminated by a single NUL byte.
pub const NULL_BYTE: u8 = 0;

/// Size of the steady-state frame header.
pub const HEADER_SIZE: usize = 12;

/// Query envelope types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Start = 1,
    Continue = 2,
    Stop = 3,
    NoreplyWait = 4,
    ServerInfo = 5,
}

/// Response envelope types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    SuccessAtom = 1,
    SuccessSequence = 2,
    SuccessPartial = 3,
    WaitComplete = 4,
    ServerInfo = 5,
    ClientError = 16,
    CompileError = 17,
    RuntimeError = 18,
}

impl TryFrom<u64> for ResponseType {
    type Error = DriverError;

    fn try_from(value: u64) -> Result<Self> {
        Ok(match value {
            1 => ResponseType::SuccessAtom,
            2 => ResponseType::SuccessSequence,
            3 => ResponseType::SuccessPartial,
            4 => ResponseType::WaitComplete,
            5 => ResponseType::ServerInfo,
            16 => ResponseType::ClientError,
            17 => ResponseType::CompileError,
            18 => ResponseType::RuntimeError,
            other => {
                return Err(DriverError::protocol(format!(
                    "unexpected response type: {}",
                    other
                )))
            }
        })
    }
}

impl ResponseType {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ResponseType::ClientError | ResponseType::CompileError | ResponseType::RuntimeError
        )
    }
}

/// Term types the connection layer needs to introspect. The driver core
/// treats terms as opaque values otherwise.
pub mod term {
    pub const DB: u64 = 14;
    pub const TABLE: u64 = 15;
}

/// One query envelope: `[QueryType, term?, options?]` on the wire.
#[derive(Debug, Clone)]
pub struct Query {
    pub query_type: QueryType,
    pub term: Option<Value>,
    pub options: Option<Value>,
}

impl Query {
    pub fn start(term: Value, options: Option<Value>) -> Self {
        Query {
            query_type: QueryType::Start,
            term: Some(term),
            options,
        }
    }

    pub fn continuation() -> Self {
        Query {
            query_type: QueryType::Continue,
            term: None,
            options: None,
        }
    }

    pub fn stop() -> Self {
        Query {
            query_type: QueryType::Stop,
            term: None,
            options: None,
        }
    }

    pub fn noreply_wait() -> Self {
        Query {
            query_type: QueryType::NoreplyWait,
            term: None,
            options: None,
        }
    }

    pub fn server_info() -> Self {
        Query {
            query_type: QueryType::ServerInfo,
            term: None,
            options: None,
        }
    }

    /// Whether the query asked the server not to reply.
    pub fn is_noreply(&self) -> bool {
        self.options
            .as_ref()
            .and_then(|opts| opts.get("noreply"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Wire representation: a JSON array, with trailing `None` elements
    /// omitted. STOP and CONTINUE carry only the type.
    pub fn to_wire(&self) -> Value {
        let mut parts = vec![Value::from(self.query_type as u64)];
        if let Some(term) = &self.term {
            parts.push(term.clone());
        }
        if let Some(options) = &self.options {
            if self.term.is_none() {
                parts.push(Value::Null);
            }
            parts.push(options.clone());
        }
        Value::Array(parts)
    }
}

/// Response envelope as sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Response type tag.
    pub t: u64,
    /// Result batch.
    #[serde(default)]
    pub r: Vec<Value>,
    /// Backtrace for error responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b: Option<Value>,
    /// Profile data, present only when profiling was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<Value>,
    /// Error code for error responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<u64>,
}

impl Response {
    pub fn response_type(&self) -> Result<ResponseType> {
        ResponseType::try_from(self.t)
    }
}

/// Encodes one steady-state frame: header plus JSON payload.
pub fn encode_frame(token: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&((token & 0xffff_ffff) as u32).to_le_bytes());
    buf.extend_from_slice(&((token >> 32) as u32).to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Parses a frame header, returning the token and declared payload length.
/// Fails on input shorter than [`HEADER_SIZE`].
pub fn decode_header(header: &[u8]) -> Result<(u64, usize)> {
    if header.len() < HEADER_SIZE {
        return Err(DriverError::protocol(format!(
            "frame header truncated: {} bytes",
            header.len()
        )));
    }
    let low = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
    let high = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;
    let len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
    Ok((low | (high << 32), len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_round_trip_preserves_token_and_payload() {
        let query = Query::start(json!([term::TABLE, ["users"]]), Some(json!({"db": "test"})));
        let payload = serde_json::to_vec(&query.to_wire()).unwrap();
        let frame = encode_frame(0x1_0000_0007, &payload);

        assert_eq!(frame.len(), HEADER_SIZE + payload.len());
        let (token, len) = decode_header(&frame[..HEADER_SIZE]).unwrap();
        assert_eq!(token, 0x1_0000_0007);
        assert_eq!(len, payload.len());

        let decoded: Value = serde_json::from_slice(&frame[HEADER_SIZE..]).unwrap();
        assert_eq!(decoded, query.to_wire());
    }

    #[test]
    fn stop_and_continue_carry_only_the_type() {
        assert_eq!(Query::stop().to_wire(), json!([3]));
        assert_eq!(Query::continuation().to_wire(), json!([2]));
    }

    #[test]
    fn start_with_options_serializes_three_elements() {
        let query = Query::start(json!(1), Some(json!({"profile": true})));
        assert_eq!(query.to_wire(), json!([1, 1, {"profile": true}]));
    }

    #[test]
    fn noreply_flag_is_read_from_options() {
        let query = Query::start(json!(1), Some(json!({"noreply": true})));
        assert!(query.is_noreply());
        assert!(!Query::start(json!(1), None).is_noreply());
    }

    #[test]
    fn truncated_header_is_a_protocol_error() {
        let err = decode_header(&[0u8; 7]).unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)));
    }

    #[test]
    fn unknown_response_type_is_a_protocol_error() {
        let resp = Response {
            t: 99,
            r: vec![],
            b: None,
            p: None,
            e: None,
        };
        assert!(resp.response_type().is_err());
    }

    #[test]
    fn error_classification() {
        assert!(ResponseType::RuntimeError.is_error());
        assert!(!ResponseType::SuccessPartial.is_error());
    }
}
