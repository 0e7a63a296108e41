//! Event-stream framing: every websocket message is two concatenated
//! DAG-CBOR blocks, a header `{op, t}` and a payload.

use ipld_core::ipld::Ipld;
use std::io::Cursor;

use crate::error::AtprotoError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum FrameHeader {
    Message(Option<String>),
    Error,
}

impl TryFrom<Ipld> for FrameHeader {
    type Error = AtprotoError;

    fn try_from(value: Ipld) -> Result<Self, AtprotoError> {
        if let Ipld::Map(map) = value {
            if let Some(Ipld::Integer(op)) = map.get("op") {
                match op {
                    1 => {
                        let t = if let Some(Ipld::String(s)) = map.get("t") {
                            Some(s.clone())
                        } else {
                            None
                        };
                        return Ok(FrameHeader::Message(t));
                    }
                    -1 => return Ok(FrameHeader::Error),
                    _ => {}
                }
            }
        }
        Err(AtprotoError::InvalidFrame("invalid frame type".into()))
    }
}

/// A decoded stream frame: the message type discriminator plus the raw
/// payload bytes, or an error frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(Option<String>, Vec<u8>),
    Error(ErrorBody),
}

/// Body of an error frame, eg `{"error": "ConsumerTooSlow"}`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl TryFrom<&[u8]> for Frame {
    type Error = AtprotoError;

    fn try_from(value: &[u8]) -> Result<Self, AtprotoError> {
        let mut cursor = Cursor::new(value);
        let (left, right) = match serde_ipld_dagcbor::from_reader::<Ipld, _>(&mut cursor) {
            Err(serde_ipld_dagcbor::DecodeError::TrailingData) => {
                value.split_at(cursor.position() as usize)
            }
            _ => {
                // a lone block can't be a header+payload frame
                return Err(AtprotoError::InvalidFrame("missing payload block".into()));
            }
        };
        let header = FrameHeader::try_from(serde_ipld_dagcbor::from_slice::<Ipld>(left)?)?;
        match header {
            FrameHeader::Message(t) => Ok(Frame::Message(t, right.to_vec())),
            FrameHeader::Error => {
                let body = serde_ipld_dagcbor::from_slice::<ErrorBody>(right)
                    .unwrap_or(ErrorBody { error: String::new(), message: None });
                Ok(Frame::Error(body))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialized_data(s: &str) -> Vec<u8> {
        assert!(s.len() % 2 == 0);
        let b2u = |b: u8| match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            _ => unreachable!(),
        };
        s.as_bytes().chunks(2).map(|b| (b2u(b[0]) << 4) + b2u(b[1])).collect()
    }

    #[test]
    fn deserialize_message_frame_header() {
        // {"op": 1, "t": "#commit"}
        let data = serialized_data("a2626f700161746723636f6d6d6974");
        let ipld = serde_ipld_dagcbor::from_slice::<Ipld>(&data).expect("failed to deserialize");
        let result = FrameHeader::try_from(ipld);
        assert_eq!(
            result.expect("failed to deserialize"),
            FrameHeader::Message(Some(String::from("#commit")))
        );
    }

    #[test]
    fn deserialize_error_frame_header() {
        // {"op": -1}
        let data = serialized_data("a1626f7020");
        let ipld = serde_ipld_dagcbor::from_slice::<Ipld>(&data).expect("failed to deserialize");
        let result = FrameHeader::try_from(ipld);
        assert_eq!(result.expect("failed to deserialize"), FrameHeader::Error);
    }

    #[test]
    fn deserialize_invalid_frame_header() {
        for data in [
            // {"op": 2, "t": "#commit"}
            serialized_data("a2626f700261746723636f6d6d6974"),
            // {"op": -2}
            serialized_data("a1626f7021"),
        ] {
            let ipld = serde_ipld_dagcbor::from_slice::<Ipld>(&data).expect("failed to deserialize");
            assert!(FrameHeader::try_from(ipld).is_err());
        }
    }

    #[test]
    fn frame_splits_header_and_payload() {
        // {"op": 1, "t": "#info"} followed by {"name": "OutdatedCursor"}
        let mut data = serialized_data("a2626f700161746523696e666f");
        let payload = serde_ipld_dagcbor::to_vec(&serde_json::json!({"name": "OutdatedCursor"}))
            .expect("failed to serialize");
        data.extend_from_slice(&payload);

        match Frame::try_from(&data[..]).expect("failed to decode frame") {
            Frame::Message(t, body) => {
                assert_eq!(t.as_deref(), Some("#info"));
                assert_eq!(body, payload);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn error_frame_decodes_body() {
        let mut data = serialized_data("a1626f7020");
        let payload = serde_ipld_dagcbor::to_vec(
            &serde_json::json!({"error": "ConsumerTooSlow", "message": "ketchup!"}),
        )
        .expect("failed to serialize");
        data.extend_from_slice(&payload);

        match Frame::try_from(&data[..]).expect("failed to decode frame") {
            Frame::Error(body) => {
                assert_eq!(body.error, "ConsumerTooSlow");
                assert_eq!(body.message.as_deref(), Some("ketchup!"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
