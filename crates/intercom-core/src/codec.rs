//! JSON framing for intercom envelopes.
//!
//! Wire format: one envelope per transport frame, `{"Kind":<int>,"Body":<string>}`,
//! where `Body` is the JSON encoding of the kind-specific payload.

use crate::error::IntercomResult;
use crate::messages::{CommRequest, CommResponse, Envelope, Kind, RegisterMessage};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Wrap a payload into an envelope of the given kind.
pub fn envelope_of<T: Serialize>(kind: Kind, payload: &T) -> IntercomResult<Envelope> {
    Ok(Envelope {
        kind,
        body: serde_json::to_string(payload)?,
    })
}

/// Encode an envelope into the bytes of one frame.
pub fn frame_encode(envelope: &Envelope) -> IntercomResult<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Decode one frame into an envelope.
pub fn frame_decode(frame: &[u8]) -> IntercomResult<Envelope> {
    Ok(serde_json::from_slice(frame)?)
}

/// Decode an envelope body into its typed payload.
pub fn body_decode<T: DeserializeOwned>(envelope: &Envelope) -> IntercomResult<T> {
    Ok(serde_json::from_str(&envelope.body)?)
}

/// Frame carrying a push request to a client.
pub fn request_frame(id: &str, msg: &str) -> IntercomResult<Vec<u8>> {
    let request = CommRequest {
        id: id.to_string(),
        msg: msg.to_string(),
    };
    frame_encode(&envelope_of(Kind::Message, &request)?)
}

/// Frame carrying a client's answer to a push request.
pub fn response_frame(id: &str, msg: &str) -> IntercomResult<Vec<u8>> {
    let response = CommResponse {
        id: id.to_string(),
        msg: msg.to_string(),
    };
    frame_encode(&envelope_of(Kind::Message, &response)?)
}

/// Frame registering a client under a token.
pub fn register_frame(token: &str, event: &str) -> IntercomResult<Vec<u8>> {
    let register = RegisterMessage {
        token: token.to_string(),
        event: event.to_string(),
    };
    frame_encode(&envelope_of(Kind::Register, &register)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_shape() {
        let frame = response_frame("c1", "hi").unwrap();
        let text = String::from_utf8(frame).unwrap();
        assert_eq!(text, r#"{"Kind":255,"Body":"{\"Id\":\"c1\",\"Msg\":\"hi\"}"}"#);
    }

    #[test]
    fn register_kind_is_one() {
        let frame = register_frame("alice", "evt").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["Kind"], 1);

        let envelope = frame_decode(&frame).unwrap();
        let register: RegisterMessage = body_decode(&envelope).unwrap();
        assert_eq!(register.token, "alice");
        assert_eq!(register.event, "evt");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = frame_decode(br#"{"Kind":7,"Body":""}"#).unwrap_err();
        assert!(err.to_string().contains("unknown envelope kind"));
    }

    #[test]
    fn malformed_frame_is_codec_error() {
        let err = frame_decode(b"{not json").unwrap_err();
        assert!(matches!(err, crate::IntercomError::Codec(_)));
    }

    #[test]
    fn lowercase_payload_fields_accepted() {
        let envelope = Envelope {
            kind: Kind::Message,
            body: r#"{"id":"c9","msg":"pong"}"#.to_string(),
        };
        let response: CommResponse = body_decode(&envelope).unwrap();
        assert_eq!(response.id, "c9");
        assert_eq!(response.msg, "pong");
    }

    #[test]
    fn register_event_is_optional() {
        let envelope = Envelope {
            kind: Kind::Register,
            body: r#"{"Token":"bob"}"#.to_string(),
        };
        let register: RegisterMessage = body_decode(&envelope).unwrap();
        assert_eq!(register.token, "bob");
        assert!(register.event.is_empty());
    }

    #[test]
    fn push_request_defaults() {
        let push: crate::messages::PushRequest =
            serde_json::from_str(r#"{"UserID":"alice","Message":"hello"}"#).unwrap();
        assert_eq!(push.user_id, "alice");
        assert!(push.comm_id.is_empty());
        assert!(!push.is_async);
    }
}
