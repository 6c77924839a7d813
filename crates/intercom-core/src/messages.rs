//! Wire types exchanged between the relay, its WebSocket clients, and push
//! callers.
//!
//! Every WebSocket frame carries one [`Envelope`]. The envelope `Body` is itself
//! a JSON document whose shape depends on [`Kind`].

use serde::{Deserialize, Serialize};

/// Header a client may set at upgrade time to register without sending a
/// register envelope.
pub const USER_HEADER: &str = "ce-x-user";

/// Envelope kind tags. `Message` covers both outbound requests and inbound
/// responses; correlation is by payload `Id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Kind {
    Register = 1,
    Message = 255,
}

impl From<Kind> for u8 {
    fn from(k: Kind) -> u8 {
        k as u8
    }
}

impl TryFrom<u8> for Kind {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            1 => Ok(Self::Register),
            255 => Ok(Self::Message),
            other => Err(format!("unknown envelope kind: {other}")),
        }
    }
}

/// Tagged container for every frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Kind")]
    pub kind: Kind,
    #[serde(rename = "Body")]
    pub body: String,
}

/// Body of a [`Kind::Register`] envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMessage {
    #[serde(rename = "Token", alias = "token")]
    pub token: String,
    #[serde(rename = "Event", alias = "event", default)]
    pub event: String,
}

/// Body of a [`Kind::Message`] envelope sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommRequest {
    #[serde(rename = "Id", alias = "id")]
    pub id: String,
    #[serde(rename = "Msg", alias = "msg")]
    pub msg: String,
}

/// Body of a [`Kind::Message`] envelope sent from a client back to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommResponse {
    #[serde(rename = "Id", alias = "id")]
    pub id: String,
    #[serde(rename = "Msg", alias = "msg", default)]
    pub msg: String,
}

/// JSON body of a push call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    #[serde(rename = "UserID")]
    pub user_id: String,
    /// Empty means the relay picks one.
    #[serde(rename = "CommID", default)]
    pub comm_id: String,
    #[serde(rename = "Message")]
    pub message: String,
    /// Return as soon as the request frame is written.
    #[serde(rename = "Async", default)]
    pub is_async: bool,
}

/// Reply to an asynchronous push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAccepted {
    #[serde(rename = "CommID")]
    pub comm_id: String,
}

/// Reply of the lookup endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupReply {
    #[serde(rename = "UserID")]
    pub user_id: String,
    #[serde(rename = "Online")]
    pub online: bool,
}

/// Error body returned by the HTTP endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    #[serde(rename = "Error")]
    pub error: String,
}
