//! Wire models shared by the Portunnel host and proxy.
//!
//! Every control-channel message is a single JSON text frame. Messages travelling from the
//! proxy to the host are [`ProxyMessage`]s, messages travelling from the host to the proxy are
//! [`HostMessage`]s. Byte payloads are carried as base64 strings.

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumString};

mod log_record;

pub use log_record::RequestLogRecord;

/// Header the proxy must present on the control connection handshake.
pub const SECRET_HEADER: &str = "X-Portunnel-Secret";

/// Path prefix the host intercepts when none is configured.
pub const DEFAULT_PREFIX: &str = "/portunnel";

/// Header map carried across the relay. Multi-valued headers are joined with `,`.
pub type Headers = BTreeMap<String, String>;

/// A buffered HTTP request forwarded from the host to the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<String>,
    pub method: String,
    /// Forwarded path, always starting with `/`.
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    /// Raw query string including the leading `?`, or empty.
    #[serde(default)]
    pub query_string: String,
    #[serde(default, with = "base64_bytes")]
    pub body: Bytes,
}

impl RequestMessage {
    #[must_use]
    pub fn path_and_query(&self) -> String {
        format!("{}{}", self.path, self.query_string)
    }
}

/// The proxy's answer to a [`RequestMessage`].
///
/// A response without a `status` is the "empty response" the proxy produces when the target
/// could not be reached or answered with a non-success status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    #[serde(default)]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_bytes")]
    pub body: Bytes,
}

impl ResponseMessage {
    /// Empty response correlated to `request_id`.
    #[must_use]
    pub fn empty(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.headers.is_empty() && self.body.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameKind {
    Text,
    Binary,
    Close,
}

/// One WebSocket message unit relayed for a tunneled socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketFrame {
    pub socket_id: String,
    #[serde(default, with = "base64_bytes")]
    pub data: Bytes,
    pub frame_kind: FrameKind,
    pub is_final: bool,
    /// Forwarded path (without leading `/`) plus the upgrade query string, if any.
    #[serde(default)]
    pub path: String,
}

impl WebSocketFrame {
    #[must_use]
    pub fn close(socket_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            socket_id: socket_id.into(),
            data: Bytes::new(),
            frame_kind: FrameKind::Close,
            is_final: true,
            path: path.into(),
        }
    }

    #[must_use]
    pub fn is_close(&self) -> bool {
        self.frame_kind == FrameKind::Close
    }
}

/// Messages sent by the proxy over its control connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyMessage {
    #[serde(rename_all = "camelCase")]
    Register { service_id: String },
    #[serde(rename_all = "camelCase")]
    Unregister { service_id: String },
    HttpResponse { response: ResponseMessage },
    ForwardFrameToHost { frame: WebSocketFrame },
    #[serde(rename_all = "camelCase")]
    CloseSocket { socket_id: String },
}

/// Messages sent by the host to a proxy over its control connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostMessage {
    /// `maximum_message_size` is the largest body or frame payload the host accepts on this
    /// connection. Proxies that predate it see `None`.
    #[serde(rename_all = "camelCase")]
    Registered {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maximum_message_size: Option<usize>,
    },
    NotRegistered { message: String },
    ForwardHttp { request: RequestMessage },
    ForwardWebSocket { frame: WebSocketFrame },
    #[serde(rename_all = "camelCase")]
    ProtocolError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        socket_id: Option<String>,
        message: String,
    },
}

macro_rules! impl_json_message {
    ($type:ty) => {
        impl $type {
            /// # Errors
            ///
            /// * If the message fails to serialize
            pub fn to_json(&self) -> Result<String, serde_json::Error> {
                serde_json::to_string(self)
            }
        }

        impl TryFrom<&str> for $type {
            type Error = serde_json::Error;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                serde_json::from_str(value)
            }
        }
    };
}

impl_json_message!(ProxyMessage);
impl_json_message!(HostMessage);

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose};
    use bytes::Bytes;
    use serde::{Deserialize as _, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test_log::test]
    fn forward_http_is_tagged_and_base64_encodes_body() {
        let message = HostMessage::ForwardHttp {
            request: RequestMessage {
                request_id: "r1".into(),
                socket_id: None,
                method: "POST".into(),
                path: "/foo".into(),
                headers: BTreeMap::from([("content-type".into(), "text/plain".into())]),
                query_string: "?x=1".into(),
                body: Bytes::from_static(b"ok"),
            },
        };

        let value: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "FORWARD_HTTP",
                "request": {
                    "requestId": "r1",
                    "method": "POST",
                    "path": "/foo",
                    "headers": {"content-type": "text/plain"},
                    "queryString": "?x=1",
                    "body": "b2s=",
                }
            })
        );
    }

    #[test_log::test]
    fn close_socket_uses_camel_case_fields() {
        let message = ProxyMessage::try_from(r#"{"type":"CLOSE_SOCKET","socketId":"abc"}"#).unwrap();

        assert_eq!(
            message,
            ProxyMessage::CloseSocket {
                socket_id: "abc".into()
            }
        );
    }

    #[test_log::test]
    fn frame_kind_serializes_screaming_snake_case() {
        let frame = WebSocketFrame {
            socket_id: "s".into(),
            data: Bytes::from_static(b"\x00\xff"),
            frame_kind: FrameKind::Binary,
            is_final: false,
            path: "ws?room=1".into(),
        };

        let value = serde_json::to_value(&frame).unwrap();

        assert_eq!(value["frameKind"], "BINARY");
        assert_eq!(value["data"], "AP8=");
        assert_eq!(value["isFinal"], false);
    }

    #[test_log::test]
    fn response_without_status_deserializes_as_empty() {
        let response: ResponseMessage = serde_json::from_str(r#"{"requestId":"r1"}"#).unwrap();

        assert!(response.is_empty());
        assert_eq!(response, ResponseMessage::empty("r1"));
    }

    #[test_log::test]
    fn registered_carries_the_message_size_cap() {
        let message = HostMessage::Registered {
            message: "ok".into(),
            maximum_message_size: Some(1024),
        };

        let value: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "REGISTERED", "message": "ok", "maximumMessageSize": 1024})
        );

        assert_eq!(
            HostMessage::try_from(r#"{"type":"REGISTERED","message":"ok"}"#).unwrap(),
            HostMessage::Registered {
                message: "ok".into(),
                maximum_message_size: None,
            }
        );
    }

    #[test_log::test]
    fn invalid_base64_body_is_rejected() {
        let result = HostMessage::try_from(
            r#"{"type":"FORWARD_WEB_SOCKET","frame":{"socketId":"s","data":"***","frameKind":"TEXT","isFinal":true}}"#,
        );

        assert!(result.is_err());
    }
}
