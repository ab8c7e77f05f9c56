use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Headers, RequestMessage, WebSocketFrame};

/// Observability record emitted by the proxy for every relayed HTTP request or WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLogRecord {
    pub time: DateTime<Utc>,
    pub method: Option<String>,
    pub path_and_query: String,
    pub headers: Option<Headers>,
    pub is_web_socket: bool,
    pub is_final_frame: bool,
}

impl RequestLogRecord {
    #[must_use]
    pub fn from_request(request: &RequestMessage) -> Self {
        Self {
            time: Utc::now(),
            method: Some(request.method.clone()),
            path_and_query: request.path_and_query(),
            headers: Some(request.headers.clone()),
            is_web_socket: false,
            is_final_frame: false,
        }
    }

    #[must_use]
    pub fn from_frame(frame: &WebSocketFrame) -> Self {
        Self {
            time: Utc::now(),
            method: None,
            path_and_query: format!("/{}", frame.path),
            headers: None,
            is_web_socket: true,
            is_final_frame: frame.is_final,
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::FrameKind;

    #[test_log::test]
    fn http_record_carries_method_path_and_headers() {
        let request = RequestMessage {
            request_id: "r".into(),
            socket_id: None,
            method: "GET".into(),
            path: "/api/items".into(),
            headers: Headers::from([("accept".into(), "*/*".into())]),
            query_string: "?page=2".into(),
            body: Bytes::new(),
        };

        let record = RequestLogRecord::from_request(&request);

        assert_eq!(record.method.as_deref(), Some("GET"));
        assert_eq!(record.path_and_query, "/api/items?page=2");
        assert_eq!(record.headers, Some(request.headers));
        assert!(!record.is_web_socket);
    }

    #[test_log::test]
    fn frame_record_prefixes_path_with_slash() {
        let frame = WebSocketFrame {
            socket_id: "s".into(),
            data: Bytes::from_static(b"hi"),
            frame_kind: FrameKind::Text,
            is_final: true,
            path: "ws".into(),
        };

        let record = RequestLogRecord::from_frame(&frame);

        assert_eq!(record.method, None);
        assert_eq!(record.path_and_query, "/ws");
        assert!(record.is_web_socket);
        assert!(record.is_final_frame);
    }
}
