//! Traffic log sink.
//!
//! Every relayed request and caller frame is turned into a [`RequestLogRecord`] and handed to
//! each registered [`LogDestination`] on its own task, so a slow or failing destination never
//! holds up the relay.

use std::sync::Arc;

use async_trait::async_trait;
use portunnel_models::{RequestLogRecord, RequestMessage, WebSocketFrame};

#[async_trait]
pub trait LogDestination: Send + Sync {
    async fn log(&self, record: RequestLogRecord);
}

#[derive(Clone, Default)]
pub struct RequestLogger {
    destinations: Arc<[Arc<dyn LogDestination>]>,
}

impl std::fmt::Debug for RequestLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLogger")
            .field("destinations", &self.destinations.len())
            .finish()
    }
}

impl RequestLogger {
    #[must_use]
    pub fn new(destinations: Vec<Arc<dyn LogDestination>>) -> Self {
        Self {
            destinations: destinations.into(),
        }
    }

    pub fn log_http(&self, request: &RequestMessage) {
        self.dispatch(&RequestLogRecord::from_request(request));
    }

    pub fn log_websocket(&self, frame: &WebSocketFrame) {
        self.dispatch(&RequestLogRecord::from_frame(frame));
    }

    fn dispatch(&self, record: &RequestLogRecord) {
        for destination in self.destinations.iter() {
            let destination = destination.clone();
            let record = record.clone();
            tokio::spawn(async move { destination.log(record).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use portunnel_models::{FrameKind, Headers};
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;

    struct Recording(mpsc::UnboundedSender<RequestLogRecord>);

    #[async_trait]
    impl LogDestination for Recording {
        async fn log(&self, record: RequestLogRecord) {
            let _ = self.0.send(record);
        }
    }

    #[test_log::test(tokio::test)]
    async fn every_destination_receives_the_record() {
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();
        let logger = RequestLogger::new(vec![
            Arc::new(Recording(first_tx)),
            Arc::new(Recording(second_tx)),
        ]);

        logger.log_http(&RequestMessage {
            request_id: "r".into(),
            socket_id: None,
            method: "DELETE".into(),
            path: "/items/1".into(),
            headers: Headers::new(),
            query_string: String::new(),
            body: Bytes::new(),
        });

        let first = first_rx.recv().await.unwrap();
        let second = second_rx.recv().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.method.as_deref(), Some("DELETE"));
        assert_eq!(first.path_and_query, "/items/1");
    }

    #[test_log::test(tokio::test)]
    async fn websocket_frames_are_logged_without_method() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let logger = RequestLogger::new(vec![Arc::new(Recording(tx))]);

        logger.log_websocket(&WebSocketFrame {
            socket_id: "s".into(),
            data: Bytes::from_static(b"x"),
            frame_kind: FrameKind::Binary,
            is_final: false,
            path: "live".into(),
        });

        let record = rx.recv().await.unwrap();
        assert_eq!(record.method, None);
        assert_eq!(record.path_and_query, "/live");
        assert!(record.is_web_socket);
        assert!(!record.is_final_frame);
    }
}
