//! Server-sent event transport for generation streams.
//!
//! Each event goes out as one SSE `data:` line holding `{"event": .., "data": ..}`.
//! Producers write through an [`EventSink`] and stop as soon as it reports the
//! client gone.

use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use crate::generation::StreamEvent;

pub const STREAM_CHANNEL_CAPACITY: usize = 64;
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    pub event: String,
    pub data: Value,
}

impl StreamEnvelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("error", json!({ "error": message.into() }))
    }
}

impl From<StreamEvent> for StreamEnvelope {
    fn from(event: StreamEvent) -> Self {
        Self::new(event.name(), event.data())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEnvelope>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn is_disconnected(&self) -> bool {
        self.tx.is_closed()
    }

    /// Checks the connection before sending; once the client has gone nothing
    /// more is queued.
    pub async fn emit(&self, envelope: impl Into<StreamEnvelope>) -> Delivery {
        if self.tx.is_closed() {
            return Delivery::Disconnected;
        }
        match self.tx.send(envelope.into()).await {
            Ok(()) => Delivery::Sent,
            Err(_) => Delivery::Disconnected,
        }
    }
}

/// Spawns `producer` with a fresh sink and returns the SSE response reading
/// from it. A producer that panics or is aborted still ends the stream with
/// one error event.
pub fn event_stream_response<F, Fut>(
    producer: F,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send>
where
    F: FnOnce(EventSink) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (sink, rx) = EventSink::channel(STREAM_CHANNEL_CAPACITY);
    let supervisor_sink = sink.clone();
    let task = tokio::spawn(producer(sink));
    tokio::spawn(async move {
        if let Err(join_error) = task.await {
            error!(error = %join_error, "stream producer failed");
            if supervisor_sink.emit(StreamEnvelope::error("stream producer failed")).await
                == Delivery::Disconnected
            {
                debug!("client already disconnected");
            }
        }
    });

    let stream = ReceiverStream::new(rx).map(|envelope| -> Result<Event, Infallible> {
        Ok(Event::default()
            .json_data(&envelope)
            .unwrap_or_else(|_| Event::default().data(r#"{"event":"error","data":{"error":"encoding failed"}}"#)))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::Section;
    use axum::response::IntoResponse;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn body_events(response: axum::response::Response) -> Vec<StreamEnvelope> {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        String::from_utf8(bytes.to_vec())
            .expect("utf8 body")
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .map(|data| serde_json::from_str(data).expect("envelope json"))
            .collect()
    }

    #[test]
    fn stream_event_converts_to_wire_envelope() {
        let envelope = StreamEnvelope::from(StreamEvent::Message {
            content: String::from("run("),
            section: Section::Script,
        });
        assert_eq!(envelope.event, "message");
        assert_eq!(envelope.data, json!({ "content": "run(", "section": "script" }));
    }

    #[tokio::test]
    async fn emit_reports_disconnect_and_stops_queueing() {
        let (sink, rx) = EventSink::channel(4);
        assert_eq!(sink.emit(StreamEnvelope::error("first")).await, Delivery::Sent);

        drop(rx);

        assert!(sink.is_disconnected());
        assert_eq!(
            sink.emit(StreamEnvelope::error("second")).await,
            Delivery::Disconnected
        );
    }

    #[tokio::test]
    async fn producer_stops_once_client_is_gone() {
        let produced = Arc::new(AtomicUsize::new(0));
        let (sink, mut rx) = EventSink::channel(1);
        let counter = produced.clone();
        let producer = tokio::spawn(async move {
            loop {
                if sink.emit(StreamEnvelope::new("message", json!({}))).await
                    == Delivery::Disconnected
                {
                    break;
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(rx.recv().await.is_some());
        drop(rx);
        producer.await.expect("producer should finish");

        assert!(produced.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn response_frames_each_envelope_as_json_data() {
        let response = event_stream_response(|sink| async move {
            sink.emit(StreamEnvelope::new("complete", json!({ "message": "done" })))
                .await;
        })
        .into_response();

        assert_eq!(
            response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok()),
            Some("text/event-stream")
        );
        assert_eq!(
            body_events(response).await,
            vec![StreamEnvelope::new("complete", json!({ "message": "done" }))]
        );
    }

    #[tokio::test]
    async fn panicking_producer_yields_exactly_one_error_event() {
        let response = event_stream_response(|sink| async move {
            sink.emit(StreamEnvelope::new("message", json!({ "content": "a" })))
                .await;
            panic!("producer blew up");
        })
        .into_response();

        let events = body_events(response).await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[1], StreamEnvelope::error("stream producer failed"));
    }
}
