//! Client side of the push stream.
//!
//! A [`StreamConsumer`] owns one long-lived `GET /events` request. It turns
//! the byte stream into [`StreamEvent`]s and reports a disconnect exactly
//! once; reconnecting and backoff belong to whoever owns the consumer.

use std::future::Future;

use futures::{Stream, StreamExt};
use opsdeck_core::envelope::StreamEnvelope;
use opsdeck_core::sse::{SseDecoder, StreamParseError, parse_envelope};
use reqwest::header::ACCEPT;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER: usize = 64;

#[derive(Debug)]
pub enum StreamEvent {
    /// The server accepted the request; envelopes follow.
    Connected,
    Envelope(StreamEnvelope),
    /// One frame was unreadable. The connection stays open.
    ParseError(StreamParseError),
    /// Terminal for this consumer.
    Disconnected { reason: String },
}

pub struct StreamConsumer {
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl StreamConsumer {
    pub fn open(client: reqwest::Client, url: String, token: Option<String>) -> Self {
        Self::spawn(move |events, cancel| read(client, url, token, events, cancel))
    }

    fn spawn<F, Fut>(reader: F) -> Self
    where
        F: FnOnce(mpsc::Sender<StreamEvent>, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sender, events) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(reader(sender, cancel.clone()));
        Self {
            events,
            cancel,
            task: Some(task),
        }
    }

    /// Next event in arrival order; `None` once closed or after the reader
    /// has finished and everything it sent was consumed.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Stop reading and wait for the reader task. Buffered events are
    /// discarded.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        self.events.close();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "stream reader task failed");
            }
        }
        while self.events.try_recv().is_ok() {}
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read(
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    events: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) {
    let mut request = client.get(&url).header(ACCEPT, "text/event-stream");
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = tokio::select! {
        _ = cancel.cancelled() => return,
        response = request.send() => response,
    };
    let response = match response.and_then(|r| r.error_for_status()) {
        Ok(response) => response,
        Err(err) => {
            let _ = events
                .send(StreamEvent::Disconnected {
                    reason: err.to_string(),
                })
                .await;
            return;
        }
    };
    tracing::debug!(%url, "push stream connected");
    if events.send(StreamEvent::Connected).await.is_err() {
        return;
    }
    pump(response.bytes_stream(), &events, &cancel).await;
}

/// Decode `chunks` into events until the source ends, fails or `cancel`
/// fires. Ending or failing yields one `Disconnected`.
async fn pump<S, B, E>(chunks: S, events: &mpsc::Sender<StreamEvent>, cancel: &CancellationToken)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut chunks = std::pin::pin!(chunks);
    let mut decoder = SseDecoder::new();
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = chunks.next() => chunk,
        };
        let reason = match chunk {
            Some(Ok(bytes)) => {
                for frame in decoder.push(bytes.as_ref()) {
                    let event = match parse_envelope(&frame) {
                        Ok(envelope) => StreamEvent::Envelope(envelope),
                        Err(err) => {
                            tracing::warn!(error = %err, "unreadable stream frame");
                            StreamEvent::ParseError(err)
                        }
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                continue;
            }
            Some(Err(err)) => err.to_string(),
            None => "stream closed by server".to_string(),
        };
        let _ = events.send(StreamEvent::Disconnected { reason }).await;
        return;
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use futures::stream;
    use opsdeck_core::envelope::{EnvelopePayload, EventType, Heartbeat};

    use super::*;

    fn frame(sequence: u64) -> String {
        let envelope = StreamEnvelope::new(
            sequence,
            "test",
            &EnvelopePayload::Heartbeat(Heartbeat {
                server_time: Utc::now(),
                subscribers: 1,
            }),
        )
        .expect("envelope builds");
        let data = serde_json::to_string(&envelope).expect("encodes");
        format!("id: {sequence}\nevent: heartbeat\ndata: {data}\n\n")
    }

    fn consumer_over(chunks: Vec<Result<Vec<u8>, String>>, hold_open: bool) -> StreamConsumer {
        StreamConsumer::spawn(move |events, cancel| async move {
            if events.send(StreamEvent::Connected).await.is_err() {
                return;
            }
            let source = stream::iter(chunks);
            if hold_open {
                let pending = stream::pending::<Result<Vec<u8>, String>>();
                pump(source.chain(pending), &events, &cancel).await;
            } else {
                pump(source, &events, &cancel).await;
            }
        })
    }

    #[tokio::test]
    async fn frames_split_across_chunks_become_envelopes() {
        let text = format!("{}{}", frame(1), frame(2));
        let (head, tail) = text.split_at(text.len() / 2 + 3);
        let mut consumer = consumer_over(
            vec![Ok(head.as_bytes().to_vec()), Ok(tail.as_bytes().to_vec())],
            false,
        );

        assert!(matches!(consumer.next_event().await, Some(StreamEvent::Connected)));
        for expected in [1, 2] {
            match consumer.next_event().await {
                Some(StreamEvent::Envelope(envelope)) => {
                    assert_eq!(envelope.sequence, expected);
                    assert_eq!(envelope.event_type, EventType::Heartbeat);
                }
                other => panic!("expected envelope, got {other:?}"),
            }
        }
        match consumer.next_event().await {
            Some(StreamEvent::Disconnected { reason }) => assert!(reason.contains("closed")),
            other => panic!("expected disconnect, got {other:?}"),
        }
        assert!(consumer.next_event().await.is_none());
    }

    #[tokio::test]
    async fn malformed_frame_is_reported_and_stream_continues() {
        let chunks = vec![
            Ok(b"id: 1\nevent: feed\ndata: {not json\n\n".to_vec()),
            Ok(frame(2).into_bytes()),
        ];
        let mut consumer = consumer_over(chunks, false);

        assert!(matches!(consumer.next_event().await, Some(StreamEvent::Connected)));
        assert!(matches!(
            consumer.next_event().await,
            Some(StreamEvent::ParseError(StreamParseError::InvalidJson { .. }))
        ));
        assert!(matches!(
            consumer.next_event().await,
            Some(StreamEvent::Envelope(envelope)) if envelope.sequence == 2
        ));
    }

    #[tokio::test]
    async fn transport_error_disconnects_with_reason() {
        let mut consumer = consumer_over(
            vec![Ok(frame(1).into_bytes()), Err("connection reset".to_string())],
            false,
        );
        assert!(matches!(consumer.next_event().await, Some(StreamEvent::Connected)));
        assert!(matches!(consumer.next_event().await, Some(StreamEvent::Envelope(_))));
        match consumer.next_event().await {
            Some(StreamEvent::Disconnected { reason }) => assert_eq!(reason, "connection reset"),
            other => panic!("expected disconnect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nothing_is_yielded_after_close() {
        let mut consumer = consumer_over(
            vec![Ok(frame(1).into_bytes()), Ok(frame(2).into_bytes())],
            true,
        );
        assert!(matches!(consumer.next_event().await, Some(StreamEvent::Connected)));

        consumer.close().await;
        assert!(consumer.next_event().await.is_none());
    }
}
