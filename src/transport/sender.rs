use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::connection::TransportError;
use super::events::OutboundEvent;
use super::state::ConnectionState;

pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Single-writer outbound queue.
///
/// Events are delivered strictly in enqueue order, only while a socket is
/// attached. A transient send failure puts the event back at the head and
/// parks the drain task until the Connection Manager attaches a fresh
/// socket. The queue is in-memory only: outbound events are disposable
/// across process restarts, inbound jobs are not.
pub struct OutboundSender {
    state: ConnectionState,
    inner: tokio::sync::Mutex<SenderInner>,
    notify: Notify,
}

struct SenderInner {
    queue: VecDeque<OutboundEvent>,
    sink: Option<WsSink>,
}

enum Step {
    Sent,
    Parked,
}

impl OutboundSender {
    pub fn new(state: ConnectionState) -> Arc<Self> {
        Arc::new(Self {
            state,
            inner: tokio::sync::Mutex::new(SenderInner {
                queue: VecDeque::new(),
                sink: None,
            }),
            notify: Notify::new(),
        })
    }

    pub async fn enqueue(&self, event: OutboundEvent) {
        {
            let mut inner = self.inner.lock().await;
            inner.queue.push_back(event);
        }
        self.notify.notify_one();
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// Snapshot of undelivered envelopes, oldest first.
    pub async fn queued_events(&self) -> Vec<super::events::EventEnvelope> {
        self.inner
            .lock()
            .await
            .queue
            .iter()
            .map(|e| e.envelope.clone())
            .collect()
    }

    /// Hand the write half of a fresh connection to the drain task.
    pub async fn attach(&self, sink: WsSink) {
        {
            let mut inner = self.inner.lock().await;
            inner.sink = Some(sink);
        }
        self.notify.notify_one();
    }

    /// Drop the current socket; queued events stay put.
    pub async fn detach(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut sink) = inner.sink.take() {
            let _ = sink.close().await;
        }
    }

    /// Liveness probe. Fails when no socket is attached, which is exactly
    /// the signal the Connection Manager needs to trigger a reconnect.
    pub async fn send_ping(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        match inner.sink.as_mut() {
            Some(sink) => sink
                .send(Message::Ping(Bytes::new()))
                .await
                .map_err(|e| TransportError::Socket(e.to_string())),
            None => Err(TransportError::NotConnected),
        }
    }

    pub async fn send_pong(&self, payload: Bytes) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        match inner.sink.as_mut() {
            Some(sink) => sink
                .send(Message::Pong(payload))
                .await
                .map_err(|e| TransportError::Socket(e.to_string())),
            None => Err(TransportError::NotConnected),
        }
    }

    pub fn spawn_drain(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.drain_loop(shutdown).await })
    }

    async fn drain_loop(&self, shutdown: CancellationToken) {
        loop {
            let step = self.try_deliver_one().await;
            match step {
                Step::Sent => {}
                Step::Parked => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
    }

    async fn try_deliver_one(&self) -> Step {
        let mut inner = self.inner.lock().await;
        if !self.state.is_connected() && inner.sink.is_none() {
            return Step::Parked;
        }
        let event = if inner.sink.is_some() {
            inner.queue.pop_front()
        } else {
            None
        };
        let Some(event) = event else {
            return Step::Parked;
        };

        let frame = event.to_frame();
        let result = match inner.sink.as_mut() {
            Some(sink) => sink.send(Message::Text(frame.into())).await,
            None => return Step::Parked,
        };

        match result {
            Ok(()) => {
                debug!(kind = %event.envelope.kind, "delivered outbound event");
                Step::Sent
            }
            Err(e) => {
                warn!(
                    kind = %event.envelope.kind,
                    error = %e,
                    "outbound send failed, requeueing event at head"
                );
                inner.queue.push_front(event);
                inner.sink = None;
                Step::Parked
            }
        }
    }
}
