use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{ChatError, Result};
use crate::model::{Message, OutboundFrame, RoomId};

/// Lifecycle of a live connection. `Pending` covers the window between
/// `open` and the transport's open event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Pending,
    Open,
    Closed,
}

/// Ordered events from one connection's reader task.
#[derive(Debug)]
pub enum TransportEvent {
    Opened,
    Inbound(Message),
    Closed(Option<String>),
}

/// One WebSocket connection, exclusively owned by the synchronizer and
/// scoped to a single room. Replaced, never shared; dropping it tears the
/// connection down.
pub struct LiveConnection {
    room_id: RoomId,
    out_tx: mpsc::UnboundedSender<OutboundFrame>,
    state_rx: watch::Receiver<ConnState>,
    cancel: CancellationToken,
}

impl LiveConnection {
    /// Open a connection for `room_id`, authenticated by the short-lived
    /// token. Returns immediately in `Pending`; progress arrives on the
    /// returned event stream.
    pub fn open(
        ws_base: &Url,
        room_id: RoomId,
        token: &str,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let url = format!(
            "{}/{}?token={}",
            ws_base.as_str().trim_end_matches('/'),
            room_id,
            token
        );
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnState::Pending);
        let cancel = CancellationToken::new();
        tokio::spawn(run(url, out_rx, event_tx, state_tx, cancel.clone()));
        (
            Self {
                room_id,
                out_tx,
                state_rx,
                cancel,
            },
            event_rx,
        )
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn state(&self) -> ConnState {
        *self.state_rx.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnState::Open
    }

    /// Queue an outbound frame. Fails unless the transport is open, so a
    /// send never silently drops into a dead connection.
    pub fn send(&self, frame: OutboundFrame) -> Result<()> {
        if !self.is_open() {
            return Err(ChatError::NotConnected);
        }
        self.out_tx
            .send(frame)
            .map_err(|_| ChatError::NotConnected)
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    url: String,
    mut out_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    state_tx: watch::Sender<ConnState>,
    cancel: CancellationToken,
) {
    let connect = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = state_tx.send(ConnState::Closed);
            return;
        }
        res = connect_async(&url) => res,
    };
    let mut ws = match connect {
        Ok((ws, _)) => ws,
        Err(e) => {
            tracing::warn!(error = %e, "live connection failed to open");
            let _ = state_tx.send(ConnState::Closed);
            let _ = event_tx.send(TransportEvent::Closed(Some(e.to_string())));
            return;
        }
    };
    let _ = state_tx.send(ConnState::Open);
    let _ = event_tx.send(TransportEvent::Opened);

    let mut reason = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws.close(None).await;
                break;
            }
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                let text = match serde_json::to_string(&frame) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode outbound frame");
                        continue;
                    }
                };
                if let Err(e) = ws.send(WsMessage::Text(text)).await {
                    reason = Some(e.to_string());
                    break;
                }
            }
            inbound = ws.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<Message>(&text) {
                            Ok(msg) => {
                                let _ = event_tx.send(TransportEvent::Inbound(msg));
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "ignoring undecodable frame");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        reason = Some(e.to_string());
                        break;
                    }
                }
            }
        }
    }
    let _ = state_tx.send(ConnState::Closed);
    let _ = event_tx.send(TransportEvent::Closed(reason));
}
