//! WebSocket reader and writer tasks bridging a socket to a connection's
//! inbound and outbound queues.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tagwire_core::WireMessage;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::Connection;

/// Upper bound for one batched text frame.
pub const MAX_FRAME_BYTES: usize = 32 * 1024;

/// Decode text frames into `incoming` until the socket or the connection
/// closes. Malformed lines are dropped. Dropping `incoming` on return tells
/// the event loop the browser is gone.
pub(crate) async fn read_loop(
    conn: Arc<Connection>,
    mut rx: SplitStream<WebSocket>,
    incoming: mpsc::Sender<WireMessage>,
) {
    let cancel = conn.cancel_token();
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = rx.next() => frame,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                debug!(conn = %conn.key_string(), error = %err, "websocket read failed");
                conn.cancel(Some(anyhow::Error::new(err).into()));
                break;
            }
        };
        for line in text.as_str().split_inclusive('\n') {
            let Some(msg) = WireMessage::decode(line) else {
                debug!(conn = %conn.key_string(), line, "dropping malformed message");
                continue;
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                res = incoming.send(msg) => {
                    if res.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Write queued messages, batching consecutive ones into a single text
/// frame of at most [`MAX_FRAME_BYTES`]. Sends a close frame on return.
pub(crate) async fn write_loop(
    conn: Arc<Connection>,
    mut tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<WireMessage>,
) {
    let cancel = conn.cancel_token();
    // a line that did not fit in the previous frame
    let mut carry: Option<String> = None;
    loop {
        let mut frame = match carry.take() {
            Some(line) => line,
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                msg = outbound.recv() => match msg {
                    Some(msg) => msg.encode(),
                    None => break,
                },
            },
        };
        while frame.len() < MAX_FRAME_BYTES {
            let Ok(msg) = outbound.try_recv() else {
                break;
            };
            let line = msg.encode();
            if frame.len() + line.len() > MAX_FRAME_BYTES {
                carry = Some(line);
                break;
            }
            frame.push_str(&line);
        }
        let frame = Message::Text(frame.into());
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = tx.send(frame) => res,
        };
        if let Err(err) = sent {
            warn!(conn = %conn.key_string(), error = %err, "websocket write failed");
            conn.cancel(Some(anyhow::Error::new(err).into()));
            break;
        }
    }
    let _ = tx.send(Message::Close(None)).await;
}
