//! WebSocket transport for the tenant change feed.
//!
//! Each connection subscribes to `pipeline-updates-{tenant_id}` and receives
//! the serialized [`FeedEvent`](super::feed::FeedEvent) JSON published by
//! lead intake. A subscriber that falls behind gets a `Lagged` event in
//! place of the dropped ones. Keep-alive uses server pings; a client that
//! stops answering is dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{Sink, Stream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;

use super::api::AppState;
use super::feed::{FeedEvent, channel_name};

/// Interval between server-initiated pings.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A connection with no pong for this long is considered dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(tenant_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, tenant_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, tenant_id: String) {
    let (sender, receiver) = socket.split();
    let rx = state.feed.subscribe(&tenant_id);
    tracing::debug!(channel = %channel_name(&tenant_id), "change feed subscriber connected");
    run_socket_loop(sender, receiver, rx, &tenant_id).await;
    tracing::debug!(channel = %channel_name(&tenant_id), "change feed subscriber disconnected");
}

/// Lag notice for a subscriber that missed `skipped` events.
fn lagged_notice(tenant_id: &str, skipped: u64) -> Option<String> {
    let event = FeedEvent::Lagged {
        tenant_id: tenant_id.to_string(),
        skipped,
    };
    match serde_json::to_string(&event) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize lag notice");
            None
        }
    }
}

/// Forward feed messages to the socket until either side goes away.
async fn run_socket_loop<S, R, E>(
    mut sender: S,
    mut receiver: R,
    mut rx: broadcast::Receiver<String>,
    tenant_id: &str,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
{
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick is immediate.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(tenant_id = %tenant_id, skipped, "change feed subscriber lagged");
                        if let Some(notice) = lagged_notice(tenant_id, skipped) {
                            if sender.send(Message::Text(notice.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::feed::ChangeFeed;
    use crate::crm::models::LeadRow;
    use chrono::Utc;
    use futures::channel::mpsc;

    fn row(id: &str, tenant: &str) -> LeadRow {
        let now = Utc::now();
        LeadRow {
            id: id.into(),
            tenant_id: tenant.into(),
            name: "Ana".into(),
            email: None,
            phone: None,
            stage_id: "s1".into(),
            estimated_value: None,
            params: serde_json::Value::Null,
            stage_entered_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    fn text_json(frame: Option<Message>) -> serde_json::Value {
        match frame {
            Some(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("Expected a text frame, got {:?}", other),
        }
    }

    /// In-memory socket halves: what the server sends, and what the client says.
    fn socket() -> (
        mpsc::UnboundedSender<Message>,
        mpsc::UnboundedReceiver<Message>,
        mpsc::UnboundedSender<Result<Message, axum::Error>>,
        mpsc::UnboundedReceiver<Result<Message, axum::Error>>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded();
        let (in_tx, in_rx) = mpsc::unbounded();
        (out_tx, out_rx, in_tx, in_rx)
    }

    #[test]
    fn test_keepalive_constants() {
        assert!(PONG_TIMEOUT > PING_INTERVAL);
    }

    #[tokio::test]
    async fn test_loop_forwards_events_and_closes_on_client_close() {
        let feed = ChangeFeed::new(8);
        let (out_tx, mut out_rx, in_tx, in_rx) = socket();
        let task = tokio::spawn(run_socket_loop(out_tx, in_rx, feed.subscribe("t1"), "t1"));

        feed.publish(&FeedEvent::LeadInserted { record: row("l1", "t1") });
        feed.publish(&FeedEvent::LeadInserted { record: row("other", "t2") });
        let value = text_json(out_rx.next().await);
        assert_eq!(value["type"], "LeadInserted");
        assert_eq!(value["data"]["record"]["id"], "l1");

        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        task.await.unwrap();
        assert!(matches!(out_rx.next().await, Some(Message::Close(None))));
        assert!(out_rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_loop_sends_lag_notice_then_resumes() {
        let feed = ChangeFeed::new(1);
        let rx = feed.subscribe("t1");
        for id in ["l1", "l2", "l3"] {
            feed.publish(&FeedEvent::LeadInserted { record: row(id, "t1") });
        }

        let (out_tx, mut out_rx, in_tx, in_rx) = socket();
        let task = tokio::spawn(run_socket_loop(out_tx, in_rx, rx, "t1"));

        let notice = text_json(out_rx.next().await);
        assert_eq!(notice["type"], "Lagged");
        assert_eq!(notice["data"]["skipped"], 2);
        assert_eq!(notice["data"]["tenant_id"], "t1");
        let value = text_json(out_rx.next().await);
        assert_eq!(value["data"]["record"]["id"], "l3");

        // Client hangs up without a close frame.
        drop(in_tx);
        task.await.unwrap();
        assert!(matches!(out_rx.next().await, Some(Message::Close(None))));
    }

    #[tokio::test]
    async fn test_loop_ends_on_client_error() {
        let feed = ChangeFeed::new(8);
        let (out_tx, mut out_rx, in_tx, in_rx) = socket();
        let task = tokio::spawn(run_socket_loop(out_tx, in_rx, feed.subscribe("t1"), "t1"));

        in_tx
            .unbounded_send(Err(axum::Error::new(std::io::Error::other("reset"))))
            .unwrap();
        task.await.unwrap();
        assert!(matches!(out_rx.next().await, Some(Message::Close(None))));
    }

    #[test]
    fn test_lagged_notice_decodes_as_feed_event() {
        let json = lagged_notice("t1", 7).unwrap();
        let event: FeedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(
            event,
            FeedEvent::Lagged {
                tenant_id: "t1".into(),
                skipped: 7
            }
        );
    }

    #[tokio::test]
    async fn test_subscribers_only_see_their_tenant() {
        let feed = ChangeFeed::new(8);
        let mut rx_a = feed.subscribe("tenant-a");
        let mut rx_b = feed.subscribe("tenant-b");

        let row = row("l1", "tenant-a");
        assert_eq!(feed.publish(&FeedEvent::LeadInserted { record: row }), 1);

        let msg = rx_a.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(value["data"]["record"]["id"], "l1");
        assert!(matches!(
            rx_b.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
