//! Live stream WebSocket endpoint.
//!
//! # Session protocol
//! Client frames: `subscribe` (with optional replay `since`), `unsubscribe`,
//! `ping`. Server frames: `record`/`batch`, a single `live` transition
//! marker per subscription, `dropped`, `error`, `pong`.
//!
//! # Heartbeats
//! The server pings every 30 s; after two unanswered pings the socket is
//! closed with code 1001. A dropped transport puts this session's
//! subscriptions into the broker's grace window, so a client reconnecting
//! with the same subscription ids resumes without loss.

use crate::api::OpContext;
use crate::broker::{CloseReason, SubEvent, Subscription};
use crate::state::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use loghub_protocol::{error_codes, ClientFrame, LogRecord, ServerFrame, Since};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);
/// Unanswered pings tolerated before the socket is closed (code 1001).
const MAX_MISSED_PONGS: u32 = 2;
/// Records per replay batch frame.
const REPLAY_CHUNK: usize = 100;
const DEFAULT_REPLAY_LIMIT: u32 = 1_000;

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session(socket, state))
}

async fn session(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4().to_string();
    state.ws_observer.connection_opened(&conn_id).await;

    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(64);
    let mut subs: HashMap<String, Arc<Subscription>> = HashMap::new();
    let mut forwarders: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();

    let mut heartbeat = tokio::time::interval(HEARTBEAT_PERIOD);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // the first tick fires immediately
    let mut missed_pongs: u32 = 0;
    let mut close_reason = "client closed";

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                // Senders hold clones of out_tx; it can only close when the
                // session itself drops, so recv never yields None here.
                let Some(frame) = frame else { break };
                if !send_frame(&state, &conn_id, &mut sender, &frame).await {
                    close_reason = "send failed";
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    None => break,
                    Some(Err(e)) => {
                        state.ws_observer.connection_error(&conn_id, &e.to_string()).await;
                        close_reason = "transport error";
                        break;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        missed_pongs = 0;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Text(text))) => {
                        handle_text(
                            &state,
                            &conn_id,
                            &text,
                            &out_tx,
                            &mut subs,
                            &mut forwarders,
                        )
                        .await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        state.ws_observer.message(&conn_id, "binary", true, 0).await;
                        let _ = out_tx
                            .send(ServerFrame::Error {
                                code: error_codes::INVALID_REQUEST,
                                message: "binary frames are not supported".to_owned(),
                            })
                            .await;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if missed_pongs >= MAX_MISSED_PONGS {
                    debug!(connection = %conn_id, "two pings unanswered, closing");
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: 1001,
                            reason: "heartbeat timeout".into(),
                        })))
                        .await;
                    close_reason = "heartbeat timeout";
                    break;
                }
                missed_pongs += 1;
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    close_reason = "transport error";
                    break;
                }
            }
        }
    }

    // Transport gone: stop the sender loops and hand every subscription to
    // the broker's grace window.
    for (_, task) in forwarders {
        task.abort();
    }
    for id in subs.keys() {
        state.broker.transport_dropped(id).await;
    }
    state
        .ws_observer
        .connection_closed(&conn_id, close_reason)
        .await;
}

// ---------------------------------------------------------------------------
// Client frame handling
// ---------------------------------------------------------------------------

async fn handle_text(
    state: &AppState,
    conn_id: &str,
    text: &str,
    out_tx: &mpsc::Sender<ServerFrame>,
    subs: &mut HashMap<String, Arc<Subscription>>,
    forwarders: &mut HashMap<String, tokio::task::JoinHandle<()>>,
) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            state.ws_observer.message(conn_id, "invalid", true, text.len()).await;
            let _ = out_tx
                .send(ServerFrame::Error {
                    code: error_codes::INVALID_REQUEST,
                    message: format!("invalid frame: {e}"),
                })
                .await;
            return;
        }
    };

    match frame {
        ClientFrame::Ping => {
            state.ws_observer.message(conn_id, "ping", true, text.len()).await;
            let _ = out_tx.send(ServerFrame::Pong).await;
        }
        ClientFrame::Unsubscribe { id } => {
            state
                .ws_observer
                .message(conn_id, "unsubscribe", true, text.len())
                .await;
            if state.broker.unsubscribe(&id).await {
                // The forwarder sees the close event and exits on its own.
                forwarders.remove(&id);
                subs.remove(&id);
            } else {
                let _ = out_tx
                    .send(ServerFrame::Error {
                        code: error_codes::NOT_FOUND,
                        message: format!("unknown subscription '{id}'"),
                    })
                    .await;
            }
        }
        ClientFrame::Subscribe {
            id,
            filter,
            since,
            replay_limit,
            overflow,
        } => {
            state
                .ws_observer
                .message(conn_id, "subscribe", true, text.len())
                .await;
            let subscribed = state
                .broker
                .subscribe(id.clone(), filter.clone(), overflow.unwrap_or_default(), None)
                .await;
            let subscribed = match subscribed {
                Ok(subscribed) => subscribed,
                Err(e) => {
                    let code = match &e {
                        crate::broker::SubscribeError::TooManySubscribers(_) => error_codes::BUSY,
                        crate::broker::SubscribeError::DuplicateId(_) => {
                            error_codes::INVALID_PARAMS
                        }
                    };
                    let _ = out_tx
                        .send(ServerFrame::Error {
                            code,
                            message: e.to_string(),
                        })
                        .await;
                    return;
                }
            };
            let subscription = subscribed.subscription;

            // Replay phase: deliver history up to the current head, then the
            // live marker; the watermark suppresses duplicates.
            if let Some(since) = since {
                let limit = replay_limit.unwrap_or(DEFAULT_REPLAY_LIMIT);
                match state
                    .api
                    .replay(
                        &filter,
                        &since,
                        limit,
                        OpContext::with_timeout(state.api.default_timeout),
                    )
                    .await
                {
                    Ok(history) => {
                        if let Some(last) = history.last() {
                            subscription.set_replay_watermark(last.id);
                            subscription.set_cursor(last.id);
                        } else if let Since::LastId(last_id) = since {
                            subscription.set_replay_watermark(last_id);
                        }
                        for chunk in history.chunks(REPLAY_CHUNK) {
                            let _ = out_tx
                                .send(ServerFrame::Batch {
                                    records: chunk.to_vec(),
                                })
                                .await;
                        }
                    }
                    Err(e) => {
                        warn!(subscription = %id, error = %e, "replay failed");
                        let _ = out_tx
                            .send(ServerFrame::Error {
                                code: error_codes::INTERNAL,
                                message: format!("replay failed: {e}"),
                            })
                            .await;
                    }
                }
            }
            let _ = out_tx.send(ServerFrame::Live).await;

            let task = tokio::spawn(forward_subscription(
                subscription.clone(),
                out_tx.clone(),
            ));
            forwarders.insert(id.clone(), task);
            subs.insert(id, subscription);
        }
    }
}

/// Per-subscription sender loop: drain buffered events into the session's
/// outbound channel until the subscription closes.
async fn forward_subscription(sub: Arc<Subscription>, out_tx: mpsc::Sender<ServerFrame>) {
    loop {
        match sub.next_event().await {
            SubEvent::Records(records) => {
                if let Some(last) = records.last() {
                    sub.set_cursor(last.id);
                }
                let frame = to_record_frame(records);
                if out_tx.send(frame).await.is_err() {
                    return;
                }
            }
            SubEvent::Dropped(count) => {
                if out_tx.send(ServerFrame::Dropped { count }).await.is_err() {
                    return;
                }
            }
            SubEvent::Closed(reason) => {
                if reason == CloseReason::SlowConsumer {
                    let _ = out_tx
                        .send(ServerFrame::Error {
                            code: error_codes::BUSY,
                            message: reason.as_str().to_owned(),
                        })
                        .await;
                }
                return;
            }
        }
    }
}

fn to_record_frame(mut records: Vec<LogRecord>) -> ServerFrame {
    if records.len() == 1 {
        ServerFrame::Record {
            record: records.remove(0),
        }
    } else {
        ServerFrame::Batch { records }
    }
}

async fn send_frame(
    state: &AppState,
    conn_id: &str,
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> bool {
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "failed to serialize server frame");
            return true;
        }
    };
    let frame_type = match frame {
        ServerFrame::Record { .. } => "record",
        ServerFrame::Batch { .. } => "batch",
        ServerFrame::Live => "live",
        ServerFrame::Dropped { .. } => "dropped",
        ServerFrame::Error { .. } => "error",
        ServerFrame::Pong => "pong",
    };
    state
        .ws_observer
        .message(conn_id, frame_type, false, json.len())
        .await;
    sender.send(Message::Text(json.into())).await.is_ok()
}
