//! Origin & Upgrade Gate (§4.A) and Session (§4.D).
//!
//! An `accept_hdr_async` callback inspects the raw HTTP upgrade request
//! before any WebSocket frame exists, then a split `ws_tx`/`ws_rx` pair
//! drives a read loop and a write task talking through an outbound
//! `mpsc` channel. Admission and every later mutation go through a
//! `RoomHandle` rather than touching shared room state directly.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use http::StatusCode;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::config::Config;
use crate::error::{AdmissionError, ProtocolError};
use crate::protocol::{parse_inbound_control, BinaryFrame, InboundControl, OutboundControl};
use crate::room::{new_session_log_id, AcquireOutcome, JoinClaim, JoinOutcome, OutboundEvent, Registry, RoomHandle};

/// Query parameters recognised on the upgrade request (§4.A step 3).
#[derive(Debug, Clone, Default)]
struct UpgradeQuery {
    room: Option<String>,
    client_id: u64,
    username: Option<String>,
    admin: bool,
}

/// Decodes `a=1&b=2` query strings without pulling in a URL crate: the
/// recognised keys are all simple ASCII tokens, so a minimal
/// percent-decoder is all this relay needs.
fn parse_query(query: &str) -> UpgradeQuery {
    let mut result = UpgradeQuery::default();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or("");
        let value = percent_decode(parts.next().unwrap_or(""));
        match key {
            "room" => result.room = Some(value),
            "clientId" => result.client_id = value.parse().unwrap_or(0),
            "username" => result.username = Some(value),
            "admin" => result.admin = value == "true",
            _ => {}
        }
    }
    result
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Outcome of the upgrade-time validation run inside the `accept_hdr_async`
/// callback, captured for the async code that runs after the handshake.
#[derive(Debug, Clone)]
struct UpgradeContext {
    query: UpgradeQuery,
}

/// Rejects a handshake with a plain HTTP status, before any WebSocket
/// frame has ever been sent (§4.A "destroys the socket with no frame").
fn reject(status: StatusCode) -> ErrorResponse {
    Response::builder()
        .status(status)
        .body(None)
        .expect("building a bodiless HTTP response never fails")
}

/// Runs the Origin & Upgrade Gate, then the Session read/write loop, for
/// one accepted TCP connection.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<Registry>,
    config: Arc<Config>,
) {
    let log_id = new_session_log_id();
    let context: Arc<Mutex<Option<UpgradeContext>>> = Arc::new(Mutex::new(None));
    let context_for_callback = Arc::clone(&context);
    let config_for_callback = Arc::clone(&config);

    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() != config_for_callback.relay_path {
            debug!("[session:{log_id}] {}", AdmissionError::PathNotAllowed);
            return Err(reject(StatusCode::NOT_FOUND));
        }

        if let Some(origin) = req.headers().get("origin").and_then(|v| v.to_str().ok()) {
            if !config_for_callback.origin_allowed(origin) {
                debug!("[session:{log_id}] {} (origin: {origin})", AdmissionError::OriginNotAllowed);
                return Err(reject(StatusCode::FORBIDDEN));
            }
        }

        let query = req.uri().query().map(parse_query).unwrap_or_default();
        *context_for_callback.lock().unwrap() = Some(UpgradeContext { query });
        Ok(resp)
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(stream) => stream,
        Err(err) => {
            debug!("[session:{log_id}] upgrade rejected from {addr}: {err}");
            return;
        }
    };

    let UpgradeContext { query } = context
        .lock()
        .unwrap()
        .take()
        .expect("callback runs before accept_hdr_async resolves Ok");

    let room_name = query.room.unwrap_or_else(|| config.room_fallback.clone());
    let client_id = query.client_id;
    let username = query
        .username
        .unwrap_or_else(|| format!("User{client_id}"));
    let admin_claim = query.admin;

    info!(
        "[session:{log_id}] upgrade accepted from {addr}: room='{room_name}' clientId={client_id} username='{username}' admin_claim={admin_claim}"
    );

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel(config.session_queue_depth);

    // A room can vanish between `acquire_for_join` returning its handle and
    // `join` reaching its executor (the room just emptied and is mid
    // teardown). That shows up as `join` returning `None`; retry once
    // against a fresh acquire, which is guaranteed not to hand back the
    // same dead handle since `release` runs before the executor task ends.
    for attempt in 0..2 {
        let room = match registry.acquire_for_join(&room_name, &config) {
            AcquireOutcome::Acquired(room) => room,
            AcquireOutcome::BudgetExceeded(max_rooms) => {
                let err = AdmissionError::RoomBudgetExceeded(max_rooms);
                warn!("[session:{log_id}] rejected: {err}");
                send_room_full(&mut ws_tx, &err.to_string()).await;
                return;
            }
        };

        let claim = JoinClaim {
            client_id,
            username: username.clone(),
            admin_claim,
            outbound: outbound_tx.clone(),
        };

        match room.join(claim).await {
            Some(outcome) => {
                run_session(outcome, room, client_id, ws_tx, ws_rx, outbound_rx, &config, log_id).await;
                return;
            }
            None if attempt == 0 => {
                warn!("[session:{log_id}] room '{room_name}' vanished mid-join, retrying once");
            }
            None => {
                warn!("[session:{log_id}] giving up after a second failed join");
                return;
            }
        }
    }
}

async fn run_session(
    outcome: JoinOutcome,
    room: RoomHandle,
    client_id: u64,
    mut ws_tx: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<TcpStream>,
        Message,
    >,
    mut ws_rx: futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<TcpStream>>,
    mut outbound_rx: mpsc::Receiver<OutboundEvent>,
    config: &Config,
    log_id: uuid::Uuid,
) {
    let snapshot = match outcome {
        JoinOutcome::Admitted { snapshot, .. } => snapshot,
        JoinOutcome::Full => {
            warn!("[session:{log_id}] {}", AdmissionError::RoomFull);
            send_room_full(&mut ws_tx, &AdmissionError::RoomFull.to_string()).await;
            return;
        }
        JoinOutcome::Duplicate => {
            warn!("[session:{log_id}] {}", AdmissionError::DuplicateClientId);
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "clientId already in use".into(),
                })))
                .await;
            return;
        }
    };

    if ws_tx
        .send(Message::Binary(BinaryFrame::Sync(snapshot).encode().into()))
        .await
        .is_err()
    {
        room.leave(client_id).await;
        return;
    }

    let write_task = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let message = match event {
                OutboundEvent::Binary(bytes) => Message::Binary(bytes.into()),
                OutboundEvent::Text(text) => Message::Text(text.into()),
                OutboundEvent::Close { code, reason } => Message::Close(Some(CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                })),
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut protocol_errors: u32 = 0;

    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!("[session:{log_id}] websocket error: {err}");
                break;
            }
        };

        match message {
            Message::Close(_) => break,
            Message::Binary(bytes) => match BinaryFrame::decode(&bytes) {
                Ok(frame) => room.binary(client_id, frame).await,
                Err(ProtocolError::MalformedBinaryFrame) => {
                    protocol_errors += 1;
                    warn!("[session:{log_id}] malformed binary frame ({protocol_errors} so far)");
                    if protocol_errors >= config.protocol_error_threshold {
                        break;
                    }
                }
                Err(ProtocolError::MalformedJson) => unreachable!("binary decode never returns this"),
            },
            Message::Text(text) => match parse_inbound_control(text.as_str()) {
                Ok(Some(control)) => handle_control(&room, client_id, control).await,
                Ok(None) => debug!("[session:{log_id}] ignoring unrecognised control type"),
                Err(_) => {
                    protocol_errors += 1;
                    warn!("[session:{log_id}] malformed control frame ({protocol_errors} so far)");
                    if protocol_errors >= config.protocol_error_threshold {
                        break;
                    }
                }
            },
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    room.leave(client_id).await;
    write_task.abort();
}

async fn handle_control(room: &RoomHandle, client_id: u64, control: InboundControl) {
    match control {
        InboundControl::ClientJoined { client_id: claimed_id, username } => {
            room.client_joined_notice(claimed_id, username).await;
        }
        InboundControl::ClientLeft { client_id: claimed_id, .. } => {
            if claimed_id == client_id {
                room.leave(client_id).await;
            }
        }
        InboundControl::EndRoom { client_id: claimed_id, .. } => {
            if claimed_id == client_id {
                room.end_room(client_id).await;
            }
        }
    }
}

async fn send_room_full(
    ws_tx: &mut futures_util::stream::SplitSink<tokio_tungstenite::WebSocketStream<TcpStream>, Message>,
    message: &str,
) {
    let frame = OutboundControl::RoomFull { error: message.to_string() };
    let text = serde_json::to_string(&frame).expect("control message always serializes");
    let _ = ws_tx.send(Message::Text(text.into())).await;
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::Library(4001),
            reason: "Room is full".into(),
        })))
        .await;
}
