//! Wire-layer connection handling -- the axum half of C11.
//!
//! Each accepted connection becomes one read task (this module) plus a
//! single writer task serving the bounded outbound queue already modeled by
//! `broadcast::Outbound`. The read task decodes envelopes, routes them
//! through `ServerEvent`, and either answers directly or delegates into the
//! dispatcher/lifecycle/channel modules, none of which ever touch the
//! socket itself.

use crate::auth::VerifiedIdentity;
use crate::broadcast::RoomKind;
use crate::dispatcher::{BatchIntent, ChunkRef, EditIntent, EditOutcome};
use crate::error::AppError;
use crate::lseq::LseqId;
use crate::protocol::{Envelope, ServerEvent};
use crate::registry::SessionId;
use crate::state::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

const AUTH_FAILURE: u16 = 1008;
const SERVER_ERROR: u16 = 1011;

/// Bounded per-socket outbound queue: overflow closes the session rather
/// than blocking the fan-out.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// How long the writer task gets to flush a close frame before the
/// connection is torn down unconditionally.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// What handling one envelope produced: either a reply to send back, or a
/// close directive for a failure the client cannot be expected to recover
/// from -- a genuinely unexpected failure (durable store or hot tier down),
/// not a validation/authorization/not-found/conflict outcome -- closes with
/// 1011 instead of looping the same `systemmessage` forever.
enum ConnOutcome {
    Reply(Envelope),
    Close(u16, String),
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = params.get("token").cloned();
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, token: Option<String>) {
    let identity = match token {
        Some(token) => state.verifier.verify(&token).await,
        None => Err(AppError::Authorization("missing token".into())),
    };
    let identity: VerifiedIdentity = match identity {
        Ok(identity) => identity,
        Err(err) => {
            warn!(component = "ws", error = %err, "handshake auth failed");
            close_with(&mut socket, AUTH_FAILURE, "authentication failed").await;
            return;
        }
    };

    let session_id: SessionId = Uuid::new_v4();
    let user_id = identity.user_id;
    state.registry.register(session_id, user_id);

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE_CAPACITY);
    state.broadcaster.register_sender(session_id, outbound_tx);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (close_tx, close_rx) = oneshot::channel::<(u16, String)>();

    let writer = tokio::spawn(async move {
        tokio::pin!(close_rx);
        loop {
            tokio::select! {
                maybe_envelope = outbound_rx.recv() => {
                    match maybe_envelope {
                        Some(envelope) => {
                            let Ok(raw) = envelope.to_json() else { continue };
                            if ws_sender.send(Message::Text(raw)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                result = &mut close_rx => {
                    if let Ok((code, reason)) = result {
                        let _ = ws_sender
                            .send(Message::Close(Some(CloseFrame { code, reason: Cow::Owned(reason) })))
                            .await;
                    }
                    break;
                }
            }
        }
    });

    info!(component = "ws", %session_id, %user_id, "connection established");

    let mut close_reason: Option<(u16, String)> = None;
    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(_) => break,
        };
        let raw = match msg {
            Message::Text(raw) => raw,
            Message::Close(_) => break,
            _ => continue,
        };

        let envelope = match Envelope::from_json(&raw) {
            Ok(envelope) => envelope,
            Err(_) => {
                state
                    .broadcaster
                    .send_to(session_id, Envelope::error("unknown", "malformed envelope"));
                continue;
            }
        };

        match handle_event(&state, session_id, user_id, &envelope).await {
            ConnOutcome::Reply(reply) => state.broadcaster.send_to(session_id, reply),
            ConnOutcome::Close(code, reason) => {
                warn!(component = "ws", %session_id, code, %reason, "closing connection on unexpected failure");
                close_reason = Some((code, reason));
                break;
            }
        }
    }

    teardown_session(&state, session_id).await;

    match close_reason {
        Some((code, reason)) => {
            let _ = close_tx.send((code, reason));
            let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer).await;
        }
        None => writer.abort(),
    }

    info!(component = "ws", %session_id, "connection closed");
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Owned(reason.to_string()),
        })))
        .await;
}

/// Detach a closed session from every room it held, triggering the
/// last-viewer write-through for any document it was the final viewer of.
async fn teardown_session(state: &AppState, session_id: SessionId) {
    let session = state.registry.session(session_id);
    state.registry.unregister(session_id);
    state.broadcaster.remove_sender(session_id);

    if let Some(session) = session {
        if let Some(doc_id) = session.current_doc {
            state.broadcaster.broadcast(
                doc_id,
                RoomKind::Doc,
                "userLeftDoc",
                json!({ "docId": doc_id, "userId": session.user_id }),
                None,
            );
            state.lifecycle.on_last_viewer_leave(doc_id).await;
        }
        if let Some(channel_id) = session.current_channel {
            state.broadcaster.broadcast(
                channel_id,
                RoomKind::Channel,
                "userLeft",
                json!({ "channelId": channel_id, "userId": session.user_id }),
                None,
            );
        }
    }
}

fn field_str<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

fn field_uuid(data: &Value, key: &str) -> Option<Uuid> {
    field_str(data, key).and_then(|s| Uuid::parse_str(s).ok())
}

fn field_lseq(data: &Value, key: &str) -> Option<LseqId> {
    field_str(data, key).and_then(LseqId::parse)
}

/// Map a fallible result into the reply-or-close split. Kinds the error
/// taxonomy marks as client-facing (`is_system_message`/`is_protocol_error`)
/// stay a `systemmessage`; anything else is not something the client sent
/// wrong, so the connection closes rather than repeating the failure.
fn render_result(result: Result<Envelope, AppError>) -> ConnOutcome {
    match result {
        Ok(envelope) => ConnOutcome::Reply(envelope),
        Err(err) if err.is_system_message() || err.is_protocol_error() => {
            ConnOutcome::Reply(Envelope::system_message(err.to_string()))
        }
        Err(err) => ConnOutcome::Close(SERVER_ERROR, err.to_string()),
    }
}

async fn handle_event(state: &AppState, session_id: SessionId, user_id: Uuid, envelope: &Envelope) -> ConnOutcome {
    let Some(event) = ServerEvent::from_str(&envelope.event) else {
        return ConnOutcome::Reply(Envelope::error(envelope.event.clone(), "unrecognized event"));
    };
    let data = &envelope.data;

    match event {
        ServerEvent::Ping => ConnOutcome::Reply(Envelope::new("pong", json!({}))),

        ServerEvent::CreateChannel => {
            let Some(name) = field_str(data, "name") else {
                return ConnOutcome::Reply(Envelope::system_message("name is required"));
            };
            render_result(
                state
                    .channels
                    .create_channel(name, user_id)
                    .await
                    .map(|channel| Envelope::new("docListChanged", json!({ "channel": channel }))),
            )
        }

        ServerEvent::JoinChannel => {
            let Some(channel_id) = field_uuid(data, "channelId") else {
                return ConnOutcome::Reply(Envelope::system_message("channelId is required"));
            };
            render_result(
                state
                    .channels
                    .join_channel(channel_id, user_id)
                    .await
                    .map(|()| Envelope::new("joinChannel", json!({ "channelId": channel_id }))),
            )
        }

        ServerEvent::QuitChannel => {
            let Some(channel_id) = field_uuid(data, "channelId") else {
                return ConnOutcome::Reply(Envelope::system_message("channelId is required"));
            };
            render_result(
                state
                    .channels
                    .quit_channel(channel_id, user_id)
                    .await
                    .map(|()| Envelope::new("quitChannel", json!({ "channelId": channel_id }))),
            )
        }

        ServerEvent::ListChannel => render_result(
            state
                .channels
                .list_channels_for_user(user_id)
                .await
                .map(|channels| Envelope::new("docList", json!({ "channels": channels }))),
        ),

        ServerEvent::EnterChannel => {
            let Some(channel_id) = field_uuid(data, "channelId") else {
                return ConnOutcome::Reply(Envelope::system_message("channelId is required"));
            };
            match state.channels.is_member(channel_id, user_id).await {
                Ok(true) => {
                    state.registry.attach_channel(session_id, channel_id);
                    state.broadcaster.broadcast(
                        channel_id,
                        RoomKind::Channel,
                        "userEntered",
                        json!({ "channelId": channel_id, "userId": user_id }),
                        Some(session_id),
                    );
                    ConnOutcome::Reply(Envelope::new("docEntered", json!({ "channelId": channel_id })))
                }
                Ok(false) => ConnOutcome::Reply(Envelope::system_message("not a member of this channel")),
                Err(err) => render_result(Err(err)),
            }
        }

        ServerEvent::LeaveChannel => {
            let prior = state.registry.session(session_id).and_then(|s| s.current_channel);
            state.registry.detach_channel(session_id);
            if let Some(channel_id) = prior {
                state.broadcaster.broadcast(
                    channel_id,
                    RoomKind::Channel,
                    "userLeft",
                    json!({ "channelId": channel_id, "userId": user_id }),
                    Some(session_id),
                );
            }
            ConnOutcome::Reply(Envelope::new("docLeft", json!({})))
        }

        ServerEvent::CreateDoc => {
            let Some(session) = state.registry.session(session_id) else {
                return ConnOutcome::Reply(Envelope::system_message("session not found"));
            };
            let Some(channel_id) = session.current_channel else {
                return ConnOutcome::Reply(Envelope::system_message("must enter a channel first"));
            };
            let Some(name) = field_str(data, "name").map(str::to_string) else {
                return ConnOutcome::Reply(Envelope::system_message("name is required"));
            };
            let parent_id = field_uuid(data, "parentId");
            let doc = crate::document::Document::new_leaf(channel_id, name, parent_id, user_id, state.config.service_version);
            match state.store.create_doc(&doc).await {
                Ok(()) => {
                    state.cache.put(doc.id, doc.clone()).await;
                    state.broadcaster.broadcast(
                        channel_id,
                        RoomKind::Channel,
                        "docListChanged",
                        json!({ "channelId": channel_id, "docId": doc.id }),
                        None,
                    );
                    ConnOutcome::Reply(Envelope::new("docCreated", json!({ "docId": doc.id, "name": doc.name })))
                }
                Err(err) => render_result(Err(err)),
            }
        }

        ServerEvent::DeleteDoc => {
            let Some(doc_id) = field_uuid(data, "docId") else {
                return ConnOutcome::Reply(Envelope::system_message("docId is required"));
            };
            match state.store.soft_delete(doc_id).await {
                Ok(()) => {
                    state.cache.delete(doc_id).await;
                    state
                        .broadcaster
                        .broadcast(doc_id, RoomKind::Doc, "docDeleted", json!({ "docId": doc_id }), None);
                    ConnOutcome::Reply(Envelope::new("docDeleted", json!({ "docId": doc_id })))
                }
                Err(err) => render_result(Err(err)),
            }
        }

        ServerEvent::ListDoc => {
            let Some(session) = state.registry.session(session_id) else {
                return ConnOutcome::Reply(Envelope::system_message("session not found"));
            };
            let Some(channel_id) = session.current_channel else {
                return ConnOutcome::Reply(Envelope::system_message("must enter a channel first"));
            };
            let parent_id = field_uuid(data, "parentId");
            render_result(state.store.list_docs_for_channel(channel_id, parent_id).await.map(|docs| {
                let names: Vec<_> = docs
                    .into_iter()
                    .map(|d| json!({ "id": d.id, "name": d.name, "isDirectory": d.is_directory }))
                    .collect();
                Envelope::new("docList", json!({ "docs": names }))
            }))
        }

        ServerEvent::UpdateDoc => {
            let Some(doc_id) = field_uuid(data, "docId") else {
                return ConnOutcome::Reply(Envelope::system_message("docId is required"));
            };
            let name = field_str(data, "name").map(str::to_string);
            let parent_id = field_uuid(data, "parentId");
            match state.store.rename_move(doc_id, name, parent_id).await {
                Ok(()) => {
                    state
                        .broadcaster
                        .broadcast(doc_id, RoomKind::Doc, "docInfoChanged", json!({ "docId": doc_id }), None);
                    ConnOutcome::Reply(Envelope::new("docUpdated", json!({ "docId": doc_id })))
                }
                Err(err) => render_result(Err(err)),
            }
        }

        ServerEvent::EnterDoc => {
            let Some(doc_id) = field_uuid(data, "docId") else {
                return ConnOutcome::Reply(Envelope::system_message("docId is required"));
            };
            let doc = match state.cache.get(doc_id).await {
                Some(doc) => Some(doc),
                None => match state.store.load_doc(doc_id).await {
                    Ok(Some(doc)) => {
                        state.cache.put(doc_id, doc.clone()).await;
                        Some(doc)
                    }
                    Ok(None) => None,
                    Err(err) => return render_result(Err(err)),
                },
            };
            let Some(doc) = doc else {
                return ConnOutcome::Reply(Envelope::system_message("document not found"));
            };
            state.registry.attach_doc(session_id, doc_id);
            state.broadcaster.broadcast(
                doc_id,
                RoomKind::Doc,
                "userEnteredDoc",
                json!({ "docId": doc_id, "userId": user_id }),
                Some(session_id),
            );
            ConnOutcome::Reply(Envelope::new(
                "docEntered",
                json!({ "docId": doc_id, "content": doc.content, "version": doc.version.to_string() }),
            ))
        }

        ServerEvent::LeaveDoc => {
            let prior = state.registry.session(session_id).and_then(|s| s.current_doc);
            state.registry.detach_doc(session_id);
            if let Some(doc_id) = prior {
                state.broadcaster.broadcast(
                    doc_id,
                    RoomKind::Doc,
                    "userLeftDoc",
                    json!({ "docId": doc_id, "userId": user_id }),
                    Some(session_id),
                );
                state.lifecycle.on_last_viewer_leave(doc_id).await;
            }
            ConnOutcome::Reply(Envelope::new("docLeft", json!({})))
        }

        ServerEvent::EditDoc => {
            let Some(doc_id) = field_uuid(data, "docId") else {
                return ConnOutcome::Reply(Envelope::system_message("docId is required"));
            };
            let intent = match field_str(data, "intent") {
                Some("insert") => {
                    let Some(value) = field_str(data, "value").map(str::to_string) else {
                        return ConnOutcome::Reply(Envelope::system_message("value is required for insert"));
                    };
                    EditIntent::Insert {
                        left_id: field_lseq(data, "leftId"),
                        right_id: field_lseq(data, "rightId"),
                        value,
                    }
                }
                Some("delete") => {
                    let Some(id) = field_lseq(data, "id") else {
                        return ConnOutcome::Reply(Envelope::system_message("id is required for delete"));
                    };
                    EditIntent::Delete { id }
                }
                _ => return ConnOutcome::Reply(Envelope::system_message("unrecognized edit intent")),
            };
            match state.dispatcher.edit_doc(session_id, doc_id, intent).await {
                Ok(outcome) => ConnOutcome::Reply(render_edit_outcome(state, doc_id, session_id, outcome)),
                Err(err) => render_result(Err(err)),
            }
        }

        ServerEvent::EditDocBatch => {
            let Some(doc_id) = field_uuid(data, "docId") else {
                return ConnOutcome::Reply(Envelope::system_message("docId is required"));
            };
            let intent = match parse_batch_intent(data) {
                Ok(intent) => intent,
                Err(message) => return ConnOutcome::Reply(Envelope::system_message(message)),
            };
            match state.dispatcher.edit_doc_batch(session_id, doc_id, intent).await {
                Ok(outcome) => ConnOutcome::Reply(render_edit_outcome(state, doc_id, session_id, outcome)),
                Err(err) => render_result(Err(err)),
            }
        }

        ServerEvent::SyncDoc => {
            let Some(doc_id) = field_uuid(data, "docId") else {
                return ConnOutcome::Reply(Envelope::system_message("docId is required"));
            };
            render_result(
                state
                    .lifecycle
                    .sync(doc_id)
                    .await
                    .map(|()| Envelope::new("docSynced", json!({ "docId": doc_id }))),
            )
        }

        ServerEvent::SnapshotDoc => {
            let Some(doc_id) = field_uuid(data, "docId") else {
                return ConnOutcome::Reply(Envelope::system_message("docId is required"));
            };
            render_result(state.lifecycle.snapshot(doc_id).await.map(|doc| {
                Envelope::new(
                    "snapshotCreated",
                    json!({ "docId": doc_id, "version": doc.version.to_string() }),
                )
            }))
        }

        ServerEvent::GetChannelUsers => {
            let Some(channel_id) = field_uuid(data, "channelId") else {
                return ConnOutcome::Reply(Envelope::system_message("channelId is required"));
            };
            let users = state.registry.channel_users(channel_id);
            ConnOutcome::Reply(Envelope::new(
                "docStatus",
                json!({
                    "channelId": channel_id,
                    "users": users.into_iter().map(|(u, doc)| json!({ "userId": u, "currentDoc": doc })).collect::<Vec<_>>(),
                }),
            ))
        }

        ServerEvent::GetDocUsers => {
            let Some(doc_id) = field_uuid(data, "docId") else {
                return ConnOutcome::Reply(Envelope::system_message("docId is required"));
            };
            ConnOutcome::Reply(Envelope::new(
                "docStatus",
                json!({ "docId": doc_id, "users": state.registry.doc_users(doc_id) }),
            ))
        }

        ServerEvent::GetDocStatus => {
            let Some(doc_id) = field_uuid(data, "docId") else {
                return ConnOutcome::Reply(Envelope::system_message("docId is required"));
            };
            match state.cache.get(doc_id).await {
                Some(doc) => ConnOutcome::Reply(Envelope::new(
                    "docStatus",
                    json!({ "docId": doc_id, "status": doc.status, "version": doc.version.to_string() }),
                )),
                None => ConnOutcome::Reply(Envelope::system_message("document not found")),
            }
        }
    }
}

fn render_edit_outcome(state: &AppState, doc_id: Uuid, originator: SessionId, outcome: EditOutcome) -> Envelope {
    match outcome {
        EditOutcome::Applied {
            reply,
            broadcast_event,
            broadcast_payload,
        } => {
            state.dispatcher.broadcast_applied(doc_id, broadcast_event, broadcast_payload, originator);
            reply
        }
        EditOutcome::NoOp { reply } => reply,
        EditOutcome::Rejected { reason } => Envelope::edit_rejected(reason),
        EditOutcome::SystemMessage { message } => Envelope::system_message(message),
    }
}

fn parse_chunk_ref(data: &Value, key: &str) -> Option<ChunkRef> {
    let raw = field_str(data, key)?;
    if raw.starts_with("temp_") {
        Some(ChunkRef::Placeholder(raw.to_string()))
    } else {
        LseqId::parse(raw).map(ChunkRef::Id)
    }
}

fn parse_batch_intent(data: &Value) -> Result<BatchIntent, String> {
    if let Some(ops) = data.get("ops").and_then(Value::as_array) {
        let mut primitives = Vec::with_capacity(ops.len());
        for op in ops {
            match field_str(op, "kind") {
                Some("insert") => {
                    let temp_id = field_str(op, "tempId")
                        .ok_or_else(|| "tempId is required for a primitive insert".to_string())?
                        .to_string();
                    let value = field_str(op, "value")
                        .ok_or_else(|| "value is required for a primitive insert".to_string())?
                        .to_string();
                    primitives.push(crate::dispatcher::PrimitiveOp::Insert {
                        temp_id,
                        left_id: parse_chunk_ref(op, "leftId"),
                        right_id: parse_chunk_ref(op, "rightId"),
                        value,
                    });
                }
                Some("delete") => {
                    let id = parse_chunk_ref(op, "id")
                        .ok_or_else(|| "id is required for a primitive delete".to_string())?;
                    primitives.push(crate::dispatcher::PrimitiveOp::Delete { id });
                }
                _ => return Err("unrecognized primitive op kind".into()),
            }
        }
        return Ok(BatchIntent::Primitive(primitives));
    }

    if let Some(target_id) = parse_chunk_ref(data, "targetId") {
        let offset = data
            .get("offset")
            .and_then(Value::as_u64)
            .ok_or_else(|| "offset is required for a split insert".to_string())? as usize;
        let text = field_str(data, "text")
            .ok_or_else(|| "text is required for a split insert".to_string())?
            .to_string();
        return Ok(BatchIntent::SplitInsert { target_id, offset, text });
    }

    let text = field_str(data, "text")
        .ok_or_else(|| "text is required for a bulk insert".to_string())?
        .to_string();
    Ok(BatchIntent::BulkInsert {
        text,
        left_id: parse_chunk_ref(data, "leftId"),
        right_id: parse_chunk_ref(data, "rightId"),
    })
}
