//! One actor per live connection, created only once the connection is
//! authenticated and joined to its conversation.
//!
//! Every frame for the client (broadcasts, acks, error frames) comes through
//! the session's single bounded queue in the registry, so a sender always
//! sees the echo of its own message before the ack for it. Inbound frames
//! are handled one at a time with `ctx.wait` to keep each user's own actions
//! in program order.

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::middleware::auth::AuthenticatedUser;
use crate::middleware::error_handling::error_frame_json;
use crate::services::MessageEventRouter;
use crate::state::AppState;
use crate::websocket::events::AckFrame;
use crate::websocket::message_types::{parse_client_frame, ClientEvent};
use crate::websocket::SubscriberId;
use actix::prelude::*;
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WsSession {
    conversation_id: i64,
    user: AuthenticatedUser,
    subscriber_id: SubscriberId,
    outbound: Option<mpsc::Receiver<String>>,
    state: AppState,
    hb: Instant,
}

impl WsSession {
    pub fn new(
        conversation_id: i64,
        user: AuthenticatedUser,
        subscriber_id: SubscriberId,
        outbound: mpsc::Receiver<String>,
        state: AppState,
    ) -> Self {
        Self {
            conversation_id,
            user,
            subscriber_id,
            outbound: Some(outbound),
            state,
            hb: Instant::now(),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                tracing::warn!(
                    user_id = %act.user.id,
                    conversation_id = act.conversation_id,
                    "websocket heartbeat failed, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    /// Runs one client frame to completion before the next is looked at.
    fn handle_frame(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let parsed = parse_client_frame(text);
        let router = self.state.router.clone();
        let registry = self.state.registry.clone();
        let user = self.user.clone();
        let conversation_id = self.conversation_id;
        let subscriber_id = self.subscriber_id;

        let fut = async move {
            let (event_type, result) = match parsed {
                Ok(event) => {
                    let event_type = event.event_type();
                    (event_type, dispatch(&router, conversation_id, &user, event).await)
                }
                Err(e) => ("invalid", Err(e)),
            };

            let frame = match result {
                Ok(ack) => {
                    metrics::record_event(event_type, "ok");
                    serde_json::to_string(&ack)
                        .unwrap_or_else(|_| error_frame_json(&AppError::Internal))
                }
                Err(e) => {
                    metrics::record_event(event_type, e.error_code());
                    if e.status_code() >= 500 {
                        tracing::warn!(
                            user_id = %user.id,
                            conversation_id,
                            event = event_type,
                            error = %e,
                            "event failed"
                        );
                    } else {
                        tracing::debug!(
                            user_id = %user.id,
                            conversation_id,
                            event = event_type,
                            error = %e,
                            "event rejected"
                        );
                    }
                    error_frame_json(&e)
                }
            };
            registry.send_to(conversation_id, subscriber_id, frame).await;
        };
        ctx.wait(fut.into_actor(self));
    }
}

async fn dispatch(
    router: &MessageEventRouter,
    conversation_id: i64,
    user: &AuthenticatedUser,
    event: ClientEvent,
) -> AppResult<AckFrame> {
    let ack = AckFrame::new(event.event_type());
    match event {
        ClientEvent::ChatMessage {
            content,
            parent_message_id,
            attachments,
        } => router
            .send(conversation_id, user, content, parent_message_id, attachments)
            .await
            .map(|message| ack.with_message(message.id)),
        ClientEvent::TypingIndicator { is_typing } => router
            .set_typing(conversation_id, user, is_typing)
            .await
            .map(|_| ack),
        ClientEvent::ReadReceipt { message_id } => router
            .mark_read(conversation_id, user, message_id)
            .await
            .map(|_| ack.with_message(message_id)),
        ClientEvent::MessageReaction { message_id, emoji } => router
            .react(conversation_id, user, message_id, &emoji)
            .await
            .map(|action| ack.with_message(message_id).with_action(action)),
        ClientEvent::MessageEdit {
            message_id,
            content,
        } => router
            .edit(conversation_id, user, message_id, content)
            .await
            .map(|_| ack.with_message(message_id)),
        ClientEvent::MessageDelete { message_id } => router
            .soft_delete(conversation_id, user, message_id)
            .await
            .map(|_| ack.with_message(message_id)),
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(
            user_id = %self.user.id,
            conversation_id = self.conversation_id,
            "websocket session joined"
        );
        metrics::WS_SESSIONS_ACTIVE.inc();

        self.hb(ctx);
        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(ReceiverStream::new(outbound));
        }

        let router = self.state.router.clone();
        let user = self.user.clone();
        let conversation_id = self.conversation_id;
        ctx.wait(
            async move { router.session_joined(conversation_id, &user).await }.into_actor(self),
        );
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(
            user_id = %self.user.id,
            conversation_id = self.conversation_id,
            "websocket session closed"
        );
        metrics::WS_SESSIONS_ACTIVE.dec();

        // Leave the broadcast group before announcing, so the offline frame
        // is not queued for this dead session.
        let registry = self.state.registry.clone();
        let router = self.state.router.clone();
        let user = self.user.clone();
        let conversation_id = self.conversation_id;
        let subscriber_id = self.subscriber_id;
        actix::spawn(async move {
            registry
                .remove_subscriber(conversation_id, subscriber_id)
                .await;
            router.session_left(conversation_id, &user).await;
        });
    }
}

/// Frames queued for this client.
impl StreamHandler<String> for WsSession {
    fn handle(&mut self, frame: String, ctx: &mut Self::Context) {
        ctx.text(frame);
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        // The registry dropped our queue: evicted as a slow consumer.
        tracing::warn!(
            user_id = %self.user.id,
            conversation_id = self.conversation_id,
            "outbound queue closed, closing session"
        );
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Again,
            description: Some("slow consumer".into()),
        }));
        ctx.stop();
    }
}

// Handle WebSocket protocol messages
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();
                self.handle_frame(&text, ctx);
            }
            Ok(ws::Message::Binary(_)) => {
                self.hb = Instant::now();
                let frame = error_frame_json(&AppError::Validation(
                    "binary frames are not supported".into(),
                ));
                let registry = self.state.registry.clone();
                let (conversation_id, subscriber_id) = (self.conversation_id, self.subscriber_id);
                ctx.wait(
                    async move {
                        registry.send_to(conversation_id, subscriber_id, frame).await;
                    }
                    .into_actor(self),
                );
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(e) => {
                tracing::warn!(
                    user_id = %self.user.id,
                    conversation_id = self.conversation_id,
                    error = %e,
                    "websocket protocol error"
                );
                ctx.stop();
            }
        }
    }
}
