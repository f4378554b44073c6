use crate::error::AppError;
use crate::middleware::guards::User;
use crate::services::ConversationOrchestrator;
use crate::state::AppState;
use crate::websocket::catch_up::CatchUpBuffers;
use crate::websocket::events::ChatEvent;
use crate::websocket::message_types::WsInboundEvent;
use crate::websocket::{Frame, SubscriberId};
use actix::{
    Actor, ActorContext, AsyncContext, Handler, Message as ActixMessage, StreamHandler,
};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);
const CATCH_UP_BATCH: usize = 500;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub user_id: Option<Uuid>,
}

// Message type for sending text to WebSocket
#[derive(ActixMessage)]
#[rtype(result = "()")]
struct TextMessage(String);

/// Sent after the last replayed batch of a catch-up.
#[derive(ActixMessage)]
#[rtype(result = "()")]
struct CatchUpDone {
    conversation_id: Uuid,
    last_sequence: i64,
    /// Highest sequence replayed; buffered live appends at or below it are dropped.
    replayed_upto: i64,
}

#[derive(ActixMessage)]
#[rtype(result = "()")]
struct CatchUpFailed {
    conversation_id: Uuid,
    error: AppError,
}

// WebSocket Actor
struct WsSession {
    user_id: Uuid,
    subscriber_id: SubscriberId,
    orchestrator: ConversationOrchestrator,
    frames: Option<UnboundedReceiver<Frame>>,
    /// Live frames held back per conversation while its catch-up replay is running
    catching_up: CatchUpBuffers,
    hb: Instant,
}

fn error_payload(conversation_id: Option<Uuid>, error: &AppError) -> String {
    ChatEvent::Error {
        conversation_id,
        code: error.code().to_string(),
        message: error.to_string(),
    }
    .to_payload()
}

impl WsSession {
    fn new(
        user_id: Uuid,
        subscriber_id: SubscriberId,
        orchestrator: ConversationOrchestrator,
        frames: UnboundedReceiver<Frame>,
    ) -> Self {
        Self {
            user_id,
            subscriber_id,
            orchestrator,
            frames: Some(frames),
            catching_up: CatchUpBuffers::new(),
            hb: Instant::now(),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                tracing::warn!(user_id = %act.user_id, "WebSocket heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn start_catch_up(&mut self, conversation_id: Uuid, last_known_sequence: i64, ctx: &mut ws::WebsocketContext<Self>) {
        if !self.catching_up.begin(conversation_id) {
            tracing::debug!(%conversation_id, "Catch-up already running");
            return;
        }

        let orchestrator = self.orchestrator.clone();
        let user_id = self.user_id;
        let addr = ctx.address();

        actix::spawn(async move {
            let mut after = last_known_sequence.max(0);
            loop {
                let window = match orchestrator
                    .messages_after(conversation_id, user_id, after, Some(CATCH_UP_BATCH))
                    .await
                {
                    Ok(window) => window,
                    Err(error) => {
                        addr.do_send(CatchUpFailed {
                            conversation_id,
                            error,
                        });
                        return;
                    }
                };

                for message in window.messages {
                    after = message.sequence;
                    addr.do_send(TextMessage(
                        ChatEvent::MessageAppended {
                            conversation_id,
                            message,
                        }
                        .to_payload(),
                    ));
                }

                if !window.has_more {
                    addr.do_send(CatchUpDone {
                        conversation_id,
                        last_sequence: window.last_sequence,
                        replayed_upto: after,
                    });
                    return;
                }
            }
        });
    }

    fn handle_inbound(&mut self, event: WsInboundEvent, ctx: &mut ws::WebsocketContext<Self>) {
        match event {
            WsInboundEvent::CatchUp {
                conversation_id,
                last_known_sequence,
            } => self.start_catch_up(conversation_id, last_known_sequence, ctx),

            WsInboundEvent::MarkRead {
                conversation_id,
                upto_sequence,
            } => {
                let orchestrator = self.orchestrator.clone();
                let user_id = self.user_id;
                let addr = ctx.address();
                actix::spawn(async move {
                    if let Err(e) = orchestrator
                        .mark_read(conversation_id, user_id, upto_sequence)
                        .await
                    {
                        addr.do_send(TextMessage(error_payload(Some(conversation_id), &e)));
                    }
                });
            }

            WsInboundEvent::Typing { conversation_id } => {
                let orchestrator = self.orchestrator.clone();
                let user_id = self.user_id;
                let addr = ctx.address();
                actix::spawn(async move {
                    if let Err(e) = orchestrator.typing(conversation_id, user_id).await {
                        addr.do_send(TextMessage(error_payload(Some(conversation_id), &e)));
                    }
                });
            }
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(user_id = %self.user_id, "WebSocket session started");

        // Start heartbeat
        self.hb(ctx);

        if let Some(frames) = self.frames.take() {
            ctx.add_stream(UnboundedReceiverStream::new(frames));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(user_id = %self.user_id, "WebSocket session stopped");

        // Cleanup: detach from the registry
        let orchestrator = self.orchestrator.clone();
        let user_id = self.user_id;
        let subscriber_id = self.subscriber_id;
        actix::spawn(async move {
            orchestrator.disconnect_session(user_id, subscriber_id).await;
        });
    }
}

// Live frames from the registry
impl StreamHandler<Frame> for WsSession {
    fn handle(&mut self, frame: Frame, ctx: &mut Self::Context) {
        if let Some(frame) = self.catching_up.hold(frame) {
            ctx.text(frame.payload);
        }
    }
}

// Handle text messages
impl Handler<TextMessage> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: TextMessage, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<CatchUpDone> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: CatchUpDone, ctx: &mut Self::Context) {
        ctx.text(
            ChatEvent::CatchUpComplete {
                conversation_id: msg.conversation_id,
                last_sequence: msg.last_sequence,
            }
            .to_payload(),
        );

        for frame in self
            .catching_up
            .finish(msg.conversation_id, msg.replayed_upto)
        {
            ctx.text(frame.payload);
        }
    }
}

impl Handler<CatchUpFailed> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: CatchUpFailed, ctx: &mut Self::Context) {
        tracing::warn!(
            conversation_id = %msg.conversation_id,
            user_id = %self.user_id,
            error = %msg.error,
            "Catch-up failed"
        );
        ctx.text(error_payload(Some(msg.conversation_id), &msg.error));
        // live frames were held back for nothing; release them
        for frame in self.catching_up.abort(msg.conversation_id) {
            ctx.text(frame.payload);
        }
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
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<WsInboundEvent>(&text) {
                Ok(event) => self.handle_inbound(event, ctx),
                Err(e) => {
                    tracing::warn!(user_id = %self.user_id, error = %e, "Failed to parse WS message");
                    ctx.text(error_payload(None, &AppError::invalid(format!("unrecognized frame: {e}"))));
                }
            },
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!("Binary WebSocket messages not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::info!(user_id = %self.user_id, ?reason, "WebSocket close message received");
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                tracing::warn!(user_id = %self.user_id, error = %e, "WebSocket protocol error");
                ctx.stop();
            }
            _ => {}
        }
    }
}

/// Gateway header first; the query parameter only when explicitly allowed for development.
fn resolve_identity(req: &HttpRequest, allow_query: bool) -> Option<Uuid> {
    if let Some(user) = User::from_header(req) {
        return Some(user.id);
    }
    if !allow_query {
        return None;
    }
    web::Query::<WsParams>::from_query(req.query_string())
        .ok()
        .and_then(|params| params.into_inner().user_id)
}

// HTTP handler
#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let Some(user_id) = resolve_identity(&req, state.config.ws_dev_allow_query_identity) else {
        tracing::warn!("WebSocket connection rejected: no caller identity");
        return Err(AppError::Unauthorized.into());
    };

    let (subscriber_id, frames) = state.orchestrator.connect_session(user_id).await?;
    let session = WsSession::new(user_id, subscriber_id, state.orchestrator.clone(), frames);

    match ws::start(session, &req, stream) {
        Ok(resp) => Ok(resp),
        Err(e) => {
            state
                .orchestrator
                .disconnect_session(user_id, subscriber_id)
                .await;
            Err(e)
        }
    }
}
