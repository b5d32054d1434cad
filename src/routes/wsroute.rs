use crate::error::AppError;
use crate::middleware::auth::extract_token;
use crate::services::ChatServices;
use crate::state::AppState;
use crate::websocket::{run_outbound, Connection, FrameSink, OutboundFrame};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_ws::{CloseCode, CloseReason, Message};
use std::time::{Duration, Instant};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

#[get("/v1/chat/ws/{chat_id}")]
pub async fn ws_handler(
    state: web::Data<AppState>,
    path: web::Path<String>,
    req: HttpRequest,
    body: web::Payload,
) -> Result<HttpResponse, Error> {
    let chat_id = path.into_inner();

    let token = extract_token(&req)
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".into()))?;
    let claims = state.tokens.verify(&token)?;

    let (response, session, stream) = actix_ws::handle(&req, body)?;
    tracing::info!(chat_id = %chat_id, user_id = %claims.uid, "websocket upgraded");

    actix_web::rt::spawn(run_connection(
        state.services.clone(),
        chat_id,
        claims.uid,
        session,
        stream,
    ));

    Ok(response)
}

async fn run_connection(
    services: ChatServices,
    chat_id: String,
    user_id: String,
    mut ws: actix_ws::Session,
    mut stream: actix_ws::MessageStream,
) {
    let mut conn = Connection::new(&chat_id);

    if let Err(frame) = conn.authenticate(services, &user_id).await {
        let _ = ws.send_frame(&frame).await;
        let _ = ws
            .close(Some(CloseReason {
                code: CloseCode::Policy,
                description: frame.error.clone(),
            }))
            .await;
        return;
    }

    let subscription = match conn.activate() {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::error!(chat_id = %chat_id, user_id = %user_id, error = %e, "failed to activate connection");
            let _ = ws.close(Some(CloseCode::Error.into())).await;
            return;
        }
    };
    let outbound = actix_web::rt::spawn(run_outbound(subscription, user_id.clone(), ws.clone()));

    let mut last_heartbeat = Instant::now();
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);

    let reason: Option<CloseReason> = loop {
        tokio::select! {
            _ = interval.tick() => {
                if last_heartbeat.elapsed() > CLIENT_TIMEOUT {
                    tracing::info!(chat_id = %chat_id, user_id = %user_id, "client heartbeat timed out");
                    break Some(CloseCode::Away.into());
                }
                if ws.ping(b"").await.is_err() {
                    break None;
                }
            }
            msg = stream.recv() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        tracing::warn!(chat_id = %chat_id, user_id = %user_id, error = %e, "websocket protocol error");
                        break Some(CloseCode::Protocol.into());
                    }
                    None => break None,
                };
                last_heartbeat = Instant::now();

                match msg {
                    Message::Text(text) => {
                        if let Some(reply) = conn.handle_text(&text).await {
                            if ws.send_frame(&reply).await.is_err() {
                                break None;
                            }
                        }
                    }
                    Message::Binary(_) => {
                        let reply = OutboundFrame::error(&AppError::Validation(
                            "binary frames are not supported".into(),
                        ));
                        if ws.send_frame(&reply).await.is_err() {
                            break None;
                        }
                    }
                    Message::Ping(bytes) => {
                        if ws.pong(&bytes).await.is_err() {
                            break None;
                        }
                    }
                    Message::Close(reason) => break reason,
                    Message::Pong(_) | Message::Continuation(_) | Message::Nop => {}
                }
            }
        }
    };

    conn.close();
    if let Err(e) = outbound.await {
        tracing::warn!(chat_id = %chat_id, user_id = %user_id, error = %e, "outbound task failed");
    }
    let _ = ws.close(reason).await;
    tracing::info!(chat_id = %chat_id, user_id = %user_id, "websocket closed");
}
