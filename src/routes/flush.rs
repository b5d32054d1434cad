use crate::middleware::SIGNATURE_HEADER;
use crate::services::{FlushOutcome, FlushRequest};
use crate::state::AppState;
use actix_web::{post, web, HttpRequest, HttpResponse};
use serde_json::json;

/// Callback target for the delayed-delivery service.
///
/// Any failure after the request is authenticated answers 503 so the caller retries.
#[post("/v1/chat/flush")]
pub async fn flush_handler(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    let Some(signature) = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        return HttpResponse::Unauthorized().json(json!({
            "success": false,
            "error": "missing signature",
        }));
    };

    if !state.signature.verify(signature, &body) {
        tracing::warn!("flush callback with invalid signature");
        return HttpResponse::BadRequest().json(json!({
            "success": false,
            "error": "invalid signature",
        }));
    }

    let request: FlushRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return HttpResponse::BadRequest().json(json!({
                "success": false,
                "error": format!("invalid body: {e}"),
            }))
        }
    };
    if request.chat_id.is_empty() {
        return HttpResponse::BadRequest().json(json!({
            "success": false,
            "error": "chatId is required",
        }));
    }

    match state
        .services
        .flush(&request.chat_id, &request.flush_token)
        .await
    {
        Ok(FlushOutcome::Flushed { appended, .. }) => {
            HttpResponse::Ok().json(json!({ "success": true, "appended": appended }))
        }
        Ok(FlushOutcome::Stale) => {
            HttpResponse::Ok().json(json!({ "success": true, "stale": true }))
        }
        Err(e) => {
            tracing::error!(chat_id = %request.chat_id, error = %e, "flush failed");
            HttpResponse::ServiceUnavailable().json(json!({
                "success": false,
                "error": e.client_message(),
            }))
        }
    }
}
