use crate::error::AppError;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    pub message: String,
}

/// Map a domain error onto an HTTP response with a JSON body.
pub fn into_response(err: &AppError) -> HttpResponse {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }

    HttpResponse::build(status).json(ErrorResponse {
        error: status
            .canonical_reason()
            .unwrap_or("Internal Server Error")
            .to_string(),
        code: err.error_code(),
        message: err.client_message(),
    })
}
