//! HTTP endpoint handlers.
//!
//! `POST /convert` turns an upload into a job and waits for it through the
//! publisher's request/reply mode. Callers always get a finished result, a
//! generic retry message, or a 202 "processing" answer.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::DispatchError;
use crate::queue::{ConversionMessage, LambdaResponse, Publisher, RETRY_LATER_MESSAGE};
use crate::web::params::{validate, ConvertQuery};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub publisher: Publisher,
    /// Cancelled on server shutdown; every in-flight wait derives from it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(publisher: Publisher, shutdown: CancellationToken) -> Self {
        Self {
            publisher,
            shutdown,
        }
    }
}

// =============================================================================
// Health Check
// =============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Conversion
// =============================================================================

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

fn message(status: StatusCode, text: impl Into<String>) -> Response {
    (status, Json(MessageResponse { message: text.into() })).into_response()
}

/// Conversion endpoint.
///
/// The wait runs in its own task: if the client goes away the handler
/// future is dropped, the drop guard cancels the wait, and the task still
/// removes its reply queue.
pub async fn convert(
    State(state): State<AppState>,
    Query(query): Query<ConvertQuery>,
    body: Bytes,
) -> Response {
    let request = match validate(&query) {
        Ok(request) => request,
        Err(reason) => {
            warn!(user_id = %query.user_id, reason = %reason, "convert_request_invalid");
            return message(StatusCode::BAD_REQUEST, reason);
        }
    };

    if body.is_empty() {
        return message(StatusCode::BAD_REQUEST, "File is required. Please try again.");
    }

    let job = ConversionMessage::new(
        request.user_id,
        request.email,
        request.file_name,
        body.to_vec(),
        request.duration,
        request.params,
    );

    info!(
        file_id = %job.file_id,
        user_id = %job.user_id,
        file_name = %job.file_name,
        file_size = job.file_size,
        "convert_request_received"
    );

    let cancel = state.shutdown.child_token();
    let _cancel_on_drop = cancel.clone().drop_guard();
    let publisher = state.publisher.clone();
    let file_id = job.file_id.clone();

    let outcome = tokio::spawn(async move { publisher.publish(&job, &cancel).await }).await;

    match outcome {
        Ok(Ok(response)) => {
            info!(
                file_id = %file_id,
                status_code = response.status_code,
                "convert_request_complete"
            );
            result_response(response)
        }
        Ok(Err(e)) => {
            error!(file_id = %file_id, error = %e, "convert_publish_failed");
            dispatch_error_response(&e)
        }
        Err(e) => {
            error!(file_id = %file_id, error = %e, "convert_task_failed");
            message(StatusCode::INTERNAL_SERVER_ERROR, RETRY_LATER_MESSAGE)
        }
    }
}

fn result_response(response: LambdaResponse) -> Response {
    let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response)).into_response()
}

fn dispatch_error_response(e: &DispatchError) -> Response {
    let status = if e.is_connectivity()
        || matches!(e, DispatchError::Closed | DispatchError::Cancelled)
    {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    message(status, RETRY_LATER_MESSAGE)
}
