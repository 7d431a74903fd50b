//! The HTTP surface the extension UI talks to.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{rejection::QueryRejection, Query, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    orchestrate::{Context, Failure},
    DiffError, ErrorKind,
};

/// How long a diff request may run before it is abandoned, unless configured otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Response header carrying the id the request was logged under.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
struct AppState {
    context: Arc<Context>,
    timeout: Duration,
}

/// Build the router serving `GET /diff?image1=<ref>&image2=<ref>`.
pub fn router(context: Arc<Context>, timeout: Duration) -> Router {
    Router::new()
        .route("/diff", get(diff))
        .layer(axum::middleware::from_fn(trace_request))
        .with_state(AppState { context, timeout })
}

#[derive(Debug, Deserialize)]
struct DiffParams {
    image1: Option<String>,
    image2: Option<String>,
}

async fn diff(
    State(state): State<AppState>,
    query: Result<Query<DiffParams>, QueryRejection>,
) -> Response {
    let params = match query {
        Ok(Query(params)) => params,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let (image1, image2) = match (params.image1, params.image2) {
        (Some(image1), Some(image2)) => (image1, image2),
        (image1, _) => {
            let missing = if image1.is_none() { "image1" } else { "image2" };
            return bad_request(format!("missing query parameter {missing}"));
        }
    };

    match tokio::time::timeout(state.timeout, state.context.diff(&image1, &image2)).await {
        Ok(Ok(payload)) => Json(payload).into_response(),
        Ok(Err(failure)) => failure.into_response(),
        Err(_) => {
            warn!(timeout = ?state.timeout, "diff timed out");
            let message = format!("diff did not complete within {:?}", state.timeout);
            error_response(StatusCode::GATEWAY_TIMEOUT, ErrorKind::Internal, message)
        }
    }
}

/// The status code each kind of failure is reported with.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidReference => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::HistoryUnavailable => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::PullFailed => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

fn error_response(status: StatusCode, kind: ErrorKind, message: String) -> Response {
    let body = ErrorBody {
        error: ErrorDetail { kind, message },
    };
    (status, Json(body)).into_response()
}

/// Malformed requests are reported the same way as malformed references.
fn bad_request(message: String) -> Response {
    let error = DiffError::InvalidReference {
        input: String::new(),
        message,
    };
    error_response(StatusCode::BAD_REQUEST, error.kind(), error.to_string())
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        let kind = self.error.kind();
        error_response(status_for(kind), kind, self.to_string())
    }
}

async fn trace_request(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let span = info_span!(
        "http_request",
        request_id = %request_id,
        method = %req.method(),
        uri = %req.uri(),
    );

    async move {
        info!("request started");
        let mut response = next.run(req).await;
        info!(status = %response.status(), "request finished");
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }
    .instrument(span)
    .await
}
