use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
};
use pretty_assertions::assert_eq;
use retrace_lib::{
    http::{router, ErrorBody, DEFAULT_TIMEOUT, REQUEST_ID_HEADER},
    DiffPayload, ErrorKind,
};
use tower::ServiceExt;

use crate::fake::{alpine_3_18, alpine_3_19, context, FakeEngine};

async fn get(engine: &Arc<FakeEngine>, timeout: Duration, uri: &str) -> Response {
    router(Arc::new(context(engine)), timeout)
        .oneshot(
            Request::builder()
                .uri(uri)
                .body(Body::empty())
                .expect("build request"),
        )
        .await
        .expect("infallible")
}

async fn body(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body")
        .to_vec()
}

async fn error(response: Response) -> ErrorBody {
    serde_json::from_slice(&body(response).await).expect("parse error body")
}

fn engine() -> Arc<FakeEngine> {
    Arc::new(
        FakeEngine::default()
            .local("alpine:3.18", alpine_3_18())
            .remote("alpine:3.19", alpine_3_19()),
    )
}

#[test_log::test(tokio::test)]
async fn diff_ok() {
    let engine = engine();
    let response = get(&engine, DEFAULT_TIMEOUT, "/diff?image1=alpine:3.18&image2=alpine:3.19").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(REQUEST_ID_HEADER));

    let payload = DiffPayload::parse(&String::from_utf8(body(response).await).expect("utf-8"))
        .expect("parse payload");
    assert_eq!(payload.image1.name, "alpine:3.18");
    assert_eq!(payload.image2.name, "alpine:3.19");
    assert!(payload.image1.dockerfile.ends_with("CMD [\"/bin/sh\"]\n"));
}

#[test_log::test(tokio::test)]
async fn invalid_reference_is_bad_request() {
    let engine = engine();
    let response = get(&engine, DEFAULT_TIMEOUT, "/diff?image1=alpine:3.18&image2=Not%20Valid").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error(response).await.error.kind, ErrorKind::InvalidReference);
    assert_eq!(engine.calls(), 0);
}

#[test_log::test(tokio::test)]
async fn missing_parameter_is_bad_request() {
    let engine = engine();
    let response = get(&engine, DEFAULT_TIMEOUT, "/diff?image1=alpine:3.18").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = error(response).await;
    assert_eq!(body.error.kind, ErrorKind::InvalidReference);
    assert!(body.error.message.contains("image2"), "{}", body.error.message);
    assert_eq!(engine.calls(), 0);
}

#[test_log::test(tokio::test)]
async fn duplicate_parameter_is_bad_request() {
    let engine = engine();
    let response = get(
        &engine,
        DEFAULT_TIMEOUT,
        "/diff?image1=alpine:3.18&image1=alpine:3.19&image2=alpine:3.19",
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = error(response).await;
    assert_eq!(body.error.kind, ErrorKind::InvalidReference);
    assert!(body.error.message.contains("image1"), "{}", body.error.message);
    assert_eq!(engine.calls(), 0);
}

#[test_log::test(tokio::test)]
async fn unknown_image_is_not_found() {
    let engine = engine();
    let response = get(
        &engine,
        DEFAULT_TIMEOUT,
        "/diff?image1=alpine:3.18&image2=ghcr.io/nobody/nothing:1.0",
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error(response).await.error.kind, ErrorKind::NotFound);
}

#[test_log::test(tokio::test)]
async fn image_without_history_is_unprocessable() {
    let engine = Arc::new(
        FakeEngine::default()
            .local("alpine:3.18", alpine_3_18())
            .local("ghcr.io/org/scratch:1", Vec::new()),
    );
    let response = get(
        &engine,
        DEFAULT_TIMEOUT,
        "/diff?image1=alpine:3.18&image2=ghcr.io/org/scratch:1",
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error(response).await.error.kind, ErrorKind::HistoryUnavailable);
}

#[test_log::test(tokio::test)]
async fn slow_request_times_out() {
    let engine = Arc::new(
        FakeEngine::default()
            .remote("alpine:3.18", alpine_3_18())
            .remote("alpine:3.19", alpine_3_19())
            .pull_delay(Duration::from_millis(500)),
    );
    let response = get(
        &engine,
        Duration::from_millis(20),
        "/diff?image1=alpine:3.18&image2=alpine:3.19",
    )
    .await;

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(error(response).await.error.kind, ErrorKind::Internal);
}

#[test_log::test(tokio::test)]
async fn unknown_route() {
    let engine = engine();
    let response = get(&engine, DEFAULT_TIMEOUT, "/compare").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
