use std::sync::Arc;

use retrace_lib::{EngineError, ErrorKind, Slot, Stage};
use simple_test_case::test_case;

use crate::fake::{alpine_3_18, alpine_3_19, buildkit_app, context, FakeEngine};

#[test_log::test(tokio::test)]
async fn diff_two_versions() {
    let engine = Arc::new(
        FakeEngine::default()
            .local("alpine:3.18", alpine_3_18())
            .remote("alpine:3.19", alpine_3_19()),
    );

    let payload = context(&engine)
        .diff("alpine:3.18", "alpine:3.19")
        .await
        .expect("diff images");

    pretty_assertions::assert_eq!(payload.image1.name, "alpine:3.18");
    pretty_assertions::assert_eq!(payload.image2.name, "alpine:3.19");
    assert_ne!(payload.image1.dockerfile, payload.image2.dockerfile);
    assert!(payload.image1.approximate && payload.image2.approximate);
    pretty_assertions::assert_eq!(engine.pulls(), 1, "only the missing image is pulled");
}

#[test_log::test(tokio::test)]
async fn diff_an_image_with_itself() {
    let engine = Arc::new(FakeEngine::default().remote("myapp:latest", buildkit_app()));

    let payload = context(&engine)
        .diff("myapp", "docker.io/library/myapp:latest")
        .await
        .expect("diff images");

    pretty_assertions::assert_eq!(payload.image1.dockerfile, payload.image2.dockerfile);
    pretty_assertions::assert_eq!(payload.image1.name, "myapp", "names are echoed as given");
    pretty_assertions::assert_eq!(payload.image2.name, "docker.io/library/myapp:latest");
    pretty_assertions::assert_eq!(engine.pulls(), 1, "both pipelines share one pull");
}

#[test_case("not a reference"; "whitespace")]
#[test_case("alpine@sha256:abcd"; "short digest")]
#[test_case("alpine@md5:00"; "unsupported digest algorithm")]
#[test_case("alpine@SHA256:ABCD"; "uppercase digest")]
#[test_log::test(tokio::test)]
async fn invalid_reference_touches_no_engine(image2: &str) {
    let engine = Arc::new(FakeEngine::default().remote("alpine:3.19", alpine_3_19()));

    let failure = context(&engine)
        .diff("alpine:3.19", image2)
        .await
        .expect_err("invalid reference");

    pretty_assertions::assert_eq!(failure.error.kind(), ErrorKind::InvalidReference);
    pretty_assertions::assert_eq!(failure.stage, Stage::Received);
    pretty_assertions::assert_eq!(failure.slot, Slot::Image2);
    pretty_assertions::assert_eq!(engine.calls(), 0);
}

#[test_log::test(tokio::test)]
async fn first_invalid_reference_is_reported() {
    let engine = Arc::new(FakeEngine::default());

    let failure = context(&engine)
        .diff("", "UPPER")
        .await
        .expect_err("invalid references");

    pretty_assertions::assert_eq!(failure.slot, Slot::Image1);
    pretty_assertions::assert_eq!(engine.calls(), 0);
}

#[test_log::test(tokio::test)]
async fn missing_image_fails_the_request() {
    let engine = Arc::new(FakeEngine::default().local("alpine:3.19", alpine_3_19()));

    let failure = context(&engine)
        .diff("alpine:3.19", "ghcr.io/nobody/nothing:1.0")
        .await
        .expect_err("image does not exist");

    pretty_assertions::assert_eq!(failure.error.kind(), ErrorKind::NotFound);
    pretty_assertions::assert_eq!(failure.stage, Stage::Resolving);
    pretty_assertions::assert_eq!(failure.slot, Slot::Image2);
}

#[test_log::test(tokio::test)]
async fn pull_failure_fails_the_request() {
    let engine = Arc::new(
        FakeEngine::default()
            .remote("alpine:3.19", alpine_3_19())
            .failing_pulls([EngineError::Rejected(String::from("unauthorized"))]),
    );

    let failure = context(&engine)
        .diff("alpine:3.19", "alpine:3.19")
        .await
        .expect_err("pull rejected");

    pretty_assertions::assert_eq!(failure.error.kind(), ErrorKind::PullFailed);
    pretty_assertions::assert_eq!(failure.stage, Stage::Resolving);
}

#[test_log::test(tokio::test)]
async fn history_failure_fails_the_request() {
    let engine = Arc::new(
        FakeEngine::default()
            .local("alpine:3.19", alpine_3_19())
            .local("ghcr.io/org/scratch:1", Vec::new()),
    );

    let failure = context(&engine)
        .diff("alpine:3.19", "ghcr.io/org/scratch:1")
        .await
        .expect_err("no history");

    pretty_assertions::assert_eq!(failure.error.kind(), ErrorKind::HistoryUnavailable);
    pretty_assertions::assert_eq!(failure.stage, Stage::Extracting);
    pretty_assertions::assert_eq!(failure.slot, Slot::Image2);
}
