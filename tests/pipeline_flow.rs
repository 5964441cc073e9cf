//! End-to-end tests of `Pipeline::process` without a network in between.

use std::time::Duration;

use axum::http::{Method, StatusCode};
use base64::Engine;
use request_pipeline::config::RateClassConfig;
use request_pipeline::pipeline::Outcome;
use request_pipeline::resilience::BreakerState;
use request_pipeline::tasks::TaskState;
use request_pipeline::transform::cipher::{self, NonceSequence};
use request_pipeline::transform::compression::{self, DecompressionLimits};
use request_pipeline::transform::{CipherSuite, Encoding, KeyProvider, KeyScope};

mod common;

use common::{build_pipeline, header, manual_clock, request, test_config};

fn salt_header() -> String {
    base64::engine::general_purpose::STANDARD.encode([9u8; 16])
}

#[tokio::test]
async fn client_bucket_refills_after_hint() {
    let mut config = test_config();
    config.rate_limit.default.rate = 1.0;
    config.rate_limit.default.burst = 2;
    let clock = manual_clock();
    let pipeline = build_pipeline(&config, clock.clone());

    for _ in 0..2 {
        let response = pipeline.process(request(Method::GET, "/echo", "clientA")).await;
        assert_eq!(response.outcome, Outcome::Success);
    }

    let limited = pipeline.process(request(Method::GET, "/echo", "clientA")).await;
    assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        limited.outcome,
        Outcome::RateLimited {
            retry_after: Some(Duration::from_secs(1))
        }
    );
    let body = limited.rejection().unwrap();
    assert_eq!(body["error"], "rate_limited");
    assert_eq!(body["retry_after_ms"], 1000);

    // Other clients have their own bucket.
    let other = pipeline.process(request(Method::GET, "/echo", "clientB")).await;
    assert!(other.outcome.is_success());

    clock.advance(Duration::from_secs(1));
    let again = pipeline.process(request(Method::GET, "/echo", "clientA")).await;
    assert!(again.outcome.is_success());
}

#[tokio::test]
async fn route_class_overrides_default_policy() {
    let mut config = test_config();
    config.rate_limit.classes.push(RateClassConfig {
        name: "uploads".to_string(),
        path_prefix: Some("/upload".to_string()),
        method: Some("POST".to_string()),
        rate: 0.5,
        burst: 1,
    });
    let pipeline = build_pipeline(&config, manual_clock());

    let first = pipeline.process(request(Method::POST, "/upload/a", "c1")).await;
    assert!(first.outcome.is_success());

    let second = pipeline.process(request(Method::POST, "/upload/b", "c1")).await;
    assert_eq!(
        second.outcome,
        Outcome::RateLimited {
            retry_after: Some(Duration::from_secs(2))
        }
    );

    // GET on the same prefix falls back to the generous default.
    let read = pipeline.process(request(Method::GET, "/upload/a", "c1")).await;
    assert!(read.outcome.is_success());
}

#[tokio::test]
async fn breaker_opens_then_recovers_through_half_open() {
    let clock = manual_clock();
    let pipeline = build_pipeline(&test_config(), clock.clone());

    for _ in 0..3 {
        let response = pipeline.process(request(Method::GET, "/downstream/fail", "c")).await;
        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        assert_eq!(response.outcome.label(), "handler_error");
    }
    assert_eq!(pipeline.breakers().state("billing"), BreakerState::Open);

    let rejected = pipeline.process(request(Method::GET, "/downstream/ok", "c")).await;
    assert_eq!(rejected.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        rejected.outcome,
        Outcome::CircuitOpen {
            dependency: "billing".to_string(),
            retry_after: Some(Duration::from_secs(5)),
        }
    );
    assert!(rejected.outcome.is_overload());

    clock.advance(Duration::from_secs(5));
    let trial = pipeline.process(request(Method::GET, "/downstream/ok", "c")).await;
    assert!(trial.outcome.is_success());
    assert_eq!(trial.body, b"paid");
    assert_eq!(pipeline.breakers().state("billing"), BreakerState::Closed);
}

#[tokio::test]
async fn sealed_and_compressed_round_trip() {
    let pipeline = build_pipeline(&test_config(), manual_clock());
    let payload = "hello pipeline ".repeat(200).into_bytes();

    for suite in [CipherSuite::Aes256Gcm, CipherSuite::ChaCha20Poly1305] {
        let request_key = common::master_key()
            .session_key(suite, &[9u8; 16], KeyScope::Request)
            .unwrap();
        let mut nonces = NonceSequence::new();
        let compressed = compression::compress(Encoding::Gzip, &payload, 6).unwrap();
        let sealed = cipher::seal(suite, &request_key, &mut nonces, &compressed).unwrap();

        let (ce_name, ce_value) = header("content-encoding", "gzip");
        let (ae_name, ae_value) = header("accept-encoding", "gzip");
        let (suite_name, suite_value) = header("x-cipher-suite", suite.as_str());
        let (salt_name, salt_value) = header("x-session-salt", &salt_header());
        let req = request(Method::POST, "/echo", "crypto")
            .with_header(ce_name, ce_value)
            .with_header(ae_name, ae_value)
            .with_header(suite_name, suite_value)
            .with_header(salt_name, salt_value)
            .with_body(sealed);

        let response = pipeline.process(req).await;
        assert_eq!(response.outcome, Outcome::Success, "{suite}");
        assert_eq!(response.encoding, Encoding::Gzip);
        assert_eq!(response.cipher, Some(suite));

        // The reply is sealed under a key bound to this request's id.
        assert!(cipher::open(suite, &request_key, &response.body).is_err());
        let response_key = common::master_key()
            .session_key(suite, &[9u8; 16], KeyScope::Response(response.request_id))
            .unwrap();
        let opened = cipher::open(suite, &response_key, &response.body).unwrap();
        let limits = DecompressionLimits {
            max_output: 1 << 20,
            max_ratio: 0,
        };
        let plain = compression::decompress(Encoding::Gzip, &opened, &limits).unwrap();
        assert_eq!(plain, payload);
    }
}

#[tokio::test]
async fn tampered_ciphertext_is_rejected_before_the_handler() {
    let pipeline = build_pipeline(&test_config(), manual_clock());
    let suite = CipherSuite::Aes256Gcm;
    let key = common::master_key()
        .session_key(suite, &[9u8; 16], KeyScope::Request)
        .unwrap();
    let mut sealed =
        cipher::seal(suite, &key, &mut NonceSequence::new(), b"{\"amount\":10}").unwrap();
    let last = sealed.len() - 1;
    sealed[last] ^= 0x01;

    let (suite_name, suite_value) = header("x-cipher-suite", suite.as_str());
    let (salt_name, salt_value) = header("x-session-salt", &salt_header());
    let req = request(Method::POST, "/echo", "c")
        .with_header(suite_name, suite_value)
        .with_header(salt_name, salt_value)
        .with_body(sealed);

    let response = pipeline.process(req).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.outcome, Outcome::TransformError { kind: "auth_failure" });
    assert_eq!(response.cipher, None);
    let body = response.rejection().unwrap();
    assert_eq!(body["kind"], "auth_failure");
}

#[tokio::test]
async fn decompression_bomb_is_refused() {
    let pipeline = build_pipeline(&test_config(), manual_clock());
    let bomb = compression::compress(Encoding::Gzip, &vec![0u8; 1 << 20], 9).unwrap();

    let (name, value) = header("content-encoding", "gzip");
    let req = request(Method::POST, "/echo", "c")
        .with_header(name, value)
        .with_body(bomb);

    let response = pipeline.process(req).await;
    assert_eq!(response.status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(
        response.outcome,
        Outcome::TransformError {
            kind: "decompression_limit_exceeded"
        }
    );
}

#[tokio::test]
async fn unknown_coding_and_suite_are_unsupported() {
    let pipeline = build_pipeline(&test_config(), manual_clock());

    let (name, value) = header("content-encoding", "br");
    let response = pipeline
        .process(request(Method::POST, "/echo", "c").with_header(name, value).with_body("x"))
        .await;
    assert_eq!(response.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let (name, value) = header("x-cipher-suite", "rot13");
    let response = pipeline
        .process(request(Method::POST, "/echo", "c").with_header(name, value))
        .await;
    assert_eq!(
        response.outcome,
        Outcome::TransformError {
            kind: "unsupported_algorithm"
        }
    );
}

#[tokio::test]
async fn small_responses_stay_uncompressed() {
    let pipeline = build_pipeline(&test_config(), manual_clock());
    let (name, value) = header("accept-encoding", "gzip, zstd");
    let response = pipeline
        .process(request(Method::POST, "/echo", "c").with_header(name, value).with_body("tiny"))
        .await;
    assert!(response.outcome.is_success());
    assert_eq!(response.encoding, Encoding::Identity);
    assert_eq!(response.body, b"tiny");
}

#[tokio::test]
async fn full_task_queue_rejects_with_overload() {
    let mut config = test_config();
    config.tasks.queue_bound = 1;
    // Loops are not started, so the first job stays queued.
    let pipeline = build_pipeline(&config, manual_clock());

    let accepted = pipeline.process(request(Method::POST, "/jobs", "c")).await;
    assert_eq!(accepted.status, StatusCode::ACCEPTED);
    assert_eq!(accepted.tasks.len(), 1);
    let task_id = accepted.tasks[0];
    assert_eq!(pipeline.tasks().state(task_id), Some(TaskState::Pending));
    assert_eq!(pipeline.tasks().status(task_id).unwrap().correlation_id, Some(accepted.request_id));

    let rejected = pipeline.process(request(Method::POST, "/jobs", "c")).await;
    assert_eq!(rejected.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(rejected.outcome, Outcome::TaskRejectedOverload);
    assert!(rejected.outcome.is_overload());
    assert!(rejected.tasks.is_empty());
    assert_eq!(pipeline.tasks().tracked(), 1);
}

#[tokio::test]
async fn request_ids_are_unique_and_increasing() {
    let pipeline = build_pipeline(&test_config(), manual_clock());
    let mut last = 0u64;
    for _ in 0..100 {
        let response = pipeline.process(request(Method::GET, "/echo", "ids")).await;
        let id = response.request_id.as_u64();
        assert!(id > last);
        last = id;
    }
}
