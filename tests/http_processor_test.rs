use serde_json::json;
use std::time::Duration;
use tokio::runtime::Runtime;
use trace_streamer::domain::{Message, Payload};
use trace_streamer::reliability::{ConnectionProbe, RetryConfig, RetryStrategy};
use trace_streamer::sender::{
    HttpMessageProcessor, HttpProcessorConfig, MessageProcessor, ProcessError,
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_partial_json, header, method, path},
};

// The processor blocks on its own runtime, so the mock server runs on a
// separate one and the tests themselves stay synchronous.
struct Harness {
    server: MockServer,
    runtime: Runtime,
}

impl Harness {
    fn start() -> Self {
        let runtime = Runtime::new().unwrap();
        let server = runtime.block_on(MockServer::start());
        Self { server, runtime }
    }

    fn mount(&self, mock: Mock) {
        self.runtime.block_on(mock.mount(&self.server));
    }

    fn processor(&self, max_attempts: u32) -> HttpMessageProcessor {
        HttpMessageProcessor::new(HttpProcessorConfig {
            base_url: format!("{}/api", self.server.uri()),
            api_key: Some("secret-key".to_string()),
            workspace: Some("team-a".to_string()),
            timeout: Duration::from_secs(5),
            compression_threshold: None,
            retry: RetryConfig {
                max_attempts,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                strategy: RetryStrategy::FixedDelay,
                jitter: false,
            },
            runtime_threads: 1,
            ..HttpProcessorConfig::default()
        })
        .unwrap()
    }

    fn received(&self) -> usize {
        self.runtime
            .block_on(self.server.received_requests())
            .map_or(0, |requests| requests.len())
    }
}

fn feedback_batch() -> Message {
    let payload: Payload = serde_json::from_value(json!({
        "message_type": "add_trace_feedback_scores_batch",
        "payload": {"batch": [{
            "id": "trace-7",
            "project_name": "http-test",
            "name": "accuracy",
            "value": 1.0,
            "source": "sdk",
        }]}
    }))
    .unwrap();
    Message::new(payload)
}

#[test]
fn test_success_sends_headers_and_body() {
    let harness = Harness::start();
    harness.mount(
        Mock::given(method("PUT"))
            .and(path("/api/v1/private/traces/feedback-scores"))
            .and(header("authorization", "secret-key"))
            .and(header("comet-workspace", "team-a"))
            .and(body_partial_json(json!({"scores": [{"id": "trace-7", "name": "accuracy"}]})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1),
    );

    let processor = harness.processor(3);
    assert!(processor.process(&feedback_batch()).is_ok());
    assert_eq!(harness.received(), 1);
}

#[test]
fn test_conflict_is_reported_as_conflict() {
    let harness = Harness::start();
    harness.mount(Mock::given(method("PUT")).respond_with(ResponseTemplate::new(409)));

    let result = harness.processor(3).process(&feedback_batch());
    assert!(matches!(result, Err(ProcessError::Conflict(_))));
    assert_eq!(harness.received(), 1);
}

#[test]
fn test_rate_limit_carries_retry_after() {
    let harness = Harness::start();
    harness.mount(
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7")),
    );

    match harness.processor(3).process(&feedback_batch()) {
        Err(ProcessError::RateLimited { retry_after }) => {
            assert_eq!(retry_after, Duration::from_secs(7));
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert_eq!(harness.received(), 1);
}

#[test]
fn test_client_error_is_rejected_without_retry() {
    let harness = Harness::start();
    harness.mount(Mock::given(method("PUT")).respond_with(ResponseTemplate::new(400)));

    let result = harness.processor(3).process(&feedback_batch());
    assert!(matches!(result, Err(ProcessError::Rejected(_))));
    assert_eq!(harness.received(), 1);
}

#[test]
fn test_server_error_is_retried_then_connection_error() {
    let harness = Harness::start();
    harness.mount(Mock::given(method("PUT")).respond_with(ResponseTemplate::new(503)));

    match harness.processor(3).process(&feedback_batch()) {
        Err(ProcessError::Connection(reason)) => assert!(reason.contains("3 attempts")),
        other => panic!("expected connection error, got {other:?}"),
    }
    assert_eq!(harness.received(), 3);
}

#[test]
fn test_transient_error_recovers_within_retries() {
    let harness = Harness::start();
    harness.mount(
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1),
    );
    harness.mount(Mock::given(method("PUT")).respond_with(ResponseTemplate::new(200)));

    assert!(harness.processor(3).process(&feedback_batch()).is_ok());
    assert_eq!(harness.received(), 2);
}

#[test]
fn test_unreachable_server_is_a_connection_error() {
    let processor = HttpMessageProcessor::new(HttpProcessorConfig {
        // Port 9 (discard) is closed on test machines.
        base_url: "http://127.0.0.1:9/api/".to_string(),
        connect_timeout: Duration::from_millis(200),
        retry: RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            strategy: RetryStrategy::FixedDelay,
            jitter: false,
        },
        runtime_threads: 1,
        ..HttpProcessorConfig::default()
    })
    .unwrap();

    assert!(matches!(
        processor.process(&feedback_batch()),
        Err(ProcessError::Connection(_))
    ));
    assert!(!processor.health_probe().unwrap().check());
}

#[test]
fn test_health_probe_hits_ping_path() {
    let harness = Harness::start();
    harness.mount(
        Mock::given(method("GET"))
            .and(path("/api/is-alive/ping"))
            .respond_with(ResponseTemplate::new(200)),
    );

    let probe = harness.processor(1).health_probe().unwrap();
    assert!(probe.check());
}
