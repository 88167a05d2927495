//! Integration tests for common keel workflows.
//!
//! Each test builds a deployment the way an application would and drives it
//! through the in-process test client.

use bytes::Bytes;
use keel::scheduler::BoundedConfig;
use keel::serializer::FormSerializer;
use keel::*;
use keel_testing::*;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

// =============================================================================
// Mapping combination
// =============================================================================

#[tokio::test]
async fn test_child_consumes_replaces_parent() {
    let client = TestClient::from_deployment(
        Deployment::new().controller(
            Controller::new(Mapping::get("/a").consumes("text/plain")).handler(HandlerMethod::new(
                "b",
                Mapping::new().path("/b").consumes("application/json"),
                |_args: Args| async { Ok::<_, Error>("ok") },
            )),
        ),
    )
    .unwrap();

    let json_body = client
        .send(
            TestRequestBuilder::get("/a/b")
                .content_type("application/json")
                .body("{}"),
        )
        .await;
    assert_status(&json_body, 200);
    assert_eq!(json_body.body_string(), "ok");

    let text_body = client
        .send(
            TestRequestBuilder::get("/a/b")
                .content_type("text/plain")
                .body("hi"),
        )
        .await;
    assert_status(&text_body, 415);
}

// =============================================================================
// Content negotiation
// =============================================================================

/// Writes JSON prefixed with a tag so the test can tell codecs apart.
struct Tagged {
    tag: &'static str,
    priority: i32,
    media_types: Vec<MediaType>,
}

impl HttpBodySerializer for Tagged {
    fn name(&self) -> &'static str {
        self.tag
    }

    fn media_types(&self) -> &[MediaType] {
        &self.media_types
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn serialize(&self, value: &Value) -> Result<Bytes> {
        Ok(Bytes::from(format!("{}:{}", self.tag, value)))
    }

    fn deserialize(&self, body: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(body)?)
    }
}

fn tagged_client() -> TestClient {
    let mut serializers = Serializers::new();
    serializers.register(Arc::new(Tagged {
        tag: "s2",
        priority: 20,
        media_types: vec![MediaType::any()],
    }));
    serializers.register(Arc::new(Tagged {
        tag: "s1",
        priority: 10,
        media_types: vec![MediaType::json()],
    }));

    TestClient::from_deployment(Deployment::new().serializers(serializers).route(
        HandlerMethod::new(
            "entity",
            Mapping::get("/entity").produces("application/json"),
            |_args: Args| async { Ok::<_, Error>(json!({"v": 1})) },
        ),
    ))
    .unwrap()
}

#[tokio::test]
async fn test_negotiation_prefers_higher_priority_serializer() {
    let client = tagged_client();

    for _ in 0..3 {
        let response = client
            .send(TestRequestBuilder::get("/entity").accept("application/json"))
            .await;
        assert_status(&response, 200);
        assert_eq!(response.body_string(), r#"s1:{"v":1}"#);
        assert_json_content_type(&response);
    }
}

#[tokio::test]
async fn test_negotiation_not_acceptable() {
    let client = tagged_client();

    let response = client
        .send(TestRequestBuilder::get("/entity").accept("text/plain"))
        .await;
    assert_http_status(&response, HttpStatus::NotAcceptable);
}

fn default_codec_client() -> TestClient {
    TestClient::from_deployment(Deployment::new().route(HandlerMethod::new(
        "entity",
        Mapping::get("/entity"),
        |_args: Args| async { Ok::<_, Error>(json!({"v": 1})) },
    )))
    .unwrap()
}

#[tokio::test]
async fn test_mixed_accept_falls_through_to_renderable_type() {
    let client = default_codec_client();

    let response = client
        .send(TestRequestBuilder::get("/entity").accept("text/plain, application/json"))
        .await;
    assert_status(&response, 200);
    assert_json_content_type(&response);
    assert_eq!(response.body_string(), r#"{"v":1}"#);

    let text_only = client
        .send(TestRequestBuilder::get("/entity").accept("text/plain"))
        .await;
    assert_http_status(&text_only, HttpStatus::NotAcceptable);
}

#[tokio::test]
async fn test_accept_refusing_every_type() {
    let client = default_codec_client();

    let response = client
        .send(TestRequestBuilder::get("/entity").accept("application/json;q=0, */*;q=0"))
        .await;
    assert_http_status(&response, HttpStatus::NotAcceptable);
}

// =============================================================================
// Argument resolution
// =============================================================================

#[tokio::test]
async fn test_missing_required_query_parameter() {
    let client = TestClient::from_deployment(
        Deployment::new().route(
            HandlerMethod::new("greet", Mapping::get("/greet"), |mut args: Args| async move {
                let name: String = args.take(0)?;
                Ok::<_, Error>(format!("hello {name}"))
            })
            .param(Param::query::<String>("name")),
        ),
    )
    .unwrap();

    let ok = client
        .send(TestRequestBuilder::get("/greet").query("name", "ada"))
        .await;
    assert_eq!(ok.body_string(), "hello ada");

    let missing = client.get("/greet").await;
    assert_status(&missing, 400);
    assert!(missing.error_message().unwrap().contains("name"));
}

#[tokio::test]
async fn test_unresolvable_parameter_fails_deployment() {
    struct Opaque;

    let result = Deployment::new()
        .route(
            HandlerMethod::new("opaque", Mapping::get("/opaque"), |_args: Args| async {
                Ok::<_, Error>(())
            })
            .param(Param::opaque::<Opaque>()),
        )
        .build();
    assert!(matches!(result, Err(Error::NoSuitableResolver(_))));
}

// =============================================================================
// Interceptors
// =============================================================================

fn intercepted_client(log: &HookLog, gate: RecordingInterceptor) -> TestClient {
    TestClient::from_deployment(
        Deployment::new()
            .interceptor(InterceptorRegistration::new(Arc::new(
                RecordingInterceptor::new("outer", log),
            )))
            .interceptor(InterceptorRegistration::new(Arc::new(gate)))
            .route(HandlerMethod::new(
                "ok",
                Mapping::get("/ok"),
                |_args: Args| async { Ok::<_, Error>("fine") },
            ))
            .route(HandlerMethod::new(
                "boom",
                Mapping::get("/boom"),
                |_args: Args| async { Err::<(), _>(Error::Conflict("boom".into())) },
            )),
    )
    .unwrap()
}

#[tokio::test]
async fn test_after_completion_on_success_and_failure() {
    let log = HookLog::new();
    let client = intercepted_client(&log, RecordingInterceptor::new("inner", &log));

    assert_status(&client.get("/ok").await, 200);
    assert_eq!(
        log.names(),
        [
            "pre:outer",
            "pre:inner",
            "post:outer",
            "post:inner",
            "after:outer",
            "after:inner"
        ]
    );

    log.clear();
    assert_status(&client.get("/boom").await, 409);
    assert_eq!(log.after_count(), 2);
    assert_eq!(log.count(|h| matches!(h, Hook::Post(_))), 0);
    assert!(log.entries().iter().all(|h| match h {
        Hook::After(_, error) => error.as_deref().is_some_and(|e| e.contains("boom")),
        _ => true,
    }));
}

#[tokio::test]
async fn test_after_completion_only_for_passed_interceptors() {
    let log = HookLog::new();
    let client = intercepted_client(&log, RecordingInterceptor::new("inner", &log).rejecting());

    client.get("/ok").await;
    assert_eq!(log.names(), ["pre:outer", "pre:inner", "after:outer"]);

    log.clear();
    let failing = intercepted_client(&log, RecordingInterceptor::new("inner", &log).failing());
    let response = failing.get("/ok").await;
    assert_status(&response, 403);
    assert_eq!(log.names(), ["pre:outer", "pre:inner", "after:outer"]);
}

// =============================================================================
// Scheduling
// =============================================================================

#[tokio::test]
async fn test_queued_timeout_rejects_before_handler_runs() {
    let runs = Arc::new(AtomicUsize::new(0));
    let log = HookLog::new();
    let handler_runs = runs.clone();

    let client = TestClient::from_deployment(
        Deployment::new()
            .scheduler(
                Scheduler::bounded(BoundedConfig::new("slow", 1))
                    .with_policy(TimeoutPolicy::QueuedTimeout(Duration::from_millis(100))),
            )
            .interceptor(InterceptorRegistration::new(Arc::new(
                RecordingInterceptor::new("audit", &log),
            )))
            .route(
                HandlerMethod::new("work", Mapping::get("/work"), move |_args: Args| {
                    let runs = handler_runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(150)).await;
                        Ok::<_, Error>("done")
                    }
                })
                .scheduler("slow"),
            ),
    )
    .unwrap();

    let (first, second) = tokio::join!(client.get("/work"), client.get("/work"));

    assert_status(&first, 200);
    assert_http_status(&second, HttpStatus::ServiceUnavailable);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(log.after_count(), 2);
    assert_eq!(
        log.count(|h| matches!(h, Hook::After(_, Some(e)) if e.contains("queued timeout"))),
        1
    );
}

#[tokio::test]
async fn test_first_byte_timeout_abandons_handler() {
    let finished = Arc::new(AtomicBool::new(false));
    let log = HookLog::new();
    let flag = finished.clone();

    let client = TestClient::from_deployment(
        Deployment::new()
            .scheduler(
                Scheduler::bounded(BoundedConfig::new("deadline", 2))
                    .with_policy(TimeoutPolicy::TimeToFirstByte(Duration::from_millis(50))),
            )
            .interceptor(InterceptorRegistration::new(Arc::new(
                RecordingInterceptor::new("audit", &log),
            )))
            .route(
                HandlerMethod::new("slow", Mapping::get("/slow"), move |_args: Args| {
                    let flag = flag.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        flag.store(true, Ordering::SeqCst);
                        Ok::<_, Error>("late")
                    }
                })
                .scheduler("deadline"),
            ),
    )
    .unwrap();

    let response = client.get("/slow").await;
    assert_http_status(&response, HttpStatus::ServiceUnavailable);
    assert_eq!(log.after_count(), 1);
    assert_eq!(log.count(|h| matches!(h, Hook::After(_, Some(_)))), 1);
    assert_eq!(log.count(|h| matches!(h, Hook::Post(_))), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_biz_handlers_run_on_pool_threads() {
    let client = TestClient::from_deployment(Deployment::new().route(HandlerMethod::new(
        "whoami",
        Mapping::get("/whoami"),
        |_args: Args| async {
            let thread = std::thread::current();
            Ok::<_, Error>(thread.name().unwrap_or("unnamed").to_string())
        },
    )))
    .unwrap();

    let response = client.get("/whoami").await;
    assert_status(&response, 200);
    assert_eq!(response.body_string(), "biz-worker");
}

#[tokio::test]
async fn test_handler_declared_scheduler_is_bound() {
    let dispatcher = Deployment::new()
        .route(
            HandlerMethod::new("io", Mapping::get("/io"), |_args: Args| async {
                Ok::<_, Error>(())
            })
            .scheduler("io"),
        )
        .route(HandlerMethod::new(
            "biz",
            Mapping::get("/biz"),
            |_args: Args| async { Ok::<_, Error>(()) },
        ))
        .build()
        .unwrap();

    assert_eq!(dispatcher.scheduler_of(0).unwrap().name(), "io");
    assert_eq!(dispatcher.scheduler_of(1).unwrap().name(), "biz");
}

// =============================================================================
// Entity round trips
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Login {
    user: String,
    remember: String,
}

fn echo_client() -> TestClient {
    TestClient::from_deployment(
        Deployment::new().route(
            HandlerMethod::new("echo", Mapping::post("/echo"), |mut args: Args| async move {
                let login: Login = args.take(0)?;
                Reply::entity(&login)
            })
            .param(Param::body::<Login>()),
        ),
    )
    .unwrap()
}

#[tokio::test]
async fn test_json_entity_round_trip() {
    let login = Login {
        user: "ada".into(),
        remember: "yes".into(),
    };
    let response = echo_client()
        .send(TestRequestBuilder::post("/echo").json(&login))
        .await;

    assert_status(&response, 200);
    assert_json(&response, &login);
}

#[tokio::test]
async fn test_form_entity_round_trip() {
    let login = Login {
        user: "ada lovelace".into(),
        remember: "no".into(),
    };
    let response = echo_client()
        .send(
            TestRequestBuilder::post("/echo")
                .form(&login)
                .accept("application/x-www-form-urlencoded"),
        )
        .await;

    assert_status(&response, 200);
    let bytes = response.inner().body();
    let value = FormSerializer::default().deserialize(&bytes).unwrap();
    assert_eq!(serde_json::from_value::<Login>(value).unwrap(), login);
}

// =============================================================================
// Lookup failures
// =============================================================================

#[tokio::test]
async fn test_lookup_failures() {
    let client = TestClient::from_deployment(
        Deployment::new().route(HandlerMethod::new(
            "items",
            Mapping::post("/items")
                .consumes("application/json")
                .produces("application/json"),
            |_args: Args| async { Ok::<_, Error>(json!({"created": true})) },
        )),
    )
    .unwrap();

    assert_status(&client.get("/nothing").await, 404);

    let wrong_method = client.get("/items").await;
    assert_status(&wrong_method, 405);
    assert_header(&wrong_method, "allow", "POST");

    let wrong_type = client
        .send(
            TestRequestBuilder::post("/items")
                .content_type("text/plain")
                .body("x"),
        )
        .await;
    assert_status(&wrong_type, 415);

    let wrong_accept = client
        .send(
            TestRequestBuilder::post("/items")
                .json(&json!({}))
                .accept("text/html"),
        )
        .await;
    assert_status(&wrong_accept, 406);

    let created = client.post_json("/items", &json!({})).await;
    assert_success(&created);
    assert_body_contains(&created, "created");
}
