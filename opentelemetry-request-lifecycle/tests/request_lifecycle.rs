use http::{Request, Response, StatusCode};
use opentelemetry::trace::{Status, TraceContextExt};
use opentelemetry::{Context, Value};
use opentelemetry_request_lifecycle::events::{EventRecord, EventSink};
use opentelemetry_request_lifecycle::span::{STATUS_CODE, TRACE_ID, WORK_CANCELLED};
use opentelemetry_request_lifecycle::{
    Dimensions, EventEmitter, RequestHooks, RequestSpanLayer, SpanLifecycleController,
    TelemetryResult,
};
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SpanData};
use std::collections::HashSet;
use std::convert::Infallible;
use std::future::Ready;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::{service_fn, BoxError, Layer, Service, ServiceExt};

struct Harness {
    controller: Arc<SpanLifecycleController>,
    exporter: InMemorySpanExporter,
    _provider: SdkTracerProvider,
}

impl Harness {
    fn new() -> Self {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        Harness {
            controller: Arc::new(SpanLifecycleController::from_provider(&provider)),
            exporter,
            _provider: provider,
        }
    }

    fn layer(&self) -> RequestSpanLayer {
        RequestSpanLayer::new(self.controller.clone())
    }

    fn spans(&self) -> Vec<SpanData> {
        self.exporter
            .get_finished_spans()
            .expect("Spans are expected to be exported.")
    }
}

#[derive(Debug, Default)]
struct RecordingSink {
    records: Mutex<Vec<EventRecord>>,
}

impl EventSink for RecordingSink {
    fn emit(&self, record: EventRecord) -> TelemetryResult<()> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

fn attribute<'a>(span: &'a SpanData, key: &str) -> Option<&'a Value> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| &kv.value)
}

fn request(path: &str) -> Request<()> {
    Request::get(path).body(()).unwrap()
}

#[tokio::test]
async fn successful_request_ends_span_ok() {
    let harness = Harness::new();
    let service = harness.layer().layer(service_fn(|_req: Request<()>| async {
        Ok::<_, Infallible>(Response::new("hello"))
    }));

    let response = service.oneshot(request("/test/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let spans = harness.spans();
    assert_eq!(spans.len(), 1);
    let span = &spans[0];
    assert_eq!(span.name, "GET /test/");
    assert_eq!(span.status, Status::Ok);
    assert!(span.end_time >= span.start_time);
    assert_eq!(attribute(span, STATUS_CODE), Some(&Value::I64(200)));
    assert_eq!(
        attribute(span, "http.request.method"),
        Some(&Value::from("GET"))
    );
    assert_eq!(attribute(span, "url.path"), Some(&Value::from("/test/")));
    assert!(harness.controller.carrier().is_empty());
}

#[tokio::test]
async fn server_error_response_marks_span_error() {
    let harness = Harness::new();
    let service = harness.layer().layer(service_fn(|_req: Request<()>| async {
        let mut response = Response::new(());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        Ok::<_, Infallible>(response)
    }));

    let response = service.oneshot(request("/broken")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let spans = harness.spans();
    assert_eq!(spans.len(), 1);
    assert!(matches!(spans[0].status, Status::Error { .. }));
    assert_eq!(attribute(&spans[0], STATUS_CODE), Some(&Value::I64(500)));
}

#[tokio::test]
async fn handler_error_is_recorded_and_propagated() {
    let harness = Harness::new();
    let service = harness.layer().layer(service_fn(|_req: Request<()>| async {
        Err::<Response<()>, _>(io::Error::other("database unavailable"))
    }));

    let err = service.oneshot(request("/orders")).await.unwrap_err();
    assert_eq!(err.to_string(), "database unavailable");

    let spans = harness.spans();
    assert_eq!(spans.len(), 1);
    let span = &spans[0];
    assert_eq!(span.status, Status::error("database unavailable"));
    assert_eq!(span.events.len(), 1);
    assert_eq!(span.events[0].name, "exception");
    assert!(attribute(span, "error.type").is_some());
    assert!(attribute(span, STATUS_CODE).is_none());
}

#[tokio::test]
async fn boxed_handler_error_keeps_its_type() {
    let harness = Harness::new();
    let service = harness.layer().layer(service_fn(|_req: Request<()>| async {
        Err::<Response<()>, BoxError>(Box::new(io::Error::other("cache unreachable")))
    }));

    let err = service.oneshot(request("/cache")).await.unwrap_err();
    assert!(err.is::<io::Error>());

    let spans = harness.spans();
    let expected = Value::from(std::any::type_name::<io::Error>());
    assert_eq!(attribute(&spans[0], "error.type"), Some(&expected));
    let event_type = spans[0].events[0]
        .attributes
        .iter()
        .find(|kv| kv.key.as_str() == "exception.type")
        .map(|kv| &kv.value);
    assert_eq!(event_type, Some(&expected));
}

#[test]
fn panicking_service_call_still_finalizes_span() {
    let harness = Harness::new();
    let mut service = harness
        .layer()
        .layer(service_fn(|_req: Request<()>| -> Ready<Result<Response<()>, Infallible>> {
            panic!("router table missing")
        }));

    let result = panic::catch_unwind(AssertUnwindSafe(|| service.call(request("/boom"))));
    assert!(result.is_err());

    assert!(harness.controller.carrier().is_empty());
    let spans = harness.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].status, Status::error("cancelled"));
    assert_eq!(attribute(&spans[0], WORK_CANCELLED), Some(&Value::Bool(true)));
}

#[tokio::test]
async fn dropped_request_is_finalized_as_cancelled() {
    let harness = Harness::new();
    let service = harness.layer().layer(service_fn(|_req: Request<()>| async {
        std::future::pending::<()>().await;
        Ok::<_, Infallible>(Response::new(()))
    }));

    let timed_out =
        tokio::time::timeout(Duration::from_millis(20), service.oneshot(request("/slow"))).await;
    assert!(timed_out.is_err());

    let spans = harness.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].status, Status::error("cancelled"));
    assert_eq!(attribute(&spans[0], WORK_CANCELLED), Some(&Value::Bool(true)));
    assert!(harness.controller.carrier().is_empty());
}

#[tokio::test]
async fn handler_runs_inside_request_span() {
    let harness = Harness::new();
    let sink = Arc::new(RecordingSink::default());
    let emitter = EventEmitter::new(sink.clone());
    let hooks = RequestHooks::new(harness.controller.clone());

    let service = harness.layer().layer(service_fn(move |req: Request<()>| {
        let emitter = emitter.clone();
        let hooks = hooks.clone();
        async move {
            let handle = hooks.span_for(&req).expect("request span is attached");
            hooks
                .controller()
                .annotate(&handle, Dimensions::new().with("user_id", "42"));
            tokio::task::yield_now().await;
            emitter.page_view(Dimensions::new().with("page", "/home"));
            let active = Context::current().span().span_context().span_id();
            assert_eq!(active, handle.span_context().span_id());
            Ok::<_, Infallible>(Response::new(()))
        }
    }));

    service.oneshot(request("/home")).await.unwrap();

    let spans = harness.spans();
    let trace_id = spans[0].span_context.trace_id();
    assert_eq!(attribute(&spans[0], "user_id"), Some(&Value::from("42")));

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].trace_id, Some(trace_id));
    assert_eq!(
        records[0].attribute(TRACE_ID),
        Some(&Value::from(trace_id.to_string()))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_never_share_a_span() {
    let harness = Harness::new();
    let hooks = RequestHooks::new(harness.controller.clone());
    let service = harness.layer().layer(service_fn(move |req: Request<()>| {
        let hooks = hooks.clone();
        async move {
            let expected = format!("GET {}", req.uri().path());
            for _ in 0..3 {
                let handle = hooks.span_for(&req).expect("request span is attached");
                assert_eq!(handle.name(), expected);
                assert_eq!(
                    Context::current().span().span_context().span_id(),
                    handle.span_context().span_id()
                );
                tokio::task::yield_now().await;
            }
            Ok::<_, Infallible>(Response::new(()))
        }
    }));

    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let service = service.clone();
            tokio::spawn(async move { service.oneshot(request(&format!("/item/{i}"))).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let spans = harness.spans();
    assert_eq!(spans.len(), 50);
    let trace_ids: HashSet<_> = spans.iter().map(|s| s.span_context.trace_id()).collect();
    assert_eq!(trace_ids.len(), 50);
    assert!(harness.controller.carrier().is_empty());
}

#[tokio::test]
async fn disabled_controller_passes_requests_through() {
    let controller = Arc::new(SpanLifecycleController::disabled());
    let service = RequestSpanLayer::new(controller.clone()).layer(service_fn(
        |_req: Request<()>| async { Ok::<_, Infallible>(Response::new("untraced")) },
    ));

    let response = service.oneshot(request("/")).await.unwrap();
    assert_eq!(response.into_body(), "untraced");
    assert!(controller.carrier().is_empty());

    EventEmitter::noop().emit("page_view", Dimensions::new().with("page", "/home"), "INFO");
}
