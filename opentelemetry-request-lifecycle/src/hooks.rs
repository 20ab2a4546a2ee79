//! Glue between a web framework's request pipeline and the span lifecycle.
use crate::span::{Failure, Outcome, SpanHandle, SpanLifecycleController, WorkId};
use http::{HeaderMap, Request, Response};
use opentelemetry::{global, otel_debug, Context, KeyValue};
use opentelemetry_http::HeaderExtractor;
use opentelemetry_semantic_conventions::attribute::{HTTP_REQUEST_METHOD, URL_PATH};
use std::fmt;
use std::sync::Arc;

/// Hooks invoked at the request start, response ready and unhandled error
/// points of a request pipeline.
///
/// The [`WorkId`] of a request is stored in its extensions, so the later
/// hooks only need the request to find its span.
#[derive(Clone, Debug)]
pub struct RequestHooks {
    controller: Arc<SpanLifecycleController>,
}

impl RequestHooks {
    /// Creates hooks beginning spans with `controller`.
    pub fn new(controller: Arc<SpanLifecycleController>) -> Self {
        RequestHooks { controller }
    }

    /// The controller owning the request spans.
    pub fn controller(&self) -> &Arc<SpanLifecycleController> {
        &self.controller
    }

    /// Begins the span of `request`.
    ///
    /// The parent is extracted from the inbound headers with the global
    /// propagator; without propagation headers the span starts a new trace.
    ///
    /// A request keeps the [`WorkId`] it was first started under, so starting
    /// it again before its response is a duplicate attachment.
    pub fn on_request_start<B>(&self, request: &mut Request<B>) -> SpanHandle {
        let work = *request
            .extensions_mut()
            .get_or_insert_with(WorkId::next);

        let parent = extract_parent(request.headers());
        let method = request.method().as_str().to_owned();
        let path = request.uri().path().to_owned();
        self.controller.begin_with_attributes(
            work,
            format!("{method} {path}"),
            Some(&parent),
            vec![
                KeyValue::new(HTTP_REQUEST_METHOD, method),
                KeyValue::new(URL_PATH, path),
            ],
        )
    }

    /// The unit of work `request` was registered under, if any.
    pub fn work_id<B>(request: &Request<B>) -> Option<WorkId> {
        request.extensions().get::<WorkId>().copied()
    }

    /// The span of `request`, for handlers that want to annotate it.
    pub fn span_for<B>(&self, request: &Request<B>) -> Option<SpanHandle> {
        Self::work_id(request).and_then(|work| self.controller.retrieve(work))
    }

    /// Finalizes the span of `request` with the status of `response`.
    ///
    /// The response is returned unchanged, also when no span is attached.
    pub fn on_response_ready<B, R>(
        &self,
        request: &Request<B>,
        response: Response<R>,
    ) -> Response<R> {
        match self.span_for(request) {
            Some(handle) => {
                self.controller
                    .finalize(&handle, Outcome::response(response.status().as_u16()));
            }
            None => {
                otel_debug!(name: "RequestHooks.ResponseWithoutSpan");
            }
        }
        response
    }

    /// Records `error` on the span of `request` and finalizes it as failed.
    pub fn on_unhandled_exception<B, E>(&self, request: &Request<B>, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        if let Some(handle) = self.span_for(request) {
            self.controller
                .finalize_failure(&handle, &Failure::from_error(error));
        }
    }
}

/// Extracts the remote parent context carried by `headers`.
pub fn extract_parent(headers: &HeaderMap) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{Phase, WORK_NAME};
    use opentelemetry::trace::{Status, TraceContextExt};
    use opentelemetry::Value;
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};
    use std::panic::{self, AssertUnwindSafe};

    fn hooks() -> (RequestHooks, SdkTracerProvider, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let controller = Arc::new(SpanLifecycleController::from_provider(&provider));
        (RequestHooks::new(controller), provider, exporter)
    }

    #[test]
    fn request_start_and_response_ready() {
        let (hooks, _provider, exporter) = hooks();
        let mut request = Request::get("/test/").body(()).unwrap();

        let handle = hooks.on_request_start(&mut request);
        assert_eq!(handle.phase(), Phase::Active);
        assert!(hooks.span_for(&request).unwrap().same_as(&handle));

        let response = Response::builder().status(200).body("ok").unwrap();
        let response = hooks.on_response_ready(&request, response);
        assert_eq!(response.into_body(), "ok");
        assert!(handle.is_finalized());
        assert!(hooks.span_for(&request).is_none());

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "GET /test/");
        assert_eq!(spans[0].status, Status::Ok);
        assert!(spans[0]
            .attributes
            .iter()
            .any(|kv| kv.key.as_str() == WORK_NAME && kv.value == Value::from("GET /test/")));
    }

    #[test]
    fn unhandled_exception_marks_span_failed() {
        let (hooks, _provider, exporter) = hooks();
        let mut request = Request::post("/orders").body(()).unwrap();
        hooks.on_request_start(&mut request);

        hooks.on_unhandled_exception(&request, "test error");
        // the response hook runs after the error hook in some frameworks
        let response = hooks.on_response_ready(&request, Response::new(()));
        assert_eq!(response.status(), 200);

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, Status::error("test error"));
        assert_eq!(spans[0].events[0].name, "exception");
    }

    #[test]
    fn response_without_span_passes_through() {
        let (hooks, _provider, exporter) = hooks();
        let request = Request::get("/untracked").body(()).unwrap();

        let response = hooks.on_response_ready(&request, Response::new("body"));
        hooks.on_unhandled_exception(&request, "ignored");

        assert_eq!(response.into_body(), "body");
        assert!(exporter.get_finished_spans().unwrap().is_empty());
    }

    #[test]
    fn restarting_a_request_keeps_its_first_span() {
        let (hooks, _provider, _exporter) = hooks();
        let mut request = Request::get("/twice").body(()).unwrap();
        let first = hooks.on_request_start(&mut request);
        let work = RequestHooks::work_id(&request);

        let second = panic::catch_unwind(AssertUnwindSafe(|| hooks.on_request_start(&mut request)));
        if cfg!(debug_assertions) {
            assert!(second.is_err());
        } else if let Ok(second) = second {
            assert!(!second.same_as(&first));
        }
        assert_eq!(RequestHooks::work_id(&request), work);
        assert!(hooks.span_for(&request).unwrap().same_as(&first));

        hooks.on_response_ready(&request, Response::new(()));
        assert!(first.is_finalized());
        assert!(hooks.controller().carrier().is_empty());
    }

    #[test]
    fn extracts_remote_parent_from_traceparent() {
        global::set_text_map_propagator(TraceContextPropagator::new());
        let (hooks, _provider, exporter) = hooks();
        let mut request = Request::get("/downstream")
            .header(
                "traceparent",
                "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            )
            .body(())
            .unwrap();

        let handle = hooks.on_request_start(&mut request);
        hooks.on_response_ready(&request, Response::new(()));

        assert_eq!(
            handle.trace_id().map(|id| id.to_string()).as_deref(),
            Some("4bf92f3577b34da6a3ce929d0e0e4736")
        );
        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans[0].parent_span_id.to_string(), "00f067aa0ba902b7");
        assert!(handle.context().span().span_context().is_sampled());
    }
}
