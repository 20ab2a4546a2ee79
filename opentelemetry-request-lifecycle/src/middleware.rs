//! [`tower`] middleware running every request inside its own span.
use crate::hooks::RequestHooks;
use crate::span::{Failure, Outcome, SpanHandle, SpanLifecycleController};
use http::{Request, Response};
use opentelemetry::Context;
use pin_project_lite::pin_project;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context as TaskContext, Poll};
use tower::{BoxError, Layer, Service};

/// Layer wrapping services in a [`RequestSpanService`].
#[derive(Clone, Debug)]
pub struct RequestSpanLayer {
    hooks: RequestHooks,
}

impl RequestSpanLayer {
    /// Creates a layer beginning spans with `controller`.
    pub fn new(controller: Arc<SpanLifecycleController>) -> Self {
        Self::from_hooks(RequestHooks::new(controller))
    }

    /// Creates a layer sharing existing `hooks`.
    pub fn from_hooks(hooks: RequestHooks) -> Self {
        RequestSpanLayer { hooks }
    }
}

impl<S> Layer<S> for RequestSpanLayer {
    type Service = RequestSpanService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestSpanService {
            inner,
            hooks: self.hooks.clone(),
        }
    }
}

/// Service beginning a span per request and finalizing it when the response,
/// an error, or cancellation ends the request.
///
/// The span's context is current while the inner service is called and while
/// its future is polled, so spans and events created by the handler join the
/// request's trace.
#[derive(Clone, Debug)]
pub struct RequestSpanService<S> {
    inner: S,
    hooks: RequestHooks,
}

impl<S, B, R> Service<Request<B>> for RequestSpanService<S>
where
    S: Service<Request<B>, Response = Response<R>>,
    S::Error: fmt::Display + 'static,
{
    type Response = Response<R>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<B>) -> Self::Future {
        let handle = self.hooks.on_request_start(&mut request);
        let otel_cx = handle.context().clone();
        // Armed before the inner call so a panicking service still ends the span.
        let guard = FinalizeGuard {
            controller: self.hooks.controller().clone(),
            handle: Some(handle),
        };
        let inner = {
            let _attached = otel_cx.clone().attach();
            self.inner.call(request)
        };

        ResponseFuture {
            inner,
            otel_cx,
            guard,
        }
    }
}

pin_project! {
    /// Response future of [`RequestSpanService`].
    #[derive(Debug)]
    pub struct ResponseFuture<F> {
        #[pin]
        inner: F,
        otel_cx: Context,
        guard: FinalizeGuard,
    }
}

impl<F, R, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<Response<R>, E>>,
    E: fmt::Display + 'static,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = {
            let _guard = this.otel_cx.clone().attach();
            ready!(this.inner.poll(task_cx))
        };

        match &result {
            Ok(response) => this
                .guard
                .complete(Outcome::response(response.status().as_u16())),
            Err(err) => this.guard.fail(&failure_of(err)),
        }
        Poll::Ready(result)
    }
}

/// Boxed service errors are recorded with the type of the error they hold.
fn failure_of<E>(error: &E) -> Failure
where
    E: fmt::Display + 'static,
{
    match (error as &dyn Any).downcast_ref::<BoxError>() {
        Some(boxed) => Failure::from_dyn_error(&**boxed),
        None => Failure::from_error(error),
    }
}

/// Finalizes the span exactly once, as cancelled if the future is dropped
/// before it completes.
#[derive(Debug)]
struct FinalizeGuard {
    controller: Arc<SpanLifecycleController>,
    handle: Option<SpanHandle>,
}

impl FinalizeGuard {
    fn complete(&mut self, outcome: Outcome) {
        if let Some(handle) = self.handle.take() {
            self.controller.finalize(&handle, outcome);
        }
    }

    fn fail(&mut self, failure: &Failure) {
        if let Some(handle) = self.handle.take() {
            self.controller.finalize_failure(&handle, failure);
        }
    }
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        self.complete(Outcome::Cancelled);
    }
}
