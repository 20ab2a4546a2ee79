//! Sends a few requests through an instrumented service and prints the
//! resulting spans and events to stdout.
//!
//! run with `$ cargo run -p request-lifecycle-stdout`
use http::{Request, Response, StatusCode};
use opentelemetry::global;
use opentelemetry_request_lifecycle::telemetry::{install_subscriber, Telemetry};
use opentelemetry_request_lifecycle::{Dimensions, EventEmitter, RequestHooks};
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_stdout::{LogExporter, SpanExporter};
use std::io;
use tower::{service_fn, Layer, ServiceExt};
use tracing::info;

async fn router(
    req: Request<()>,
    hooks: RequestHooks,
    emitter: EventEmitter,
) -> Result<Response<String>, io::Error> {
    match req.uri().path() {
        "/home" => {
            emitter.page_view(Dimensions::new().with("page", "/home"));
            Ok(Response::new("welcome".to_owned()))
        }
        "/checkout" => {
            if let Some(handle) = hooks.span_for(&req) {
                hooks
                    .controller()
                    .annotate(&handle, Dimensions::new().with("cart.items", 3_i64));
            }
            emitter.track_user_action("checkout", Some("42"), Dimensions::new());
            info!(name: "checkout", message = "order placed");
            Ok(Response::new("ordered".to_owned()))
        }
        "/fail" => Err(io::Error::other("payment backend unavailable")),
        _ => {
            let mut not_found = Response::new(String::new());
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            Ok(not_found)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    global::set_text_map_propagator(TraceContextPropagator::new());
    let tracer_provider = SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .build();
    let logger_provider = SdkLoggerProvider::builder()
        .with_simple_exporter(LogExporter::default())
        .build();
    install_subscriber(Some(&logger_provider));

    let telemetry = Telemetry::from_providers(tracer_provider, logger_provider);
    let hooks = telemetry.hooks();
    let emitter = telemetry.emitter().clone();
    let service = telemetry.layer().layer(service_fn(move |req| {
        router(req, hooks.clone(), emitter.clone())
    }));

    for path in ["/home", "/checkout", "/missing", "/fail"] {
        // A caller that already started a trace.
        let request = Request::get(path)
            .header(
                "traceparent",
                "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            )
            .body(())?;
        match service.clone().oneshot(request).await {
            Ok(response) => {
                info!(name: "response", path = path, status = response.status().as_u16())
            }
            Err(err) => info!(name: "error", path = path, error = err.to_string()),
        }
    }

    telemetry.shutdown()?;
    Ok(())
}
