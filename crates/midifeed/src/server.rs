//! HTTP surface: live feed over SSE plus a health probe.
//!
//! The MIDI producer runs as a session task publishing into the hub; each
//! `GET /events` connection subscribes to it and streams deliveries until
//! the client goes away or the server shuts down.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, HeaderValue, Method, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use feedconf::FeedConfig;
use futures::stream::{Stream, StreamExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::delivery::{deliveries, Delivery};
use crate::event::{FeedRecord, RawMessageEvent, StatusRecord};
use crate::hub::Hub;
use crate::normalize::{is_useful, NormalizeOptions, Normalizer};
use crate::session::{run_session, SessionHandler};
use crate::source::MidiSource;

/// Hub carrying live feed records.
pub type FeedHub = Hub<Arc<FeedRecord>>;

/// Shared router state.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<FeedHub>,
    pub keep_alive: Duration,
}

impl AppState {
    pub fn new(hub: Arc<FeedHub>, keep_alive: Duration) -> Self {
        Self { hub, keep_alive }
    }
}

/// Build the router. Every response allows any origin; any method other
/// than GET is answered as a CORS preflight.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/events", get(handle_events).fallback(handle_preflight))
        .route("/health", get(handle_health).fallback(handle_preflight))
        .fallback(handle_fallback)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tracing::instrument(skip(state))]
async fn handle_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.hub.subscribe();
    info!(
        subscriber = %subscription.id(),
        subscribers = state.hub.subscriber_count(),
        "SSE client connected"
    );

    let stream = deliveries(subscription, state.keep_alive)
        .filter_map(|delivery| async move { delivery_to_sse_event(delivery).map(Ok) });

    Sse::new(stream)
}

/// Convert a delivery to an SSE event. `None` if the record won't serialize.
fn delivery_to_sse_event(delivery: Delivery<Arc<FeedRecord>>) -> Option<Event> {
    match delivery {
        Delivery::Connected => Some(Event::default().comment("connected")),
        Delivery::Heartbeat => Some(Event::default().comment("ping")),
        Delivery::Record(record) => match serde_json::to_string(record.as_ref()) {
            Ok(data) => Some(Event::default().data(data)),
            Err(e) => {
                warn!("Failed to serialize feed record: {}", e);
                None
            }
        },
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

async fn handle_preflight() -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, OPTIONS"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
        ],
    )
        .into_response()
}

async fn handle_fallback(method: Method) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return handle_preflight().await;
    }
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "Not Found",
    )
        .into_response()
}

/// Session handler that normalizes and publishes into the feed hub.
pub struct FeedPublisher {
    hub: Arc<FeedHub>,
    normalizer: Normalizer,
    options: NormalizeOptions,
    include_all: bool,
    verbose: bool,
}

impl FeedPublisher {
    pub fn new(hub: Arc<FeedHub>, hold_threshold_s: f64, include_all: bool) -> Self {
        Self {
            hub,
            normalizer: Normalizer::new(),
            options: NormalizeOptions {
                hold_threshold_s: Some(hold_threshold_s),
                include_payload: false,
                include_controller_name: true,
            },
            include_all,
            verbose: false,
        }
    }

    /// Also print every published event to stdout.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

impl SessionHandler for FeedPublisher {
    fn on_open(&mut self, _device: &str) {
        // Holds from before the reconnect can never resolve
        self.normalizer.reset();
    }

    fn on_event(&mut self, event: RawMessageEvent) {
        if !self.include_all && !is_useful(event.kind) {
            return;
        }
        let unified = self.normalizer.normalize(&event, self.options);
        if self.verbose {
            println!("{}", serde_json::Value::Object(unified.to_record()));
        }
        self.hub.publish(Arc::new(FeedRecord::from(unified)));
    }

    fn on_status(&mut self, status: StatusRecord) {
        self.hub.publish(Arc::new(FeedRecord::from(status)));
    }
}

/// Run the producer and the HTTP server until `cancel` fires.
pub async fn run(config: &FeedConfig, cancel: CancellationToken) -> Result<()> {
    let hub: Arc<FeedHub> = Hub::new(config.server.queue_capacity);
    let state = AppState::new(
        Arc::clone(&hub),
        Duration::from_secs(config.server.keep_alive_secs.max(1)),
    );

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let mut source = MidiSource::new(config.device.keywords.clone());
    let mut publisher = FeedPublisher::new(
        Arc::clone(&hub),
        config.normalize.hold_threshold_s,
        config.server.include_all,
    )
    .with_verbose(config.verbose);
    let retry = Duration::from_millis(config.device.retry_ms);
    let producer_cancel = cancel.clone();
    let producer = tokio::spawn(async move {
        run_session(&mut source, &mut publisher, retry, producer_cancel).await
    });

    info!("🎹 midifeed ready!");
    info!("   Events: GET http://{}/events", addr);
    info!("   Health: GET http://{}/health", addr);
    info!(
        "   Hold threshold: {:.3}s, all kinds: {}",
        config.normalize.hold_threshold_s, config.server.include_all
    );

    let shutdown_hub = Arc::clone(&hub);
    let shutdown_cancel = cancel.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown_cancel.cancelled().await;
            // Ends every open event stream so connections can drain
            shutdown_hub.shutdown();
        })
        .await
        .context("Server error")?;

    cancel.cancel();
    match producer.await {
        Ok(failures) => info!(failures, "MIDI session stopped"),
        Err(e) => warn!("MIDI session task failed: {}", e),
    }
    info!(
        published = hub.published_total(),
        dropped = hub.dropped_total(),
        "Shutdown complete"
    );
    Ok(())
}
