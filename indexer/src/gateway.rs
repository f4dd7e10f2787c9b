//! Broadcast gateway
//!
//! - `/health` - liveness
//! - `/stats` - store aggregates and privacy metrics
//! - `/sse/events` - every bus event, named by topic
//!
//! Read-only: the gateway subscribes to the bus and never publishes into it.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::stream::Stream;
use mixscope::{EventBus, MetricsSnapshot, Orchestrator, StoreError, SubscriptionId};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::shutdown::ShutdownSignal;

const CHANNEL_CAPACITY: usize = 1024;

/// A bus event, serialized once for every SSE client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEvent {
    pub topic: String,
    pub data: String,
}

#[derive(Clone)]
pub struct GatewayState {
    orchestrator: Arc<Orchestrator>,
    events: broadcast::Sender<GatewayEvent>,
}

impl GatewayState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            orchestrator,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Forwards every bus event to connected clients. Events published while
    /// nobody is connected are dropped.
    pub fn bridge(&self, bus: &EventBus) -> SubscriptionId {
        let events = self.events.clone();
        bus.subscribe_all(move |event| {
            let data = match serde_json::to_string(event) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("Failed to serialize {} event: {}", event.topic(), e);
                    return;
                }
            };
            let _ = events.send(GatewayEvent {
                topic: event.topic().to_string(),
                data,
            });
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        #[derive(Serialize)]
        struct ErrBody {
            error: String,
        }
        tracing::error!("internal error: {}", self);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrBody {
                error: "internal server error".into(),
            }),
        )
            .into_response()
    }
}

/// GET /health
pub async fn health() -> &'static str {
    "OK"
}

/// GET /stats
pub async fn stats(State(state): State<GatewayState>) -> Result<Json<MetricsSnapshot>, GatewayError> {
    Ok(Json(state.orchestrator.snapshot().await?))
}

/// GET /sse/events - Stream every bus event
pub async fn sse_events(
    State(state): State<GatewayState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.subscribe());

    // Lagged clients skip what they missed
    let event_stream = stream.filter_map(|result| match result {
        Ok(event) => Some(Ok(Event::default().event(event.topic).data(event.data))),
        Err(_) => None,
    });

    Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/sse/events", get(sse_events))
        .with_state(state)
}

/// Serves until `shutdown` fires.
pub async fn serve(state: GatewayState, port: u16, shutdown: ShutdownSignal) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Gateway listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;

    tracing::info!("Gateway stopped");
    Ok(())
}
