use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use webcam_stream_common::config::ServerConfig;
use webcam_stream_common::multipart;

use crate::broker::FrameBroker;
use crate::writer::StreamWriter;

pub const STREAM_PATH: &str = "/stream.mjpeg";
pub const GREETING: &str = "Hello from webcam-stream! Open /stream.mjpeg in a browser.\n";

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("invalid multipart boundary {0:?}")]
    InvalidBoundary(String),
    #[error("server task failed: {0}")]
    Serve(String),
}

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct AppState {
    broker: Arc<FrameBroker>,
    boundary: String,
    content_type: HeaderValue,
    writers: TaskTracker,
    stop: CancellationToken,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /stream.mjpeg: open-ended multipart stream of the latest frames.
async fn stream_mjpeg(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let reader = match state.broker.subscribe() {
        Ok(r) => r,
        Err(e) => {
            debug!(%peer, error = %e, "rejecting stream request");
            return (StatusCode::SERVICE_UNAVAILABLE, "stream is shutting down\n").into_response();
        }
    };

    // hyper pulls one part at a time, so each part carries the newest frame
    // when the connection can take it. A viewer that goes away drops the
    // body, and with it the subscription.
    let writer = StreamWriter::new(
        reader,
        state.boundary.clone(),
        state.stop.child_token(),
        peer.to_string(),
    )
    .tracked_by(&state.writers);
    info!(
        %peer,
        viewers = state.broker.subscriber_count(),
        "viewer connected"
    );

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, state.content_type.clone()),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-cache, no-store, must-revalidate"),
            ),
            (header::PRAGMA, HeaderValue::from_static("no-cache")),
            (header::CONNECTION, HeaderValue::from_static("close")),
        ],
        Body::from_stream(writer.into_stream()),
    )
        .into_response()
}

/// Any other path: fixed usage text.
async fn greeting() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        GREETING,
    )
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(STREAM_PATH, get(stream_mjpeg))
        .fallback(greeting)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Server lifecycle
// ---------------------------------------------------------------------------

/// A running MJPEG HTTP server bound to one broker.
pub struct StreamServer {
    local_addr: SocketAddr,
    broker: Arc<FrameBroker>,
    writers: TaskTracker,
    stop: CancellationToken,
    listener_stop: CancellationToken,
    shutdown_timeout: Duration,
    serve_task: JoinHandle<std::io::Result<()>>,
}

impl StreamServer {
    /// Bind the listener and start accepting connections.
    pub async fn start(config: &ServerConfig, broker: Arc<FrameBroker>) -> Result<Self, ServerError> {
        if !multipart::is_valid_boundary(&config.boundary) {
            return Err(ServerError::InvalidBoundary(config.boundary.clone()));
        }
        let content_type = HeaderValue::from_str(&multipart::content_type(&config.boundary))
            .map_err(|_| ServerError::InvalidBoundary(config.boundary.clone()))?;

        let addr = format!("{}:{}", config.bind, config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;

        let writers = TaskTracker::new();
        let stop = CancellationToken::new();
        let state = Arc::new(AppState {
            broker: Arc::clone(&broker),
            boundary: config.boundary.clone(),
            content_type,
            writers: writers.clone(),
            stop: stop.clone(),
        });

        let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
        // Separate from `stop` so the listener outlives the writer join.
        let listener_stop = CancellationToken::new();
        let shutdown = listener_stop.clone();
        let serve_task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        });

        info!(%local_addr, path = STREAM_PATH, "MJPEG server listening");

        Ok(Self {
            local_addr,
            broker,
            writers,
            stop,
            listener_stop,
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            serve_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of viewers currently attached to the broker.
    pub fn viewers(&self) -> usize {
        self.broker.subscriber_count()
    }

    /// Close the broker, wait for every writer (bounded by the configured
    /// timeout), then stop the listener.
    pub async fn shutdown(self) -> Result<(), ServerError> {
        info!(viewers = self.viewers(), "shutting down MJPEG server");
        self.broker.close();
        self.stop.cancel();

        self.writers.close();
        if tokio::time::timeout(self.shutdown_timeout, self.writers.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.writers.len(),
                timeout = ?self.shutdown_timeout,
                "stream writers did not finish in time"
            );
        }

        self.listener_stop.cancel();
        let mut serve_task = self.serve_task;
        match tokio::time::timeout(self.shutdown_timeout, &mut serve_task).await {
            Ok(Ok(Ok(()))) => {
                info!("MJPEG server stopped");
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                error!(error = %e, "MJPEG server exited with error");
                Err(ServerError::Serve(e.to_string()))
            }
            Ok(Err(e)) => Err(ServerError::Serve(e.to_string())),
            Err(_) => {
                warn!("MJPEG server did not stop in time, aborting");
                serve_task.abort();
                Ok(())
            }
        }
    }
}
