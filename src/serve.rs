//! Purpose: Provide the HTTP echo server that binds request bodies through the pipeline.
//! Exports: `ServeConfig`, `serve`, `init_tracing`.
//! Role: Axum-based loopback server; a thin host around `DecodingPipeline`.
//! Invariants: Field errors are reported in a 200 reply; only fatal errors change the status.
//! Invariants: Loopback-only unless explicitly allowed.
//! Invariants: Bodies over the cap answer 413 whether or not a length was declared.
use std::error::Error as StdError;
use std::fmt;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use bytes::Bytes;
use serde_json::json;
use tokio::time::Duration;
use tokio_stream::{Stream, StreamExt};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use bodybind::api::{DecodingPipeline, Error, ErrorKind, PipelineConfig};

use crate::echo::decode_echo;

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub allow_non_loopback: bool,
    pub max_body_bytes: u64,
    pub pipeline: PipelineConfig,
}

struct AppState {
    pipeline: DecodingPipeline,
    max_body_bytes: u64,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let state = Arc::new(AppState {
        pipeline: DecodingPipeline::new(config.pipeline)?,
        max_body_bytes: config.max_body_bytes,
    });

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    tracing::info!(bind = %config.bind, "echo server listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
                }
            }
        }
    };
    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/echo", post(echo))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    if config.max_body_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes must be greater than zero")
            .with_hint("Use a positive value like 16777216."));
    }

    if config.max_body_bytes > usize::MAX as u64 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes exceeds platform limits")
            .with_hint("Use a smaller value that fits in memory."));
    }

    Ok(())
}

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        signal.recv().await;
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

async fn healthz() -> Response {
    Json(json!({ "ok": true })).into_response()
}

async fn echo(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let headers = request.headers();
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let content_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());

    if content_length.is_some_and(|len| len > state.max_body_bytes) {
        return body_too_large();
    }

    let body = limited_body(request.into_body(), state.max_body_bytes);
    match decode_echo(&state.pipeline, content_type.as_deref(), content_length, body).await {
        Ok(reply) => Json(reply).into_response(),
        Err(err) if exceeds_body_limit(&err) => body_too_large(),
        Err(err) => error_response(err),
    }
}

/// Failure of a streamed echo body, either in transport or past the size cap.
#[derive(Debug)]
enum BodyError {
    Read(axum::Error),
    TooLarge { limit: u64 },
}

impl fmt::Display for BodyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyError::Read(err) => write!(f, "{err}"),
            BodyError::TooLarge { limit } => write!(f, "request body exceeds {limit} bytes"),
        }
    }
}

impl StdError for BodyError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            BodyError::Read(err) => Some(err),
            BodyError::TooLarge { .. } => None,
        }
    }
}

/// Data stream that fails once more than `limit` bytes have arrived, whatever the
/// declared length said.
fn limited_body(body: Body, limit: u64) -> impl Stream<Item = Result<Bytes, BodyError>> {
    let mut seen = 0u64;
    body.into_data_stream().map(move |chunk| {
        let chunk = chunk.map_err(BodyError::Read)?;
        seen += chunk.len() as u64;
        if seen > limit {
            return Err(BodyError::TooLarge { limit });
        }
        Ok(chunk)
    })
}

fn exceeds_body_limit(err: &Error) -> bool {
    let mut cur = err.source();
    while let Some(source) = cur {
        if matches!(source.downcast_ref::<BodyError>(), Some(BodyError::TooLarge { .. })) {
            return true;
        }
        cur = source.source();
    }
    false
}

fn body_too_large() -> Response {
    let err = Error::new(ErrorKind::Usage)
        .with_message("request body exceeds --max-body-bytes")
        .with_hint("Send a smaller body or raise --max-body-bytes.");
    error_response_with_status(err, StatusCode::PAYLOAD_TOO_LARGE)
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Syntax | ErrorKind::Conversion | ErrorKind::Usage => StatusCode::BAD_REQUEST,
        ErrorKind::Unsupported => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ErrorKind::Timeout => StatusCode::REQUEST_TIMEOUT,
        ErrorKind::Io | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: Error) -> Response {
    let status = status_for(err.kind());
    error_response_with_status(err, status)
}

fn error_response_with_status(err: Error, status: StatusCode) -> Response {
    if status.is_server_error() {
        tracing::warn!(error = %err, "echo request failed");
    }
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: format!("{:?}", err.kind()),
            message: err.message().unwrap_or("error").to_string(),
            path: err.path().map(str::to_string),
            hint: err.hint().map(str::to_string),
        },
    };
    (status, Json(body)).into_response()
}
