use std::path::PathBuf;

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    events::EventSink,
    pipeline::Engine,
    types::Command,
};

#[derive(Clone)]
pub struct AppState {
    engine: Engine,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Status {
    pub state: String, // "idle" | "running"
    pub scan_records: usize,
    pub known_sites: usize,
}

/// Build the application router: WebSocket channel, status API and the
/// static UI as fallback.
pub fn router(engine: Engine, ui_dir: impl Into<PathBuf>) -> Router {
    let state = AppState { engine };

    let api = Router::new()
        .route("/status", get(get_status))
        .with_state(state.clone());

    let static_svc = ServeDir::new(ui_dir.into()).append_index_html_on_directories(true);

    Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(state)
        .nest("/api", api)
        .fallback_service(static_svc)
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` is cancelled.
pub async fn spawn_server(
    bind: &str,
    engine: Engine,
    ui_dir: impl Into<PathBuf>,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = router(engine, ui_dir);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("serving UI on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let state = if app.engine.is_running() { "running" } else { "idle" };
    let out = Status {
        state: state.into(),
        scan_records: app.engine.scan_records().await.len(),
        known_sites: app.engine.known_sites(),
    };
    (StatusCode::OK, Json(out))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app.engine))
}

/// One observer session: commands in, events out. Pipelines started from a
/// session keep running if the session closes; their events are dropped.
async fn handle_socket(socket: WebSocket, engine: Engine) {
    let (mut tx, mut rx) = socket.split();
    let (sink, mut events) = EventSink::channel();

    let send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(j) => j,
                Err(e) => {
                    warn!("failed to encode event: {e}");
                    continue;
                }
            };
            if tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        match serde_json::from_str::<Command>(text.as_str()) {
            Ok(cmd) => {
                info!(?cmd, "command received");
                engine.dispatch(cmd, sink.clone());
            }
            Err(e) => debug!("ignoring message: {e}"),
        }
    }

    drop(sink);
    send_task.abort();
}
