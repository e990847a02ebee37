use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{future, SinkExt, StreamExt};
use relay::{ConnectionHandle, RelayContext};
use storage::Storage;
use tokio::{net::TcpListener, sync::watch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod tcp;

use config::{load_settings, prepare_database_url};

struct AppState {
    relay: RelayContext,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            error = %format!("{error:#}"),
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let relay = RelayContext::new(storage, settings.relay());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                shutdown_tx.send_replace(true);
            }
            Err(error) => {
                error!(%error, "failed to listen for ctrl-c; shutdown signal disabled");
                future::pending::<()>().await;
            }
        }
    });

    let tcp_task = match &settings.tcp_bind {
        Some(tcp_bind) => {
            let addr: SocketAddr = tcp_bind.parse()?;
            let listener = TcpListener::bind(addr).await?;
            info!(%addr, "tcp listener ready");
            Some(tokio::spawn(tcp::serve(
                listener,
                relay.clone(),
                shutdown_rx.clone(),
            )))
        }
        None => None,
    };

    let app = build_router(Arc::new(AppState { relay }));
    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = TcpListener::bind(addr).await?;
    let mut http_shutdown = shutdown_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { wait_for_shutdown(&mut http_shutdown).await })
        .await?;

    if let Some(tcp_task) = tcp_task {
        if let Err(error) = tcp_task.await {
            warn!(%error, "tcp listener task failed");
        }
    }
    info!("server stopped");
    Ok(())
}

/// Resolves once shutdown was requested or the signal source is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.relay.store.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(error) => {
            warn!(error = %format!("{error:#}"), "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable")
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, receiver) = socket.split();
    let (connection, mut outbox) = ConnectionHandle::open();
    let connection_id = connection.id();
    debug!(connection = %connection_id, "websocket connected");

    let send_task = tokio::spawn(async move {
        while let Some(event) = outbox.next().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(error) => {
                    warn!(%error, "failed to encode event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let frames = receiver
        .take_while(|message| future::ready(matches!(message, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(text),
                _ => None,
            })
        });
    relay::drive(&state.relay, connection, Box::pin(frames)).await;

    let _ = send_task.await;
    debug!(connection = %connection_id, "websocket disconnected");
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
