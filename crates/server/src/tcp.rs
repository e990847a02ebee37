use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use relay::{ConnectionHandle, RelayContext};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

use crate::wait_for_shutdown;

/// Longest accepted frame; a longer line ends the connection.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Accepts newline-delimited JSON clients until shutdown is signalled.
pub async fn serve(listener: TcpListener, relay: RelayContext, mut shutdown: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let relay = relay.clone();
                tokio::spawn(async move { handle_connection(relay, stream, peer).await });
            }
            Err(error) => warn!(%error, "failed to accept tcp connection"),
        }
    }
    info!("tcp listener stopped");
}

async fn handle_connection(relay: RelayContext, stream: TcpStream, peer: SocketAddr) {
    let (read_half, write_half) = stream.into_split();
    let reader = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut writer = FramedWrite::new(write_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    let (connection, mut outbox) = ConnectionHandle::open();
    let connection_id = connection.id();
    debug!(connection = %connection_id, %peer, "tcp client connected");

    let writer_task = tokio::spawn(async move {
        while let Some(event) = outbox.next().await {
            let line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(error) => {
                    warn!(%error, "failed to encode event");
                    continue;
                }
            };
            if let Err(error) = writer.send(line).await {
                debug!(%error, "tcp write failed");
                break;
            }
        }
    });

    let frames = reader.scan((), move |_, line| {
        futures::future::ready(match line {
            Ok(line) => Some(line),
            Err(error) => {
                debug!(connection = %connection_id, %error, "ending tcp read");
                None
            }
        })
    });
    relay::drive(&relay, connection, Box::pin(frames)).await;

    let _ = writer_task.await;
    debug!(connection = %connection_id, %peer, "tcp client disconnected");
}
