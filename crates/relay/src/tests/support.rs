//! Harness for driving connections in tests without a real transport.

use std::time::Duration;

use serde_json::Value;
use shared::{domain::UserId, protocol::ServerEvent};
use storage::Storage;
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    auth::{self, SignupRequest},
    drive, ConnectionHandle, Outbox, RelayContext, RelaySettings,
};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(150);

pub fn test_settings() -> RelaySettings {
    RelaySettings {
        bcrypt_cost: 4,
        ..RelaySettings::default()
    }
}

pub async fn memory_context() -> RelayContext {
    let storage = Storage::new("sqlite::memory:").await.expect("storage");
    RelayContext::new(storage, test_settings())
}

pub async fn register_user(ctx: &RelayContext, username: &str, first_name: &str) -> UserId {
    auth::signup(
        ctx,
        SignupRequest {
            username: username.to_string(),
            password: format!("{username}-secret"),
            first_name: first_name.to_string(),
            last_name: "Example".to_string(),
        },
    )
    .await
    .expect("signup")
}

pub struct TestClient {
    frames: mpsc::UnboundedSender<String>,
    outbox: Outbox,
    task: Option<JoinHandle<()>>,
    pub connection: ConnectionHandle,
}

impl TestClient {
    pub fn connect(ctx: &RelayContext) -> Self {
        let (connection, outbox) = ConnectionHandle::open();
        let (frames, inbound) = mpsc::unbounded_channel();
        let ctx = ctx.clone();
        let handle = connection.clone();
        let task = tokio::spawn(async move {
            drive(&ctx, handle, UnboundedReceiverStream::new(inbound)).await;
        });
        Self {
            frames,
            outbox,
            task: Some(task),
            connection,
        }
    }

    /// Connects and signs in with the password `register_user` chose.
    pub async fn signed_in(ctx: &RelayContext, username: &str) -> Self {
        let mut client = Self::connect(ctx);
        client.send(serde_json::json!({
            "type": "signin",
            "from": username,
            "password": format!("{username}-secret"),
        }));
        match client.recv().await {
            ServerEvent::LoginOk { .. } => {}
            other => panic!("expected login_ok, got {other:?}"),
        }
        match client.recv().await {
            ServerEvent::Chatlist { .. } => {}
            other => panic!("expected initial chatlist, got {other:?}"),
        }
        client
    }

    pub fn send(&self, frame: Value) {
        self.send_raw(&frame.to_string());
    }

    pub fn send_raw(&self, raw: &str) {
        self.frames.send(raw.to_string()).expect("connection task alive");
    }

    pub async fn recv(&mut self) -> ServerEvent {
        timeout(WAIT, self.outbox.next())
            .await
            .expect("timed out waiting for event")
            .expect("outbox closed")
    }

    /// Next event that is not a chat-list refresh.
    pub async fn recv_skipping_chatlists(&mut self) -> ServerEvent {
        loop {
            match self.recv().await {
                ServerEvent::Chatlist { .. } => continue,
                event => return event,
            }
        }
    }

    pub async fn expect_quiet(&mut self) {
        if let Ok(event) = timeout(QUIET, self.outbox.next()).await {
            panic!("expected no event, got {event:?}");
        }
    }

    /// Waits for the connection's worker to exit.
    pub async fn wait_closed(&mut self) {
        let task = self.task.take().expect("worker already awaited");
        timeout(WAIT, task)
            .await
            .expect("connection did not close")
            .expect("worker panicked");
    }

    /// Drops the inbound side, as if the peer hung up.
    pub async fn disconnect(mut self) {
        let (closed, _) = mpsc::unbounded_channel();
        self.frames = closed;
        self.wait_closed().await;
    }
}
