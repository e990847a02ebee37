use futures::{Stream, StreamExt};
use shared::{
    domain::ChatTarget,
    error::ApiError,
    protocol::{ChatPreview, ClientFrame, ServerEvent},
};
use tracing::{debug, info, warn};

use crate::{
    auth::{self, SignupRequest},
    directory, persistence, projector,
    registry::{ConnectionHandle, Session},
    resolver, router, RelayContext,
};

enum ConnectionState {
    Unauthenticated,
    Authenticated(Session),
    Closed,
}

/// Runs one client connection to completion.
///
/// `frames` yields raw text frames as the transport receives them and ends
/// when the peer goes away. Every outbound event goes through `connection`.
/// Returns once the connection reached `Closed`; by then its session, if any,
/// has been removed from the registry.
pub async fn drive<S>(ctx: &RelayContext, connection: ConnectionHandle, mut frames: S)
where
    S: Stream<Item = String> + Unpin,
{
    let mut state = ConnectionState::Unauthenticated;

    loop {
        let raw = tokio::select! {
            biased;
            _ = connection.closed() => None,
            raw = frames.next() => raw,
        };
        let Some(raw) = raw else {
            break;
        };

        state = match state {
            ConnectionState::Unauthenticated => authenticate(ctx, &connection, &raw).await,
            ConnectionState::Authenticated(session) => {
                dispatch(ctx, &session, &raw).await;
                ConnectionState::Authenticated(session)
            }
            ConnectionState::Closed => ConnectionState::Closed,
        };
        if matches!(state, ConnectionState::Closed) {
            break;
        }
    }

    if let Some(session) = ctx.sessions.remove(connection.id()) {
        info!(connection = %connection.id(), username = %session.username, "session ended");
    } else {
        debug!(connection = %connection.id(), "connection closed");
    }
}

fn reply_error(connection: &ConnectionHandle, error: ApiError) {
    connection.send(error.into());
}

/// Handles the first frame. Only `signup` and `signin` are accepted here.
async fn authenticate(ctx: &RelayContext, connection: &ConnectionHandle, raw: &str) -> ConnectionState {
    let frame = match ClientFrame::parse(raw) {
        Ok(frame) => frame,
        Err(error) => {
            debug!(connection = %connection.id(), %error, "malformed first frame");
            return ConnectionState::Closed;
        }
    };

    match frame {
        ClientFrame::Signup {
            from,
            password,
            first_name,
            last_name,
        } => {
            let request = SignupRequest {
                username: from,
                password,
                first_name,
                last_name,
            };
            match auth::signup(ctx, request).await {
                Ok(_) => {
                    connection.send(ServerEvent::SignupOk {
                        content: "signup successful, please sign in".to_string(),
                    });
                }
                Err(error) => reply_error(connection, error),
            }
            ConnectionState::Closed
        }
        ClientFrame::Signin { from, password } => match auth::signin(ctx, &from, &password).await {
            Ok(user) => {
                let session = Session {
                    user_id: user.user_id,
                    username: user.username,
                    display_name: user.display_name,
                    connection: connection.clone(),
                };
                if let Some(previous) = ctx.sessions.register(session.clone()) {
                    debug!(
                        username = %session.username,
                        previous = %previous.connection.id(),
                        "previous session superseded"
                    );
                }
                info!(connection = %connection.id(), username = %session.username, "signed in");

                connection.send(ServerEvent::LoginOk {
                    content: "login successful".to_string(),
                    display_name: session.display_name.clone(),
                });
                projector::push(ctx, connection, session.user_id).await;
                ConnectionState::Authenticated(session)
            }
            Err(error) => {
                reply_error(connection, error);
                ConnectionState::Closed
            }
        },
        _ => {
            debug!(connection = %connection.id(), "first frame was not signup or signin");
            ConnectionState::Closed
        }
    }
}

/// Handles one frame from an authenticated session. Failures are reported to
/// this connection only and never end it.
async fn dispatch(ctx: &RelayContext, session: &Session, raw: &str) {
    let frame = match ClientFrame::parse(raw) {
        Ok(frame) => frame,
        Err(error) => {
            debug!(connection = %session.connection.id(), %error, "skipping malformed frame");
            return;
        }
    };

    let outcome = match frame {
        ClientFrame::Message {
            to,
            content,
            timestamp,
        } => router::route(ctx, session, &to, &content, timestamp).await,
        ClientFrame::History { to } => send_history(ctx, session, &to).await,
        ClientFrame::UserSearch { query } => search(ctx, session, &query).await,
        ClientFrame::StartChat { to } => start_chat(ctx, session, &to).await,
        ClientFrame::CreateGroup { name, participants } => {
            create_group(ctx, session, &name, &participants).await
        }
        ClientFrame::Signup { .. } | ClientFrame::Signin { .. } => {
            debug!(connection = %session.connection.id(), "ignoring authentication frame on live session");
            Ok(())
        }
        ClientFrame::Unrecognized => Ok(()),
    };

    if let Err(error) = outcome {
        debug!(connection = %session.connection.id(), %error, "operation failed");
        reply_error(&session.connection, error);
    }
}

async fn send_history(ctx: &RelayContext, session: &Session, to: &str) -> Result<(), ApiError> {
    for frame in router::history(ctx, session, to).await? {
        if !session.connection.send(ServerEvent::Message(frame)) {
            break;
        }
    }
    Ok(())
}

async fn search(ctx: &RelayContext, session: &Session, query: &str) -> Result<(), ApiError> {
    if let Some(users) = directory::search_users(ctx, query).await? {
        session
            .connection
            .send(ServerEvent::UserSearchResult { users });
    }
    Ok(())
}

async fn start_chat(ctx: &RelayContext, session: &Session, to: &str) -> Result<(), ApiError> {
    let username = match ChatTarget::parse(to) {
        Some(ChatTarget::Peer(username)) => username,
        Some(ChatTarget::Group(_)) => {
            return Err(ApiError::validation("start_chat expects a username"))
        }
        None => return Err(ApiError::validation("a target is required")),
    };

    let (peer, chat_id) = resolver::resolve_peer(ctx, session.user_id, &username).await?;
    let chat = ctx
        .store
        .chat_preview(session.user_id, chat_id)
        .await
        .map_err(persistence)?
        .unwrap_or_else(|| ChatPreview {
            chat_id,
            peer: peer.username.clone(),
            display_name: peer.display_name.clone(),
            is_group: false,
            last_msg: String::new(),
            last_ts: 0,
        });

    session.connection.send(ServerEvent::ChatCreated { chat });
    projector::push(ctx, &session.connection, session.user_id).await;
    Ok(())
}

async fn create_group(
    ctx: &RelayContext,
    session: &Session,
    name: &str,
    participants: &[String],
) -> Result<(), ApiError> {
    let group = resolver::create_group(
        ctx,
        session.user_id,
        &session.username,
        name,
        participants,
    )
    .await?;

    let chat = match ctx.store.chat_preview(session.user_id, group.chat_id).await {
        Ok(Some(chat)) => chat,
        Ok(None) => group_preview(&group),
        Err(error) => {
            // The group is committed; only the reply is degraded.
            warn!(chat_id = %group.chat_id, error = %format!("{error:#}"), "group preview unavailable");
            group_preview(&group)
        }
    };

    session.connection.send(ServerEvent::GroupCreated { chat });
    projector::push_to_users(ctx, &group.members).await;
    Ok(())
}

fn group_preview(group: &resolver::CreatedGroup) -> ChatPreview {
    ChatPreview {
        chat_id: group.chat_id,
        peer: group.chat_id.to_string(),
        display_name: group.title.clone(),
        is_group: true,
        last_msg: String::new(),
        last_ts: 0,
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
