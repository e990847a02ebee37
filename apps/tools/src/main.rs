use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use relay::{
    auth::{self, SignupRequest},
    projector, resolver, RelayContext, RelaySettings,
};
use shared::domain::ChatTarget;
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/server.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUser {
        username: String,
        password: String,
        first_name: String,
        #[arg(default_value = "")]
        last_name: String,
    },
    CreateGroup {
        creator: String,
        title: String,
        members: Vec<String>,
    },
    /// Prints a user's chat list, most recent first.
    Chats { username: String },
    /// Prints the latest messages between `username` and a peer or group id.
    History {
        username: String,
        target: String,
        #[arg(long, default_value_t = relay::DEFAULT_HISTORY_LIMIT)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;
    let ctx = RelayContext::new(storage, RelaySettings::default());

    match cli.command {
        Command::CreateUser {
            username,
            password,
            first_name,
            last_name,
        } => {
            let user_id = auth::signup(
                &ctx,
                SignupRequest {
                    username,
                    password,
                    first_name,
                    last_name,
                },
            )
            .await?;
            println!("created user_id={user_id}");
        }
        Command::CreateGroup {
            creator,
            title,
            members,
        } => {
            let creator_id = resolver::find_peer(&ctx, &creator).await?.user_id;
            let group = resolver::create_group(&ctx, creator_id, &creator, &title, &members).await?;
            println!(
                "created chat_id={} members={}",
                group.chat_id,
                group.members.len()
            );
        }
        Command::Chats { username } => {
            let user = resolver::find_peer(&ctx, &username).await?;
            for chat in projector::project(&ctx, user.user_id).await? {
                let kind = if chat.is_group { "group" } else { "private" };
                println!(
                    "{}\t{kind}\t{}\t{}\t{}",
                    chat.chat_id, chat.display_name, chat.last_ts, chat.last_msg
                );
            }
        }
        Command::History {
            username,
            target,
            limit,
        } => {
            let user = resolver::find_peer(&ctx, &username).await?;
            let chat_id = match ChatTarget::parse(&target) {
                Some(ChatTarget::Group(chat_id)) => {
                    resolver::resolve_group(&ctx, chat_id, user.user_id).await?
                }
                Some(ChatTarget::Peer(peer)) => {
                    let peer = resolver::find_peer(&ctx, &peer).await?;
                    ctx.store
                        .find_private_chat(user.user_id, peer.user_id)
                        .await?
                        .ok_or_else(|| anyhow!("no chat between {username} and {}", peer.username))?
                }
                None => bail!("target must be a username or group id"),
            };

            let mut messages = ctx.store.recent_messages(chat_id, limit).await?;
            messages.reverse();
            for message in messages {
                println!(
                    "{}\t{}\t{}",
                    message.sent_at.to_rfc3339(),
                    message.sender_username,
                    message.content
                );
            }
        }
    }

    Ok(())
}
