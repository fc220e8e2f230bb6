use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{config::load_settings, ImClient, RosterSyncOutcome};
use shared::domain::{ConversationKey, ConversationType, GroupDescriptor};
use tracing::info;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long)]
    token: String,
    /// Overrides `server_url` from imsync.toml and the environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    SendText {
        #[arg(value_parser = parse_conversation_type)]
        conversation_type: ConversationType,
        target_id: String,
        text: String,
    },
    History {
        #[arg(value_parser = parse_conversation_type)]
        conversation_type: ConversationType,
        target_id: String,
        #[arg(long, default_value_t = 20)]
        count: u32,
        #[arg(long)]
        before: Option<i64>,
        /// Read the local store instead of asking the server.
        #[arg(long)]
        local: bool,
    },
    Conversations {
        #[arg(long)]
        remote: bool,
    },
    /// Each group as `id` or `id=name`.
    SyncGroups { groups: Vec<String> },
    UnreadProbe,
}

fn parse_conversation_type(raw: &str) -> Result<ConversationType, String> {
    if let Ok(value) = raw.parse::<i64>() {
        return ConversationType::try_from(value)
            .map_err(|value| format!("unknown conversation type {value}"));
    }
    let conversation_type = match raw.to_ascii_lowercase().as_str() {
        "private" => ConversationType::Private,
        "discussion" => ConversationType::Discussion,
        "group" => ConversationType::Group,
        "chatroom" | "chat_room" => ConversationType::ChatRoom,
        "customer_service" => ConversationType::CustomerService,
        "system" => ConversationType::System,
        "app_public_service" => ConversationType::AppPublicService,
        "public_service" => ConversationType::PublicService,
        other => return Err(format!("unknown conversation type {other}")),
    };
    Ok(conversation_type)
}

fn parse_group(raw: &str) -> GroupDescriptor {
    match raw.split_once('=') {
        Some((id, name)) => GroupDescriptor::new(id, name),
        None => GroupDescriptor::new(raw, raw),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url;
    }
    if let Some(database_url) = cli.database_url {
        settings.database_url = database_url;
    }
    if settings.app_key.is_empty() {
        bail!("app_key is not configured; set it in imsync.toml or IMSYNC_APP_KEY");
    }

    let client = ImClient::from_settings(&settings)
        .await
        .context("failed to build client")?;

    if let Command::UnreadProbe = cli.command {
        let has_unread = client.has_remote_unread_messages(&cli.token).await?;
        println!("has_unread={has_unread}");
        return Ok(());
    }

    let session = client.connect(&cli.token).await?;
    info!(user_id = %session.user_id, "cli: connected");

    match cli.command {
        Command::SendText {
            conversation_type,
            target_id,
            text,
        } => {
            let message = client
                .send_text(conversation_type, target_id, text)
                .await?;
            println!(
                "sent local_id={:?} server_message_id={:?}",
                message.local_id.map(|id| id.0),
                message.server_message_id
            );
        }
        Command::History {
            conversation_type,
            target_id,
            count,
            before,
            local,
        } => {
            let key = ConversationKey::new(conversation_type, target_id);
            let page = if local {
                client.fetch_local_history(&key, before, count).await?
            } else {
                client.fetch_remote_history(&key, before, count).await?
            };
            for message in &page.messages {
                println!("{}", serde_json::to_string(message)?);
            }
            println!("has_more={}", page.has_more);
        }
        Command::Conversations { remote } => {
            let conversations = if remote {
                client.fetch_remote_conversations(None).await
            } else {
                client.list_conversations(None).await
            };
            for conversation in &conversations {
                println!(
                    "{} top={} unread={} title={}",
                    conversation.key,
                    conversation.is_top,
                    conversation.unread_message_count,
                    conversation.title
                );
            }
        }
        Command::SyncGroups { groups } => {
            let groups: Vec<_> = groups.iter().map(|raw| parse_group(raw)).collect();
            match client.sync_groups(&groups).await? {
                RosterSyncOutcome::Unchanged => println!("roster unchanged"),
                RosterSyncOutcome::Pushed { groups } => println!("pushed {groups} groups"),
            }
        }
        Command::UnreadProbe => {}
    }

    client.disconnect().await;
    Ok(())
}
