//! `exchange` - Campus Exchange messaging from the terminal.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use exchange_client::NativeSession;
use exchange_core::config::{self, Config};
use exchange_core::session::{FileCredentialStore, SessionIdentity, UserId};
use exchange_messaging::{HttpMessageApi, MessageApi, PageRequest, SendMessageRequest};
use exchange_notifications::Navigator;

#[derive(Parser)]
#[command(name = "exchange")]
#[command(author, version, about = "Campus Exchange messaging client", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Stay connected and raise alerts for incoming messages (default)
    Run,
    /// Save an access token issued by the marketplace
    Login {
        #[arg(short, long)]
        token: String,
    },
    /// Forget the saved token
    Logout,
    /// Show the signed-in user and unread total
    Status,
    /// List conversations, most recent first
    Conversations,
    /// Print the history with one partner
    History {
        partner: i64,
        #[arg(short, long, default_value_t = 1)]
        page: u32,
    },
    /// Send a text message
    Send { partner: i64, text: String },
    /// Search your messages
    Search { keyword: String },
    /// Block a user
    Block { user: i64 },
    /// Unblock a user
    Unblock { user: i64 },
    /// List blocked users
    Blocked,
}

/// Alerts have no chat window to open here; the route is printed instead.
struct ConsoleNavigator;

impl Navigator for ConsoleNavigator {
    fn open_chat(&self, partner: UserId) {
        println!("open /chat/{partner}");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::load_config_from(path.clone()),
        None => config::load_config(),
    };
    let config = match config {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = dispatch(cli.command.unwrap_or(Commands::Run), &config).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn credential_store(config: &Config) -> Arc<FileCredentialStore> {
    let path = config
        .session
        .token_path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(config::default_token_path);
    Arc::new(FileCredentialStore::new(path))
}

async fn dispatch(command: Commands, config: &Config) -> Result<()> {
    let credentials = credential_store(config);

    match command {
        Commands::Run => run(config, credentials).await,
        Commands::Login { token } => {
            let identity = SessionIdentity::from_token(token.trim())
                .context("token does not identify a user")?;
            credentials.store(token.trim())?;
            println!("Signed in as user {}", identity.user_id);
            Ok(())
        }
        Commands::Logout => {
            credentials.clear()?;
            println!("Signed out");
            Ok(())
        }
        command => {
            let Some(identity) = SessionIdentity::resolve(credentials.as_ref()) else {
                bail!("not signed in; run `exchange login --token <TOKEN>` first");
            };
            let api = HttpMessageApi::from_config(config, credentials)?;
            query(command, identity, &api).await
        }
    }
}

async fn run(config: &Config, credentials: Arc<FileCredentialStore>) -> Result<()> {
    let mut session = NativeSession::native(config, credentials, Arc::new(ConsoleNavigator))?;
    let Some(identity) = session.start().await else {
        bail!("not signed in; run `exchange login --token <TOKEN>` first");
    };
    let Some(synchronizer) = session.synchronizer().cloned() else {
        bail!("session did not start");
    };

    println!("Connected as user {} (Ctrl+C to quit)", identity.user_id);
    let mut unread = synchronizer.subscribe_unread();
    println!("Unread: {}", *unread.borrow_and_update());

    loop {
        tokio::select! {
            changed = unread.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("Unread: {}", *unread.borrow_and_update());
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("shutting down");
    session.shutdown();
    Ok(())
}

async fn query(command: Commands, identity: SessionIdentity, api: &HttpMessageApi) -> Result<()> {
    match command {
        Commands::Status => {
            let unread = api.unread_count().await?;
            println!("User {}: {unread} unread", identity.user_id);
        }
        Commands::Conversations => {
            for c in api.conversations().await? {
                println!(
                    "{:>8}  {:<20} {:>3}  {}",
                    c.partner_id,
                    c.partner_nickname,
                    c.unread_count,
                    c.last_message.as_deref().unwrap_or("")
                );
            }
        }
        Commands::History { partner, page } => {
            let request = PageRequest {
                page,
                ..PageRequest::history()
            };
            for m in api.conversation_history(UserId(partner), request).await? {
                println!("[{}] {}: {}", m.created_at, m.sender_nickname, m.content);
            }
        }
        Commands::Send { partner, text } => {
            let text = text.trim();
            if text.is_empty() {
                bail!("message is empty");
            }
            let sent = api
                .create_message(&SendMessageRequest::text(UserId(partner), text))
                .await?;
            println!("Sent message {}", sent.id);
        }
        Commands::Search { keyword } => {
            for m in api.search_messages(&keyword, PageRequest::search()).await? {
                println!("{} -> {}: {}", m.sender_nickname, m.receiver_nickname, m.content);
            }
        }
        Commands::Block { user } => {
            api.block_user(UserId(user)).await?;
            println!("Blocked user {user}");
        }
        Commands::Unblock { user } => {
            api.unblock_user(UserId(user)).await?;
            println!("Unblocked user {user}");
        }
        Commands::Blocked => {
            for b in api.blocked_users().await? {
                println!("{:>8}  {}", b.id, b.nickname.as_deref().unwrap_or("-"));
            }
        }
        Commands::Run | Commands::Login { .. } | Commands::Logout => {}
    }
    Ok(())
}
