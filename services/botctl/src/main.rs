//! Thin RPC client for the chat-broker control socket: one subcommand per
//! action, one request per invocation (spec §6's "CLI surface, collaborator,
//! not core").

use std::path::PathBuf;

use cb_protocol::{Action, Request, Response, SubscriptionFrame};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

const DEFAULT_SOCKET_PATH: &str = "/run/chat-broker.sock";

#[derive(Parser)]
#[command(name = "botctl", about = "Control client for the chat-broker daemon")]
struct Cli {
    /// Path to the broker's control socket.
    #[arg(long, env = "CHAT_BROKER_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check that the daemon is alive.
    Ping,
    /// List configured bots.
    Bots,
    /// Send a message through a bot.
    Send {
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        bot: String,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        thread: Option<String>,
        text: String,
    },
    /// Show recent events.
    History(HistoryArgs),
    /// Show recent notifications.
    Notifications(NotificationsArgs),
    /// Clear notifications by filter or by id.
    ClearNotifications {
        #[arg(long)]
        notification_id: Option<i64>,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Clear events by filter.
    ClearHistory {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Stream events as they're published.
    Subscribe {
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        bot: Option<String>,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        thread: Option<String>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        notify_only: bool,
    },
    /// Ask the daemon to reload its config.
    Reload,
}

#[derive(clap::Args)]
struct FilterArgs {
    #[arg(long)]
    service: Option<String>,
    #[arg(long)]
    bot: Option<String>,
    #[arg(long)]
    target: Option<String>,
    #[arg(long)]
    channel: Option<String>,
    #[arg(long)]
    thread: Option<String>,
    #[arg(long)]
    search: Option<String>,
    #[arg(long)]
    all: bool,
}

#[derive(clap::Args)]
struct HistoryArgs {
    #[command(flatten)]
    filter: FilterArgs,
    #[arg(long)]
    since_id: Option<i64>,
    #[arg(long)]
    limit: Option<i64>,
    #[arg(long)]
    notify_only: bool,
}

#[derive(clap::Args)]
struct NotificationsArgs {
    #[command(flatten)]
    filter: FilterArgs,
    #[arg(long)]
    since_id: Option<i64>,
    #[arg(long)]
    limit: Option<i64>,
    #[arg(long)]
    unseen: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let ok = match cli.command {
        Command::Ping => run_single(&cli.socket, Request::ping()).await?,
        Command::Bots => run_single(&cli.socket, Request { action: Action::Bots, ..bare() }).await?,
        Command::Send { service, bot, target, channel, thread, text } => {
            run_single(
                &cli.socket,
                Request { action: Action::Send, service, bot: Some(bot), target, channel, thread, text: Some(text), ..bare() },
            )
            .await?
        }
        Command::History(args) => {
            let mut req = filter_request(Action::History, args.filter);
            req.since_id = args.since_id;
            req.limit = args.limit;
            req.notify = Some(args.notify_only);
            run_single(&cli.socket, req).await?
        }
        Command::Notifications(args) => {
            let mut req = filter_request(Action::Notifications, args.filter);
            req.since_id = args.since_id;
            req.limit = args.limit;
            req.unseen = Some(args.unseen);
            run_single(&cli.socket, req).await?
        }
        Command::ClearNotifications { notification_id, filter } => {
            let mut req = filter_request(Action::ClearNotifications, filter);
            req.notification_id = notification_id;
            run_single(&cli.socket, req).await?
        }
        Command::ClearHistory { filter } => {
            run_single(&cli.socket, filter_request(Action::ClearHistory, filter)).await?
        }
        Command::Subscribe { service, bot, target, channel, thread, search, notify_only } => {
            run_subscribe(
                &cli.socket,
                Request { action: Action::Subscribe, service, bot, target, channel, thread, search, notify: Some(notify_only), ..bare() },
            )
            .await?
        }
        Command::Reload => run_single(&cli.socket, Request { action: Action::Reload, ..bare() }).await?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn bare() -> Request {
    Request::ping() // reuse its all-None field defaults; `action` is overwritten by the caller
}

fn filter_request(action: Action, f: FilterArgs) -> Request {
    Request {
        action,
        service: f.service,
        bot: f.bot,
        target: f.target,
        channel: f.channel,
        thread: f.thread,
        search: f.search,
        all: Some(f.all),
        ..bare()
    }
}

async fn run_single(socket: &PathBuf, request: Request) -> anyhow::Result<bool> {
    let stream = UnixStream::connect(socket).await?;
    let (read_half, mut write_half) = stream.into_split();
    write_line(&mut write_half, &request).await?;

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let response: Response = serde_json::from_str(line.trim())?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if !response.ok {
        if let Some(err) = &response.error {
            eprintln!("error: {err}");
        }
    }
    Ok(response.ok)
}

async fn run_subscribe(socket: &PathBuf, request: Request) -> anyhow::Result<bool> {
    let stream = UnixStream::connect(socket).await?;
    let (read_half, mut write_half) = stream.into_split();
    write_line(&mut write_half, &request).await?;

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    line.clear();
    if reader.read_line(&mut line).await? == 0 {
        eprintln!("error: connection closed before acknowledgement");
        return Ok(false);
    }
    let frame: SubscriptionFrame = serde_json::from_str(line.trim())?;
    if !frame.ok {
        eprintln!("error: {}", frame.error.as_deref().unwrap_or("subscribe rejected"));
        return Ok(false);
    }

    loop {
        line.clear();
        let n = tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(true),
            res = reader.read_line(&mut line) => res?,
        };
        if n == 0 {
            return Ok(true); // daemon closed the stream
        }
        let frame: SubscriptionFrame = serde_json::from_str(line.trim())?;
        if let Some(event) = frame.event {
            println!("{}", serde_json::to_string(&event)?);
        }
    }
}

async fn write_line<T: serde::Serialize>(write_half: &mut tokio::net::unix::OwnedWriteHalf, value: &T) -> anyhow::Result<()> {
    let mut body = serde_json::to_vec(value)?;
    body.push(b'\n');
    write_half.write_all(&body).await?;
    Ok(())
}
