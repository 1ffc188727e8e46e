mod config;
mod error;
mod input;
mod transcript;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use routing::Outcome;
use runtime::audio::{AudioPlaybackQueue, CommandOutput, PlaybackEvent};
use runtime::{HttpTransport, Notification, SessionHandle, StreamSession};
use storage::SqliteSnapshotStore;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use wire::ChannelKey;

use config::{Config, TOKEN_VAR, USERNAME_VAR};
use error::Result;
use input::{HELP, Input};
use transcript::Transcript;

const CONFIG_FILE: &str = "parley.toml";

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Terminal client for a parley chat server", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults apply if it does not exist)
    #[arg(short, long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Server URL, overriding the config file
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and chat (the default)
    Chat {
        /// Channel to open, e.g. "#general" or "@leah"
        #[arg(long)]
        channel: Option<String>,
        /// Start with audio muted
        #[arg(long)]
        mute: bool,
    },
    /// Exchange a username and password for a token
    Login {
        username: String,
        /// Read from stdin when omitted
        #[arg(long)]
        password: Option<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_or_default(&cli.config)?;
    config.apply_env(|key| std::env::var(key).ok());
    if let Some(url) = cli.server {
        config.server.url = url;
    }

    match cli.command {
        Some(Commands::Chat { channel, mute }) => cmd_chat(config, channel, mute).await,
        None => cmd_chat(config, None, false).await,
        Some(Commands::Login { username, password }) => {
            cmd_login(&config, &username, password).await
        }
    }
}

async fn cmd_login(config: &Config, username: &str, password: Option<String>) -> Result<()> {
    let password = match password {
        Some(password) => password,
        None => {
            print!("password: ");
            io::stdout().flush()?;
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            line.trim_end_matches(['\r', '\n']).to_string()
        }
    };

    let transport = HttpTransport::builder(&config.server.url).build();
    let credentials = transport.login(username, &password).await?;

    println!("Logged in as {}.", credentials.username);
    println!("Put the token under [credentials] in {CONFIG_FILE}, or export:");
    println!("  {USERNAME_VAR}={}", credentials.username);
    println!("  {TOKEN_VAR}={}", credentials.token);
    Ok(())
}

async fn cmd_chat(config: Config, channel: Option<String>, mute: bool) -> Result<()> {
    println!("parley v{}", env!("CARGO_PKG_VERSION"));

    let credentials = config.credentials();
    if credentials.is_none() {
        warn!("no credentials configured; run `parley login` first");
    }
    let transport = Arc::new(HttpTransport::builder(&config.server.url).build());

    let data_dir = config
        .data_dir
        .clone()
        .or_else(dirs_data_dir)
        .unwrap_or_else(|| ".parley".into());
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("parley.db");
    let store = SqliteSnapshotStore::open(&db_path)?;

    println!("Server: {} ({} mode)", config.server.url, config.server.mode);
    println!("Snapshots stored at: {}", db_path.display());

    let mut builder = StreamSession::builder(transport.clone())
        .policy(config.server.mode)
        .channel(config.server.channel.as_str())
        .reconnect(config.reconnect_policy())
        .store(store);
    if let Some(credentials) = credentials {
        builder = builder.credentials(credentials);
    }
    if config.audio.enabled {
        if let Some(output) = CommandOutput::from_command_line(&config.audio.player) {
            let (audio, _player) = AudioPlaybackQueue::spawn(transport.clone(), output);
            builder = builder.audio(audio);
        }
    }
    let session = builder.spawn()?;

    let printer = tokio::spawn(print_notifications(session.clone(), session.notifications()));

    if let Some(channel) = channel {
        session.set_active_channel(channel).await?;
    }
    if mute {
        session.set_muted(true)?;
    }
    session.ensure_connected()?;
    println!("Type /help for commands, /quit or Ctrl+D to exit.\n");

    let mut lines = spawn_stdin_reader();
    let mut context: Option<String> = None;
    loop {
        let line = tokio::select! {
            line = lines.recv() => line,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        session.ensure_connected()?;
        let Some(input) = Input::parse(&line) else {
            continue;
        };
        match input {
            Input::Send(text) => {
                if let Err(e) = session.submit(text, context.clone()).await {
                    eprintln!("! {e}");
                }
            }
            Input::Channel(key) => session.set_active_channel(key).await?,
            Input::Context(text) => {
                match &text {
                    Some(text) => println!("context set: {text}"),
                    None => println!("context cleared"),
                }
                context = text;
            }
            Input::Mute => session.set_muted(true)?,
            Input::Unmute => session.set_muted(false)?,
            Input::Reset => session.reset_active().await?,
            Input::Unread => {
                let unread = session.unread().await?;
                if unread.is_empty() {
                    println!("no unread messages");
                }
                for (channel, count) in unread {
                    println!("  {channel}: {count}");
                }
            }
            Input::Channels => {
                let active = session.active_context().await?.key().clone();
                for channel in session.channels().await? {
                    let marker = if channel == active { '*' } else { ' ' };
                    println!("{marker} {channel}");
                }
            }
            Input::Note(text) => {
                session.add_channel_context(text)?;
                println!("note sent");
            }
            Input::Reconnect => session.abort_connection()?,
            Input::Help => println!("{HELP}"),
            Input::Quit => break,
            Input::Invalid(message) => eprintln!("{message}"),
        }
    }

    session.shutdown().await?;
    printer.abort();
    println!("\nSession ended.");
    Ok(())
}

/// Read stdin on a plain thread so a pending read never holds up exit.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn print_notifications(session: SessionHandle, mut notifications: broadcast::Receiver<Notification>) {
    let mut transcript = Transcript::new();
    loop {
        let notification = match notifications.recv().await {
            Ok(notification) => notification,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "notifications lagged, redrawing");
                transcript.invalidate();
                if !redraw(&session, &mut transcript, None).await {
                    break;
                }
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let alive = match notification {
            Notification::Routed(Outcome::Unread { channel, count }) => {
                println!("  ({channel}: {count} unread)");
                true
            }
            Notification::Routed(Outcome::HistoryReplaced { channel, .. })
            | Notification::HistoryLoaded { channel, .. }
            | Notification::Reset(channel) => redraw(&session, &mut transcript, Some(&channel)).await,
            Notification::Routed(outcome) if outcome.touched().is_some() => {
                redraw(&session, &mut transcript, None).await
            }
            Notification::ActiveChanged(_) | Notification::SubmissionStarted { .. } => {
                redraw(&session, &mut transcript, None).await
            }
            Notification::ConnectionChanged(state) => {
                info!(%state, "connection");
                true
            }
            Notification::ChannelsChanged(channels) => {
                debug!(count = channels.len(), "channel listing changed");
                true
            }
            Notification::MutedChanged(muted) => {
                println!("audio {}", if muted { "muted" } else { "on" });
                true
            }
            Notification::SubmissionFailed { channel, error, .. } => {
                eprintln!("! {channel}: {error}");
                true
            }
            Notification::SessionInvalid => {
                eprintln!("! credentials rejected. Run `parley login` and restart.");
                true
            }
            Notification::Playback(PlaybackEvent::Failed(clip, error)) => {
                debug!(%clip, %error, "clip skipped");
                true
            }
            _ => true,
        };
        if !alive {
            break;
        }
    }
}

/// Print whatever is new in the active context. `stale` names a channel
/// whose entries were replaced wholesale.
///
/// Returns `false` once the session is gone.
async fn redraw(session: &SessionHandle, transcript: &mut Transcript, stale: Option<&ChannelKey>) -> bool {
    let Ok(context) = session.active_context().await else {
        return false;
    };
    if stale == Some(context.key()) {
        transcript.invalidate();
    }
    print!("{}", transcript.render(&context));
    let _ = io::stdout().flush();
    true
}

fn dirs_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share/parley"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
            .map(|p| p.join("parley"))
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|h| PathBuf::from(h).join("parley"))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        None
    }
}
