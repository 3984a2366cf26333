use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use roomsync::config::{DataDir, FileConfig, load_config};
use roomsync::{
    ExistenceCheck, HttpExistenceCheck, JsonFileStore, RoomType, SessionCode, SessionSignal,
    SyncClient, SyncConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "roomsync")]
#[command(about = "Host or join a live widget session on a roomsync relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.roomsync)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Relay WebSocket URL (overrides config.toml)
    #[arg(long, global = true)]
    ws_url: Option<String>,

    /// Relay HTTP base URL (overrides config.toml)
    #[arg(long, global = true)]
    http_url: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create (or resume) a session and start rooms for it
    Host(HostArgs),

    /// Join a session as a participant and follow its rooms
    Join(JoinArgs),

    /// Ask the relay whether a session code is still live
    Exists(ExistsArgs),
}

#[derive(Parser)]
struct HostArgs {
    /// Room to start, as `type:widgetId` (e.g. `poll:w1`). Repeatable.
    #[arg(short, long = "room")]
    rooms: Vec<String>,

    /// Keep the session open on the relay when exiting
    #[arg(long)]
    keep: bool,
}

#[derive(Parser)]
struct JoinArgs {
    /// Session code
    code: String,

    /// Display name shown to the presenter
    #[arg(short, long)]
    name: Option<String>,
}

#[derive(Parser)]
struct ExistsArgs {
    /// Session code
    code: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let data_dir = DataDir::new(cli.data_dir.clone()).context("Failed to prepare data directory")?;
    let file_config: FileConfig = load_config(&data_dir.path).extract().with_context(|| {
        format!(
            "Invalid configuration in {}",
            data_dir.config_toml_path().display()
        )
    })?;
    let mut config = SyncConfig::from_file(&file_config);
    if let Some(ws_url) = cli.ws_url {
        config.ws_url = ws_url;
    }
    if let Some(http_url) = cli.http_url {
        config.http_url = http_url;
    }

    match cli.command {
        Commands::Host(args) => host_command(config, &data_dir, args).await,
        Commands::Join(args) => join_command(config, &data_dir, args).await,
        Commands::Exists(args) => exists_command(&config, &args.code).await,
    }
}

fn init_logging(debug: bool) {
    let default_directive = if debug {
        "roomsync=debug,info"
    } else {
        "roomsync=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

/// Parse `type:widgetId`.
fn parse_room(spec: &str) -> Result<(RoomType, String)> {
    let Some((room_type, widget_id)) = spec.split_once(':') else {
        bail!("Room must be given as type:widgetId, got {spec:?}");
    };
    if room_type.is_empty() || widget_id.is_empty() {
        bail!("Room must be given as type:widgetId, got {spec:?}");
    }
    Ok((RoomType::from(room_type.to_string()), widget_id.to_string()))
}

fn build_client(config: SyncConfig, data_dir: &DataDir) -> SyncClient {
    SyncClient::builder(config)
        .store(Arc::new(JsonFileStore::new(data_dir.session_path())))
        .build()
}

async fn wait_connected(client: &SyncClient) -> Result<()> {
    let mut status = client.link_status();
    tokio::time::timeout(CONNECT_TIMEOUT, status.wait_for(|s| s.connected))
        .await
        .with_context(|| format!("Relay not reachable at {}", client.config().ws_url))?
        .context("Sync client stopped")?;
    Ok(())
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!("Failed to encode output: {}", e),
    }
}

async fn host_command(config: SyncConfig, data_dir: &DataDir, args: HostArgs) -> Result<()> {
    let rooms = args
        .rooms
        .iter()
        .map(|spec| parse_room(spec))
        .collect::<Result<Vec<_>>>()?;

    let client = build_client(config, data_dir);
    let mut signals = client.signals();
    wait_connected(&client).await?;

    let code = client
        .create_session()
        .await
        .context("Failed to create session")?;
    println!("Session code: {code}");

    let widgets: Vec<_> = rooms
        .into_iter()
        .map(|(room_type, widget_id)| client.widget(room_type, widget_id))
        .collect();
    for widget in &widgets {
        widget.mount();
        match widget.start().await {
            Ok(()) => info!(widget_id = widget.widget_id(), "room started"),
            Err(e) => warn!(widget_id = widget.widget_id(), "Failed to start room: {}", e),
        }
    }

    follow(&client, &mut signals).await;

    if args.keep {
        info!(code = %code, "leaving session open");
    } else {
        client.close_session();
        // Give the close frame a moment to flush.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    client.shutdown();
    Ok(())
}

async fn join_command(config: SyncConfig, data_dir: &DataDir, args: JoinArgs) -> Result<()> {
    let name = args.name.unwrap_or_else(|| config.display_name.clone());
    let client = build_client(config, data_dir);
    let mut signals = client.signals();
    wait_connected(&client).await?;

    let handle = client
        .join_session(&args.code, &name)
        .await
        .with_context(|| format!("Failed to join session {}", args.code))?;
    println!("Joined session {} as {name}", handle.code);
    print_json(&client.rooms());

    follow(&client, &mut signals).await;
    client.shutdown();
    Ok(())
}

async fn exists_command(config: &SyncConfig, code: &str) -> Result<()> {
    let code = SessionCode::parse(code)?;
    let check = HttpExistenceCheck::new(config.http_url.clone());
    let exists = check
        .exists(&code)
        .await
        .with_context(|| format!("Failed to query {}", check.url_for(&code)))?;
    println!("{}", if exists { "exists" } else { "not found" });
    if !exists {
        std::process::exit(1);
    }
    Ok(())
}

/// Print room and session changes until Ctrl-C or the session ends.
async fn follow(client: &SyncClient, signals: &mut broadcast::Receiver<SessionSignal>) {
    let mut rooms = client.watch_rooms();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            changed = rooms.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = rooms.borrow_and_update().clone();
                print_json(&snapshot);
            }
            signal = signals.recv() => match signal {
                Ok(signal) => {
                    print_json(&signal);
                    if matches!(signal, SessionSignal::Lost { .. } | SessionSignal::Closed { .. }) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} session signals", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
