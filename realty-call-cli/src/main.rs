//! Realty Call CLI Application

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;
use rand::Rng;
use realty_call_core::prelude::*;
use realty_call_core::relay::RelayEndpoint;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use terminal_ui::TerminalUI;
use tokio::sync::broadcast;

mod terminal_ui;

/// Seconds to wait for ICE to connect in the demo
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Local user id (random guest id if omitted)
    #[arg(short, long, env = "REALTY_CALL_USER")]
    user: Option<String>,

    /// JSON configuration file
    #[arg(short, long, env = "REALTY_CALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a call to a second local user over the in-memory relay
    Demo {
        /// User id of the auto-answering peer
        #[arg(long, default_value = "client-42")]
        peer: String,

        /// Call kind
        #[arg(long, value_enum, default_value = "video")]
        kind: CliCallKind,

        /// Connected seconds before hanging up (ignored with --ui)
        #[arg(long, default_value = "5")]
        seconds: u64,

        /// Show the terminal call screen
        #[arg(long)]
        ui: bool,
    },

    /// Show configuration and available commands
    Status,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliCallKind {
    Audio,
    Video,
}

impl From<CliCallKind> for CallKind {
    fn from(kind: CliCallKind) -> Self {
        match kind {
            CliCallKind::Audio => CallKind::Audio,
            CliCallKind::Video => CallKind::Video,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realty_call=info,realty_call_core=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().or_else(default_config_path);
    let config = load_config(cli.config.as_deref(), config_path.as_deref())?;

    let user = cli.user.unwrap_or_else(generate_random_identity);
    println!("🔗 Using identity: {user}");

    match cli.command {
        Commands::Demo {
            peer,
            kind,
            seconds,
            ui,
        } => handle_demo(config, &user, &peer, kind.into(), seconds, ui).await?,
        Commands::Status => handle_status(&config, config_path.as_deref())?,
    }

    Ok(())
}

/// Platform config file location, e.g. `~/.config/realty-call/config.json`
fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "realty", "realty-call").map(|dirs| dirs.config_dir().join("config.json"))
}

/// Load the service configuration
///
/// An explicitly requested file must exist; the platform default is optional.
fn load_config(explicit: Option<&Path>, resolved: Option<&Path>) -> Result<ServiceConfig> {
    let Some(path) = resolved else {
        return Ok(ServiceConfig::default());
    };
    if explicit.is_none() && !path.exists() {
        tracing::debug!(path = %path.display(), "No config file, using defaults");
        return Ok(ServiceConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config = serde_json::from_str(&text)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    tracing::info!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

fn build_service(
    relay: &MemoryRelay,
    config: &ServiceConfig,
    profile: PeerProfile,
) -> Result<Arc<CallService<RelayEndpoint>>> {
    let mut config = config.clone();
    // Both users share this host
    config.rtc.include_loopback_candidates = true;
    let endpoint = Arc::new(relay.endpoint(profile.id.clone()));
    config.call.local = profile;
    let service = CallService::builder(endpoint).with_config(config).build()?;
    service.start()?;
    Ok(Arc::new(service))
}

async fn handle_demo(
    config: ServiceConfig,
    user: &str,
    peer: &str,
    kind: CallKind,
    seconds: u64,
    ui: bool,
) -> Result<()> {
    let relay = MemoryRelay::new();
    let caller = build_service(&relay, &config, PeerProfile::new(user, user))?;
    let callee = build_service(&relay, &config, PeerProfile::new(peer, peer))?;
    println!("✅ Call services started for {user} and {peer}");

    let answering = tokio::spawn(auto_answer(callee.clone(), callee.subscribe_events()));

    let mut events = caller.subscribe_events();
    println!("📞 Calling {peer} ({kind})...");
    let call_id = caller
        .initiate_call(PeerProfile::new(peer, peer), kind)
        .await?;
    println!("📞 Call initiated with ID: {call_id}");

    tokio::time::timeout(CONNECT_TIMEOUT, wait_for_connected(&mut events))
        .await
        .context("timed out waiting for the connection")??;
    println!("✅ Connected");

    if ui {
        let mut ui = TerminalUI::new()?;
        ui.run(caller.as_ref()).await?;
    } else {
        let hang_up_at = tokio::time::Instant::now() + Duration::from_secs(seconds);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(hang_up_at) => break,
                event = events.recv() => match event {
                    Ok(ServiceEvent::Call(CallEvent::DurationChanged { seconds, .. })) => {
                        println!("⏱  {}", terminal_ui::format_duration(seconds));
                    }
                    Ok(ServiceEvent::Call(CallEvent::CallEnded { reason, .. })) => {
                        println!("📴 Call ended by peer: {reason:?}");
                        break;
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    caller.shutdown().await;
    callee.shutdown().await;
    answering.abort();
    println!("📞 Call ended");
    Ok(())
}

/// Accept every invitation the callee receives
async fn auto_answer(
    service: Arc<CallService<RelayEndpoint>>,
    mut events: broadcast::Receiver<ServiceEvent>,
) {
    loop {
        match events.recv().await {
            Ok(ServiceEvent::Call(CallEvent::IncomingCall { invitation, .. })) => {
                println!(
                    "📞 Incoming {} call from {}",
                    invitation.call_kind, invitation.caller_name
                );
                if let Err(e) = service.accept_call().await {
                    tracing::warn!(error = %e, "Auto-answer failed");
                }
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn wait_for_connected(events: &mut broadcast::Receiver<ServiceEvent>) -> Result<()> {
    loop {
        match events.recv().await {
            Ok(ServiceEvent::Call(CallEvent::StatusChanged {
                status: CallStatus::Connected,
                ..
            })) => return Ok(()),
            Ok(ServiceEvent::Call(CallEvent::CallFailed { error, .. })) => {
                bail!("call failed: {error}")
            }
            Ok(ServiceEvent::Call(CallEvent::CallEnded { reason, .. })) => {
                bail!("call ended before connecting: {reason:?}")
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => bail!("event stream closed"),
        }
    }
}

fn handle_status(config: &ServiceConfig, config_path: Option<&Path>) -> Result<()> {
    println!("📊 Realty Call CLI Status");
    println!("========================");
    match config_path {
        Some(path) if path.exists() => println!("Config file: {}", path.display()),
        Some(path) => println!("Config file: {} (not present, using defaults)", path.display()),
        None => println!("Config file: none (using defaults)"),
    }
    println!("Local profile: {}", config.call.local);
    println!("STUN servers: {}", config.rtc.ice_servers.join(", "));
    println!();
    println!("Effective configuration:");
    println!("{}", serde_json::to_string_pretty(config)?);
    println!();
    println!("Available commands:");
    println!("  realty-call demo [options]  - Loopback call between two local users");
    println!("  realty-call status          - Show this status");
    println!();
    println!("Use 'realty-call --help' for detailed options");

    Ok(())
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "maple", "cedar", "harbor", "summit", "meadow", "willow", "granite", "lakeside", "orchard",
        "prairie", "ridge", "birch", "canyon", "juniper", "aspen", "bayview",
    ];

    let mut rng = rand::thread_rng();
    let word = WORDS[rng.gen_range(0..WORDS.len())];
    format!("guest-{word}-{}", rng.gen_range(1000..10000))
}
