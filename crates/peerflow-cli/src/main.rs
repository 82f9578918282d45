mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use peerflow_core::{
    ClientConfig, ClientEvent, EntryKind, LocalIdentity, LocalSignaling, Origin, OutgoingFile, PeerClient,
    SignalingClient, SignalingEvent, SignalingTiming,
};
use relay_core::{DeviceClass, PeerStatus, PeerSummary, RelayConfig, RelayHandle, ServerMessage};
use transport_rtc::loopback::LoopbackNetwork;

#[derive(Parser, Debug)]
#[command(name = "peerflow", version, about = "Peerflow signaling relay and peer client")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Directory holding config.json
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the signaling relay
    Relay {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,

        /// Seconds between liveness sweeps
        #[arg(long, default_value_t = 15)]
        sweep_secs: u64,

        /// Evict peers silent for longer than this many seconds
        #[arg(long, default_value_t = 45)]
        timeout_secs: u64,
    },

    /// Write a client configuration
    Init {
        /// Signaling relay websocket URL
        #[arg(long)]
        url: Option<String>,

        /// Display name (a memorable one is generated per run when unset)
        #[arg(long)]
        name: Option<String>,

        /// Device class: mobile, tablet or desktop
        #[arg(long, default_value = "desktop")]
        device: String,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show the client configuration
    Info,

    /// List peers currently registered at the relay
    Peers {
        /// Relay URL, overrides the configured one
        #[arg(long)]
        url: Option<String>,

        /// Seconds to wait for the directory
        #[arg(long, default_value_t = 5)]
        timeout: u64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Exchange a message and a file between two in-process peers
    Demo {
        /// File to send; a generated payload is used when omitted
        #[arg(long)]
        file: Option<PathBuf>,

        /// Text message sent before the file
        #[arg(long, default_value = "hello from peerflow")]
        message: String,

        /// Write the received file into this directory
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".peerflow")
    });
    let config_path = data_dir.join("config.json");

    match cli.cmd {
        Commands::Relay {
            bind,
            sweep_secs,
            timeout_secs,
        } => {
            let config = RelayConfig {
                sweep_interval_secs: sweep_secs,
                peer_timeout_secs: timeout_secs,
            };
            println!("✓ Relay listening on {}", bind);
            println!("  Press Ctrl+C to stop");
            server::run(&bind, config, async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutting down relay");
            })
            .await?;
        }

        Commands::Init {
            url,
            name,
            device,
            force,
        } => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config already exists at {}. Pass --force to overwrite.",
                    config_path.display()
                );
            }

            let mut cfg = ClientConfig::default();
            if let Some(url) = url {
                cfg = cfg.with_signaling_url(url);
            }
            if let Some(name) = name {
                cfg = cfg.with_display_name(name);
            }
            cfg.device_class = DeviceClass::parse_lenient(&device);
            cfg.save(&config_path)?;

            println!("✓ Client initialized");
            print_config(&cfg, &data_dir);
        }

        Commands::Info => {
            if !config_path.exists() {
                anyhow::bail!("Client not initialized. Run 'peerflow init' first.");
            }
            let cfg = ClientConfig::load(&config_path)?;
            println!("Client configuration:");
            print_config(&cfg, &data_dir);
        }

        Commands::Peers { url, timeout, json } => {
            let mut cfg = ClientConfig::load_or_default(&config_path)?;
            if let Some(url) = url {
                cfg = cfg.with_signaling_url(url);
            }
            list_peers(&cfg, Duration::from_secs(timeout), json).await?;
        }

        Commands::Demo { file, message, output } => {
            let cfg = ClientConfig::load_or_default(&config_path)?;
            run_demo(cfg, file.as_deref(), &message, output.as_deref()).await?;
        }
    }

    Ok(())
}

fn print_config(cfg: &ClientConfig, data_dir: &Path) {
    println!("  Signaling URL: {}", cfg.signaling_url);
    println!(
        "  Display name: {}",
        cfg.display_name.as_deref().unwrap_or("(generated per run)")
    );
    println!("  Device class: {:?}", cfg.device_class);
    println!("  Chunk size: {} bytes", cfg.chunk_size);
    println!("  Data directory: {}", data_dir.display());
}

/// Register at the relay, print the directory it hands back, then leave.
async fn list_peers(cfg: &ClientConfig, timeout: Duration, json: bool) -> Result<()> {
    let identity = LocalIdentity::generate(cfg.display_name.clone(), cfg.device_class);
    let local_id = identity.peer_id.clone();
    let (link, mut events) = SignalingClient::spawn(cfg.signaling_url.clone(), identity, SignalingTiming::from(cfg));

    let mut registered = false;
    let mut latest: Option<Vec<PeerSummary>> = None;
    let wait = async {
        while let Some(event) = events.recv().await {
            match event {
                SignalingEvent::Message(ServerMessage::Registered { .. }) => registered = true,
                SignalingEvent::Message(ServerMessage::PeerList { peers }) => {
                    latest = Some(peers);
                    if registered {
                        break;
                    }
                }
                SignalingEvent::Message(ServerMessage::Error { message }) => {
                    tracing::warn!("Relay error: {}", message);
                }
                _ => {}
            }
        }
    };
    let timed_out = tokio::time::timeout(timeout, wait).await.is_err();
    link.shutdown().await;

    let Some(peers) = latest else {
        anyhow::bail!("No peer list from {} within {:?}", cfg.signaling_url, timeout);
    };
    if timed_out {
        tracing::debug!("Using the last directory received before the timeout");
    }
    let peers: Vec<PeerSummary> = peers.into_iter().filter(|p| p.id != local_id).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&peers)?);
    } else {
        println!("Found {} peer(s):", peers.len());
        for peer in peers {
            println!("  {} ({:?}) id={}", peer.name, peer.device_type, peer.id);
        }
    }
    Ok(())
}

/// Two clients on an in-process relay with loopback connections.
async fn run_demo(cfg: ClientConfig, file: Option<&Path>, message: &str, output: Option<&Path>) -> Result<()> {
    let (relay, relay_task) = RelayHandle::spawn(RelayConfig::default());
    let net = LoopbackNetwork::new();

    let spawn = |name: &str| {
        let identity = LocalIdentity::generate(Some(name.to_string()), DeviceClass::Desktop);
        let (link, events) = LocalSignaling::connect(&relay, &identity);
        let factory = Arc::new(net.factory(identity.peer_id.clone()));
        let client = PeerClient::new(identity, cfg.clone(), Arc::new(link), factory);
        client.attach(events);
        client
    };
    let sender = spawn("Sender");
    let receiver = spawn("Receiver");
    let receiver_id = receiver.local_id().to_string();
    let sender_id = sender.local_id().to_string();
    let mut receiver_events = receiver.subscribe();

    wait_for_status(&sender, &receiver_id, PeerStatus::Available).await?;
    println!("✓ {} sees {}", sender.identity().display_name, receiver.identity().display_name);

    sender.connect_to_peer(&receiver_id).await?;
    wait_for_status(&sender, &receiver_id, PeerStatus::Connected).await?;
    println!("✓ Data channel open");

    sender.send_message(&receiver_id, message).await?;
    let text = next_remote_entry(&mut receiver_events, &sender_id, |kind| match kind {
        EntryKind::Message(text) => Some(text.clone()),
        EntryKind::File(_) => None,
    })
    .await?;
    println!("← Message: {}", text);

    let outgoing = match file {
        Some(path) => OutgoingFile::from_path(path).await?,
        None => OutgoingFile::new(
            "demo.bin",
            "application/octet-stream",
            (0..100_000u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>(),
        ),
    };
    println!("→ Sending {} ({} bytes)", outgoing.name, outgoing.data.len());
    let sent = sender.send_file(&receiver_id, outgoing).await?;

    let received = next_remote_entry(&mut receiver_events, &sender_id, |kind| match kind {
        EntryKind::File(record) => Some(record.clone()),
        EntryKind::Message(_) => None,
    })
    .await?;

    println!("✓ File received: {} ({} bytes)", received.name, received.size);
    println!("  sha256: {}", received.digest);
    if received.digest != sent.digest {
        anyhow::bail!("Digest mismatch: sent {}, received {}", sent.digest, received.digest);
    }

    if let Some(dir) = output {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(&received.name);
        tokio::fs::write(&path, &received.data)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        println!("  Written to: {}", path.display());
    }

    sender.disconnect_all();
    drop(sender);
    drop(receiver);
    relay_task.abort();
    Ok(())
}

async fn wait_for_status(client: &PeerClient, remote_id: &str, want: PeerStatus) -> Result<()> {
    let mut peers = client.watch_peers();
    let wait = async {
        loop {
            if peers.borrow().status(remote_id) == Some(want) {
                return Ok::<(), anyhow::Error>(());
            }
            peers.changed().await?;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .with_context(|| format!("timed out waiting for {} to be {:?}", remote_id, want))?
}

async fn next_remote_entry<T, F>(rx: &mut broadcast::Receiver<ClientEvent>, from: &str, pick: F) -> Result<T>
where
    F: Fn(&EntryKind) -> Option<T>,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(ClientEvent::Appended { remote_id, entry })
                    if remote_id == from && entry.origin == Origin::Remote =>
                {
                    if let Some(found) = pick(&entry.kind) {
                        return Ok::<T, anyhow::Error>(found);
                    }
                }
                Ok(ClientEvent::TransferProgress { received, total, .. }) => {
                    tracing::debug!("Transfer progress {}/{}", received, total);
                }
                Ok(ClientEvent::TransferDiscarded { file_id, .. }) => {
                    anyhow::bail!("Transfer {} was discarded", file_id);
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => anyhow::bail!("Client event stream closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(30), wait)
        .await
        .context("timed out waiting for the remote peer")?
}
