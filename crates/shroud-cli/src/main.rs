//! SHROUD CLI
//!
//! Secure chunked peer-to-peer file transfer over TCP.

mod config;
mod progress;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::{Term, style};
use shroud_core::{Connection, FilePayload, TransferEvent, TransferId, TransferOutcome};
use shroud_transport::TcpChannel;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use config::Config;
use progress::{ProgressDisplay, format_bytes, format_duration};

/// SHROUD - encrypted, chunked, direct file transfer
#[derive(Parser)]
#[command(name = "shroud")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file to a listening peer
    Send {
        /// File to send
        #[arg(required = true)]
        file: PathBuf,

        /// Peer address (host:port)
        #[arg(required = true)]
        peer: String,

        /// Skip the key exchange and send the key with the request
        #[arg(long)]
        insecure: bool,

        /// Override the guessed MIME type
        #[arg(long)]
        mime: Option<String>,
    },

    /// Listen for incoming transfers
    Receive {
        /// Listen address
        #[arg(short, long)]
        bind: Option<String>,

        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Accept every offer without prompting
        #[arg(short, long)]
        yes: bool,
    },

    /// Print the effective configuration
    Config {
        /// Save it to the configuration file
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    config.validate()?;

    match cli.command {
        Commands::Send {
            file,
            peer,
            insecure,
            mime,
        } => send_file(file, peer, insecure, mime, &config).await,
        Commands::Receive { bind, output, yes } => {
            let bind = bind.unwrap_or_else(|| config.network.listen_addr.clone());
            let output = output.unwrap_or_else(|| config.transfer.output_dir.clone());
            receive_files(bind, output, yes || config.transfer.auto_accept, &config).await
        }
        Commands::Config { write } => show_config(&config, &config_path, write),
    }
}

/// Send one file and wait for the outcome
async fn send_file(
    file: PathBuf,
    peer: String,
    insecure: bool,
    mime: Option<String>,
    config: &Config,
) -> anyhow::Result<()> {
    let mut payload = FilePayload::from_path(&file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    if let Some(mime) = mime {
        payload.mime_type = mime;
    }
    let secure = config.transfer.secure && !insecure;

    println!("File: {} ({})", file.display(), format_bytes(payload.size() as u64));
    println!("Type: {}", payload.mime_type);
    println!("Peer: {}", peer);

    let (channel, inbound) = TcpChannel::connect(peer.as_str()).await?;
    let (connection, events) = Connection::new(channel, config.engine_config())?;
    let reader = connection.spawn(inbound);

    let started = Instant::now();
    let label = payload.name.clone();
    let id = connection.transfers().offer_with(payload, secure).await?;
    let offer_size = connection.transfers().progress(id).await?.bytes_total;

    let display = ProgressDisplay::new(offer_size, &label);
    let printer = tokio::spawn(render_outbound(events, id, display));

    println!("{}", style("Waiting for the peer to accept...").dim());
    let result = connection.transfers().run_outbound(id).await;

    if matches!(result, Ok(TransferOutcome::Completed)) {
        wait_for_acks(&connection, id).await;
    }

    connection.close().await;
    reader.await?;
    printer.abort();

    match result? {
        TransferOutcome::Completed => println!(
            "{} {} in {}",
            style("Sent").green().bold(),
            label,
            format_duration(started.elapsed())
        ),
        TransferOutcome::Rejected => println!("{} by peer", style("Rejected").yellow().bold()),
        TransferOutcome::Cancelled => println!("{}", style("Cancelled").yellow().bold()),
    }
    Ok(())
}

/// Let trailing acks arrive so the receiver is not cut off mid-write.
async fn wait_for_acks(connection: &Connection, id: TransferId) {
    while connection.is_open() && connection.transfers().in_flight(id).unwrap_or(0) > 0 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn render_outbound(
    mut events: mpsc::UnboundedReceiver<TransferEvent>,
    id: TransferId,
    display: ProgressDisplay,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::Accepted(t) if t == id => tracing::info!("Peer accepted {}", id),
            TransferEvent::Progress(p) if p.transfer_id == id => display.update(&p),
            TransferEvent::Completed(t) if t == id => {
                display.finish_with_message("All chunks sent".to_string());
            }
            TransferEvent::Errored { transfer_id, reason } if transfer_id == id => {
                display.abandon_with_message(format!("Failed: {reason}"));
            }
            TransferEvent::Cancelled(t) if t == id => {
                display.abandon_with_message("Cancelled".to_string());
            }
            _ => {}
        }
    }
}

/// Accept connections until interrupted
async fn receive_files(
    bind: String,
    output: PathBuf,
    auto_accept: bool,
    config: &Config,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;

    println!("Listening on: {}", listener.local_addr()?);
    println!("Output directory: {}", output.display());
    println!("Press Ctrl+C to stop");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                tracing::info!("Connection from {}", addr);

                let engine = config.engine_config();
                let output = output.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_peer(stream, engine, output, auto_accept).await {
                        tracing::error!("Session with {} failed: {:#}", addr, e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                return Ok(());
            }
        }
    }
}

async fn serve_peer(
    stream: tokio::net::TcpStream,
    engine: shroud_core::TransferConfig,
    output: PathBuf,
    auto_accept: bool,
) -> anyhow::Result<()> {
    let (channel, mut inbound) = TcpChannel::from_stream(stream)?;
    let (connection, mut events) = Connection::new(channel, engine)?;
    let mut bars: HashMap<TransferId, ProgressDisplay> = HashMap::new();

    // Frames and transfer events share this task so that a finished
    // transfer is opened before the session keys are torn down.
    let result = loop {
        tokio::select! {
            biased;
            Some(event) = events.recv() => {
                if let Err(e) = handle_event(&connection, event, &output, auto_accept, &mut bars).await {
                    break Err(e);
                }
            }
            frame = inbound.recv() => {
                let open = match frame {
                    Some(frame) => connection.process(frame).await,
                    None => false,
                };
                if !open {
                    let mut drained = Ok(());
                    while let Ok(event) = events.try_recv() {
                        drained = handle_event(&connection, event, &output, auto_accept, &mut bars).await;
                        if drained.is_err() {
                            break;
                        }
                    }
                    break drained;
                }
            }
        }
    };

    connection.close().await;
    for (_, bar) in bars.drain() {
        bar.abandon_with_message("Connection closed".to_string());
    }
    result
}

async fn handle_event(
    connection: &Connection,
    event: TransferEvent,
    output: &Path,
    auto_accept: bool,
    bars: &mut HashMap<TransferId, ProgressDisplay>,
) -> anyhow::Result<()> {
    let transfers = connection.transfers();

    match event {
        TransferEvent::IncomingRequest {
            transfer_id,
            name,
            size,
            mime_type,
            secure,
        } => {
            let mode = if secure { "session key" } else { "literal key" };
            println!(
                "Incoming: {} ({}, {}, {})",
                style(&name).bold(),
                format_bytes(size),
                mime_type,
                mode
            );

            if auto_accept || confirm(&name).await {
                transfers.accept(transfer_id).await?;
                bars.insert(transfer_id, ProgressDisplay::new(size, &name));
            } else {
                transfers.reject(transfer_id).await?;
                println!("{} {}", style("Rejected").yellow(), name);
            }
        }
        TransferEvent::Progress(progress) => {
            if let Some(bar) = bars.get(&progress.transfer_id) {
                bar.update(&progress);
            }
        }
        TransferEvent::Received(id) => {
            let payload = transfers.open(id).await?;
            let path = payload.write_into(output).await?;
            if let Some(bar) = bars.remove(&id) {
                bar.finish_with_message(format!("Saved {}", path.display()));
            }
            println!("{} {}", style("Received").green().bold(), path.display());
            transfers.remove(id).await?;
        }
        TransferEvent::Cancelled(id) => {
            if let Some(bar) = bars.remove(&id) {
                bar.abandon_with_message("Cancelled by peer".to_string());
            }
        }
        TransferEvent::Errored { transfer_id, reason } => {
            if let Some(bar) = bars.remove(&transfer_id) {
                bar.abandon_with_message(format!("Failed: {reason}"));
            }
        }
        TransferEvent::Accepted(_) | TransferEvent::Rejected(_) | TransferEvent::Completed(_) => {}
    }
    Ok(())
}

/// Ask on the terminal; anything but y/yes declines.
async fn confirm(name: &str) -> bool {
    let prompt = format!("Accept {name}? [y/N] ");
    let answer = tokio::task::spawn_blocking(move || {
        let term = Term::stdout();
        term.write_str(&prompt)?;
        term.read_line()
    })
    .await;

    match answer {
        Ok(Ok(line)) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
        Ok(Err(e)) => {
            tracing::warn!("Could not read answer: {}", e);
            false
        }
        Err(e) => {
            tracing::warn!("Prompt task failed: {}", e);
            false
        }
    }
}

/// Print (and optionally save) the configuration
fn show_config(config: &Config, path: &Path, write: bool) -> anyhow::Result<()> {
    println!("# {}", path.display());
    println!("{}", toml::to_string_pretty(config)?);

    if write {
        config.save(path)?;
        println!("{} {}", style("Wrote").green(), path.display());
    }
    Ok(())
}
