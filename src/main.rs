use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use snaplink::handshake::SessionStatus;
use snaplink::session::{ConnectionSession, SessionEvent};
use snaplink::store::{self, ArtifactStore, Captioner, FsArtifactStore, StaticCaptioner};
use snaplink::Artifact;

#[derive(Parser)]
#[command(name = "snaplink")]
#[command(about = "Direct peer-to-peer media transfer over a pasted code")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a media file to a peer
    Send {
        /// Path to the media file
        path: PathBuf,

        /// Media type (default: guessed from the file extension)
        #[arg(long)]
        mime: Option<String>,

        /// Display name shown to the receiver
        #[arg(long, default_value = "anonymous")]
        sender: String,

        /// Caption attached to the artifact
        #[arg(long)]
        caption: Option<String>,
    },

    /// Receive media from a peer
    Receive {
        /// Directory to save received artifacts into (default: current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Send {
            path,
            mime,
            sender,
            caption,
        } => send(path, mime, sender, caption).await,
        Commands::Receive { output } => receive(output).await,
    }
}

async fn send(
    path: PathBuf,
    mime: Option<String>,
    sender: String,
    caption: Option<String>,
) -> Result<()> {
    if !path.is_file() {
        anyhow::bail!("Path is not a file: {}", path.display());
    }
    let mime = mime.unwrap_or_else(|| store::mime_for_path(&path).to_string());
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let artifact = Artifact::new(Bytes::from(bytes), &mime, &sender, caption);

    let (mut session, mut events) = ConnectionSession::new().await?;

    let offer = session.create_offer().await?;
    println!("Share this offer code with the receiver:\n\n{offer}\n");

    let answer = prompt("Enter answer code: ")?;
    session.accept_answer(&answer).await?;

    eprintln!("Waiting for the data channel to open...");
    wait_for_status(&mut events, SessionStatus::Connected)
        .await
        .context("Connection did not come up")?;

    eprintln!(
        "Connected. Sending {} ({} bytes)...",
        path.display(),
        artifact.meta.size
    );
    session.send(&artifact).await;

    // Let the channel's outbound buffer empty before tearing the
    // connection down.
    session.flush().await;
    session.close().await;
    eprintln!("Done.");
    Ok(())
}

async fn receive(output: Option<PathBuf>) -> Result<()> {
    let output = output.unwrap_or_else(|| PathBuf::from("."));
    let store = FsArtifactStore::new(&output);
    let captioner = StaticCaptioner;

    let (mut session, mut events) = ConnectionSession::new().await?;

    let offer = prompt("Enter offer code: ")?;
    let answer = session.create_answer(&offer).await?;
    println!("Share this answer code with the sender:\n\n{answer}\n");

    eprintln!("Waiting for the sender to connect... (Ctrl-C to stop)");
    loop {
        let Some(event) = events.recv().await else {
            break;
        };
        match event {
            SessionEvent::Status(SessionStatus::Connected) => {
                eprintln!("Connected.");
            }
            SessionEvent::Status(SessionStatus::Disconnected) => {
                eprintln!("Peer disconnected.");
                break;
            }
            SessionEvent::Status(SessionStatus::Error) => {
                eprintln!("Connection failed.");
                break;
            }
            SessionEvent::Status(_) => {}
            SessionEvent::Progress {
                id,
                received_chunks,
                total_chunks,
            } => {
                eprintln!("Receiving {id}: chunk {received_chunks}/{total_chunks}");
            }
            SessionEvent::ArtifactReceived(mut artifact) => {
                if artifact.meta.caption.is_none() {
                    let caption = captioner
                        .caption(&artifact.bytes, &artifact.meta.mime_type)
                        .await;
                    artifact.meta.caption = Some(caption);
                }
                store.save(&artifact).await?;
                println!(
                    "Received {} from {} ({} bytes)",
                    artifact.meta.id, artifact.meta.sender, artifact.meta.size
                );
            }
            SessionEvent::CaptionUpdate { id, text } => {
                println!("Caption for {id} updated: {text}");
            }
        }
    }

    session.close().await;
    Ok(())
}

fn prompt(message: &str) -> Result<String> {
    print!("{message}");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

async fn wait_for_status(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    wanted: SessionStatus,
) -> Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Status(status) if status == wanted => return Ok(()),
            SessionEvent::Status(SessionStatus::Error) => {
                anyhow::bail!("connection failed during handshake")
            }
            _ => {}
        }
    }
    anyhow::bail!("event stream closed before the connection came up")
}
