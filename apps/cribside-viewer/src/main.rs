use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cribside_signaling::psk::FileImportChannel;
use cribside_signaling::{
    KeyDecision, KeyStore, SessionConfigBuilder, SignalingSession,
};
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "cribside-viewer")]
struct Cli {
    /// Signaling relay endpoint, e.g. wss://relay.example.com/ws
    #[arg(long, env = "CRIBSIDE_ENDPOINT")]
    endpoint: String,

    /// Room to watch; defaults to the last room used, then "Baby"
    #[arg(long, short = 'r', env = "CRIBSIDE_ROOM")]
    room: Option<String>,

    /// One-time pairing file holding a room=…&token=… fragment;
    /// deleted after a successful import
    #[arg(long)]
    pair_file: Option<PathBuf>,

    /// Print the pairing fragment for the resolved room and exit
    #[arg(long)]
    share: bool,

    /// Key store path, for running several viewers side by side
    #[arg(long, env = "CRIBSIDE_KEY_STORE")]
    key_store: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut store = match &cli.key_store {
        Some(path) => KeyStore::open_at(path.clone()),
        None => KeyStore::open(),
    }
    .context("opening key store")?;

    if let Some(path) = &cli.pair_file {
        let mut channel = FileImportChannel::new(path.clone());
        match store.import(&mut channel, "Baby") {
            Ok(Some(room)) => info!(room = %room, "pairing token imported"),
            Ok(None) => warn!(path = %path.display(), "pairing file held no token"),
            Err(err) => anyhow::bail!("pairing import failed: {err}"),
        }
    }

    let key = match store.require_key("viewer", cli.room.as_deref(), "Baby")? {
        KeyDecision::Ready { key } => key,
        KeyDecision::NeedsPairing { room, .. } => {
            eprintln!("No key for room {room:?}.");
            eprintln!("Run `--share` on the camera host and pass the fragment via `--pair-file`.");
            std::process::exit(2);
        }
    };
    let room = key.room().to_string();

    if cli.share {
        match store.share_fragment(&room) {
            Some(fragment) => println!("{fragment}"),
            None => anyhow::bail!("no key stored for room {room:?}"),
        }
        return Ok(());
    }

    let config = SessionConfigBuilder::new(cli.endpoint, room.clone()).build();
    let session = SignalingSession::builder(config)
        .key(Arc::new(key))
        .build();
    info!(target: "viewer", session = session.session_id(), room = %room, "watching");

    session
        .callbacks()
        .status
        .subscribe(|status: &String| info!(target: "viewer", "{status}"));
    session
        .callbacks()
        .ice_state
        .subscribe(|state| info!(target: "viewer", ice = %state, "ice state changed"));
    session.callbacks().track.subscribe(|event| {
        info!(
            target: "viewer",
            kind = %event.track.kind(),
            id = %event.track.id(),
            "remote track"
        );
    });
    session
        .callbacks()
        .bye
        .subscribe(|_| info!(target: "viewer", "camera said goodbye"));

    if let Err(err) = session.start().await {
        // The session keeps retrying with backoff on its own.
        warn!(error = %err, "initial connect failed; retrying in the background");
    }

    tokio::signal::ctrl_c().await?;
    info!(target: "viewer", "shutting down");
    session.close().await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
