//! Zajel CLI tools: key generation, identity checks, peer sessions.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use zajel_common::helpers::{generate_pairing_code, is_valid_pairing_code};
use zajel_common::TransportConfig;
use zajel_crypto::identity::format_safety_number;
use zajel_crypto::{safety_number, KeyPair};
use zajel_transport::{
    Registration, RelayClient, TransferDirection, Transport, TransportEvent, WebRtcFactory,
};

#[derive(Parser, Debug)]
#[command(name = "zajel")]
#[command(about = "Zajel CLI tools")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new X25519 identity keypair
    Keygen {
        /// Output file path (without extension)
        #[arg(short, long, default_value = "zajel")]
        output: String,
    },

    /// Show the peer id and fingerprint of a public key file
    ShowId {
        /// Public key file path
        #[arg(short, long)]
        key: String,
    },

    /// Print the fingerprint of a public key file, for out-of-band comparison
    Fingerprint {
        /// Public key file path
        #[arg(short, long)]
        key: String,
    },

    /// Print the safety number shared by two public keys
    SafetyNumber {
        /// Our public key file
        #[arg(long)]
        ours: String,
        /// The peer's public key file
        #[arg(long)]
        theirs: String,
    },

    /// Connect to a relay and talk to a peer
    Run {
        /// Private key file; a throwaway key is used if omitted
        #[arg(short, long)]
        key: Option<String>,

        /// Relay URL (ws:// or wss://)
        #[arg(long, env = "ZAJEL_SIGNALING_URL")]
        relay: Option<String>,

        /// JSON config file
        #[arg(short, long, env = "ZAJEL_CONFIG")]
        config: Option<PathBuf>,

        /// Pairing code to register with; random if omitted
        #[arg(long)]
        code: Option<String>,

        /// Pairing code of a peer to pair with
        #[arg(long)]
        pair: Option<String>,

        /// Accept incoming pair requests
        #[arg(long)]
        accept: bool,

        /// Text message to send once the session is verified
        #[arg(short, long)]
        message: Option<String>,

        /// File to send once the session is verified
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Directory for received files
        #[arg(long)]
        receive_dir: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    zajel_common::init_tracing();

    let args = Args::parse();

    match args.command {
        Command::Keygen { output } => {
            println!("Generating X25519 keypair...");

            let keypair = KeyPair::generate();
            let private_path = format!("{}.key", output);
            let public_path = format!("{}.pub", output);
            keypair.save(&private_path, &public_path)?;

            println!("Private key: {}", private_path);
            println!("Public key:  {}", public_path);
            println!("Peer ID:     {}", keypair.stable_id());
            println!("Fingerprint: {}", keypair.public_key().fingerprint());
        }
        Command::ShowId { key } => {
            let public = KeyPair::load_public(&key)?;
            println!("Peer ID:     {}", public.peer_id());
            println!("Fingerprint: {}", public.fingerprint());
        }
        Command::Fingerprint { key } => {
            println!("{}", KeyPair::load_public(&key)?.fingerprint());
        }
        Command::SafetyNumber { ours, theirs } => {
            let ours = KeyPair::load_public(&ours)?;
            let theirs = KeyPair::load_public(&theirs)?;
            let number = safety_number(ours.as_bytes(), theirs.as_bytes());
            println!("{}", format_safety_number(&number));
        }
        Command::Run {
            key,
            relay,
            config,
            code,
            pair,
            accept,
            message,
            file,
            receive_dir,
        } => {
            let mut config = TransportConfig::load(config.as_deref())?;
            if let Some(dir) = receive_dir {
                config.transfer.receive_dir = dir;
            }
            let url = relay
                .or_else(|| config.signaling.url.clone())
                .context("no relay URL; pass --relay or set ZAJEL_SIGNALING_URL")?;
            let keys = match key {
                Some(path) => KeyPair::load(&path)?,
                None => {
                    warn!("no key given, using a throwaway identity");
                    KeyPair::generate()
                }
            };
            let pairing_code = code.unwrap_or_else(generate_pairing_code);
            if !is_valid_pairing_code(&pairing_code) {
                bail!("invalid pairing code: {}", pairing_code);
            }
            if let Some(target) = &pair {
                if !is_valid_pairing_code(target) {
                    bail!("invalid peer pairing code: {}", target);
                }
            }

            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            rt.block_on(run_session(RunOptions {
                url,
                keys,
                config,
                pairing_code,
                pair,
                accept,
                message,
                file,
            }))?;
        }
        Command::Version => {
            println!("zajel {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

struct RunOptions {
    url: String,
    keys: KeyPair,
    config: TransportConfig,
    pairing_code: String,
    pair: Option<String>,
    accept: bool,
    message: Option<String>,
    file: Option<PathBuf>,
}

async fn run_session(opts: RunOptions) -> Result<()> {
    let registration = Registration {
        pairing_code: opts.pairing_code.clone(),
        public_key: opts.keys.public_key_base64(),
    };
    let (relay, inbound) = RelayClient::spawn(opts.url.clone(), registration, &opts.config.signaling)?;
    let factory = WebRtcFactory::new(opts.config.negotiation.ice_servers.clone())?;
    let (transport, mut events) = Transport::new(opts.keys, opts.config, Arc::new(factory), relay.sender());
    let relay_task = transport.attach_relay(inbound);

    println!("Pairing code: {}", opts.pairing_code);
    println!("Fingerprint:  {}", transport.fingerprint());
    info!(relay = %opts.url, "connecting to relay");

    let mut pending_message = opts.message;
    let mut pending_file = opts.file;

    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        };

        match event {
            TransportEvent::Registered { .. } => {
                println!("Registered with relay");
                if let Some(target) = &opts.pair {
                    transport.pair_request(target, None).await?;
                    println!("Pair request sent to {}", target);
                }
            }
            TransportEvent::PairIncoming {
                from_code,
                from_public_key,
                proposed_name,
            } => {
                let key = zajel_crypto::PeerPublicKey::from_base64(&from_public_key);
                let fingerprint = key.map(|k| k.fingerprint()).unwrap_or_else(|_| "<invalid key>".to_string());
                println!(
                    "Pair request from {} ({}) fingerprint {}",
                    from_code,
                    proposed_name.as_deref().unwrap_or("unnamed"),
                    fingerprint
                );
                transport.respond_pair(&from_code, opts.accept).await?;
                if !opts.accept {
                    println!("Rejected; pass --accept to accept pair requests");
                }
            }
            TransportEvent::PairMatched { peer_code, .. } => println!("Paired with {}", peer_code),
            TransportEvent::PairRejected { peer_code } => println!("{} rejected the pair request", peer_code),
            TransportEvent::PairTimeout { peer_code } => println!("Pair request to {} timed out", peer_code),
            TransportEvent::PairError { error } => println!("Pairing error: {}", error),
            TransportEvent::RelayError { message } => println!("Relay error: {}", message),
            TransportEvent::StateChanged { peer, state, generation } => {
                info!(%peer, state, ?generation, "connection state changed");
            }
            TransportEvent::Verified { peer, fingerprint } => {
                println!("Session with {} verified", peer);
                println!("  Peer fingerprint: {}", fingerprint);
                let number = transport.safety_number(&peer)?;
                println!("  Safety number:    {}", format_safety_number(&number));
                if let Some(text) = pending_message.take() {
                    transport.send_message(&peer, &text).await?;
                    println!("Message sent");
                }
                if let Some(path) = pending_file.take() {
                    let file_id = transport.send_file(&peer, path.clone()).await?;
                    println!("Sending {} ({})", path.display(), file_id);
                }
            }
            TransportEvent::SecurityAlert { peer, error } => {
                println!("SECURITY: session with {} refused: {}", peer, error);
            }
            TransportEvent::Message { peer, text } => println!("<{}> {}", peer, text),
            TransportEvent::TransferOffered {
                file_name, total_size, ..
            } => println!("Receiving {} ({} bytes)", file_name, total_size),
            TransportEvent::TransferProgress {
                file_id,
                direction,
                transferred,
                total,
                ..
            } => info!(%file_id, %direction, transferred, total, "transfer progress"),
            TransportEvent::TransferComplete {
                file_name, direction, path, ..
            } => match (direction, path) {
                (TransferDirection::Receive, Some(path)) => {
                    println!("Received {} -> {}", file_name, path.display())
                }
                _ => println!("Delivered {}", file_name),
            },
            TransportEvent::TransferFailed { file_id, error, .. } => {
                println!("Transfer {} failed: {}", file_id, error)
            }
            TransportEvent::TransferCancelled { file_id, reason, .. } => {
                println!("Transfer {} cancelled: {}", file_id, reason)
            }
            TransportEvent::SessionClosed { peer } => println!("Session with {} closed", peer),
        }
    }

    transport.shutdown().await;
    relay.shutdown();
    relay_task.abort();
    Ok(())
}
