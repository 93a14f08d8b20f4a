//! dp5-client binary: keep a presence client registered and report friends

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dp5_client::{ClientConfig, ClientSnapshot, HttpTransport, PresenceClient};
use dp5_core::{Event, Outcome, PlaintextEngine, ProtocolKind, PublicKey, Reaction, Track};

#[derive(Parser, Debug)]
#[command(name = "dp5-client")]
#[command(about = "DP5 presence client")]
struct Args {
    /// Client configuration (servers and epoch parameters)
    #[arg(short, long)]
    config: PathBuf,

    /// Identity and friend state, created if missing
    #[arg(short, long, default_value = "dp5-client.json")]
    state: PathBuf,

    /// Add a friend as HEXKEY=NICK
    #[arg(long = "friend")]
    friends: Vec<String>,

    /// Presence payload to publish, hex encoded
    #[arg(long)]
    data: Option<String>,
}

fn parse_friend(arg: &str) -> anyhow::Result<(PublicKey, String)> {
    let (key, nick) = arg
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Friend must be HEXKEY=NICK, got {}", arg))?;
    let key = hex::decode(key.strip_prefix("0x").unwrap_or(key))?;
    Ok((PublicKey::from_bytes(key), nick.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("dp5_client=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = ClientConfig::load(&args.config)?;
    let transport = HttpTransport::new(&config)?;

    for track in [Track::Standard, Track::Combined] {
        match transport.server_status(track).await {
            Ok(status) => tracing::info!(track = %track, epoch = status.epoch, "Registration server reachable"),
            Err(e) => tracing::warn!(track = %track, error = %e, "Registration server unreachable"),
        }
    }

    let mut builder = PresenceClient::builder(PlaintextEngine::new(), transport).config(config);
    if args.state.exists() {
        builder = builder.snapshot(ClientSnapshot::load(&args.state)?);
    }
    let mut client = builder.build()?;

    for friend in &args.friends {
        let (key, nick) = parse_friend(friend)?;
        client.set_friend(key, Some(nick));
    }
    if let Some(data) = &args.data {
        let mut data = hex::decode(data)?;
        data.resize(client.epoch_config(Track::Combined).plaintext_size(), 0);
        client.update(None, None, Some(data))?;
    }

    tracing::info!(
        key = %client.public_key(),
        combined_key = %client.combined_public_key(),
        "Identity"
    );

    client.subscribe(|state, event, _| {
        if let Event::Protocol {
            kind: ProtocolKind::LookupCombined,
            epoch,
            outcome: Outcome::Success,
        } = event
        {
            let online: Vec<String> = state
                .online_friends(*epoch)
                .map(|f| f.nick.clone().unwrap_or_else(|| f.key.short()))
                .collect();
            tracing::info!(epoch, online = ?online, "Friends online");
        }
        Reaction::keep()
    });

    client
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    client.snapshot().save(&args.state)?;
    tracing::info!(path = %args.state.display(), "State saved");
    Ok(())
}
