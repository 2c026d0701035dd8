mod cli;

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tidepool::{identity, simulate, Config};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    init_tracing()?;

    let cli = cli::Cli::parse();
    let mut config = Config::from_env();

    match cli.command {
        cli::Commands::Join { redis_url } => {
            if let Some(url) = redis_url {
                config.redis_url = url;
            }
            join(config).await
        }
        cli::Commands::Simulate {
            participants,
            settle_ms,
        } => {
            let report = simulate::simulate(
                participants,
                Duration::from_millis(settle_ms),
                config.coordinator(),
            )
            .await
            .context("simulation failed")?;
            print!("{report}");
            Ok(())
        }
        cli::Commands::Whoami => {
            let id = identity::load_or_create(&config.identity_path()?)?;
            println!("{id}");
            Ok(())
        }
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!(err))
}

#[cfg(feature = "redis")]
async fn join(config: Config) -> Result<()> {
    use std::sync::Arc;

    use tidepool::tidepool_store::{RedisStore, SharedStore};
    use tidepool::{ChatSession, MatchState, SessionCoordinator, SignalEnvelope};
    use tokio::io::{AsyncBufReadExt, BufReader};

    let id = identity::load_or_create(&config.identity_path()?)?;
    let store: SharedStore = Arc::new(
        RedisStore::connect(&config.redis_url)
            .await
            .with_context(|| format!("failed to connect to {}", config.redis_url))?,
    );
    let (media, mut chat) = ChatSession::new();
    let coordinator = SessionCoordinator::new(store, id, Arc::new(media), config.coordinator());
    let handle = coordinator
        .start_searching()
        .await
        .context("failed to enter the pool")?;
    println!("joined as {}", handle.participant());

    let mut states = handle.state();
    let mut shown = MatchState::New;
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                if state != shown {
                    println!("* {state}");
                    shown = state;
                }
            }
            Some(line) = chat.recv() => println!("{}> {}", line.from, line.text),
            line = input.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/next" => handle.next_partner()?,
                    text => {
                        if shown != MatchState::Connected {
                            println!("* not connected yet, line dropped");
                            continue;
                        }
                        handle.send(SignalEnvelope::chat(text))?;
                    }
                }
            }
        }
    }

    handle.stop().await.context("failed to leave the pool")?;
    Ok(())
}

#[cfg(not(feature = "redis"))]
async fn join(_config: Config) -> Result<()> {
    Err(anyhow!("tidepool was built without the `redis` feature"))
}
