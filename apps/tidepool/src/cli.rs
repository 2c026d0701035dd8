use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "tidepool",
    about = "Anonymous one-to-one matchmaking over a shared key-value store",
    author,
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Join the pool and chat with whoever you are matched with.
    ///
    /// Type to send a line, `/next` to find someone else, `/quit` to leave.
    Join {
        /// Redis URL of the shared store (overrides TIDEPOOL_REDIS_URL).
        #[arg(long)]
        redis_url: Option<String>,
    },
    /// Run several participants against an in-process store and print how
    /// they paired.
    Simulate {
        /// Number of participants to start.
        #[arg(long, default_value_t = 4)]
        participants: usize,
        /// How long to let them run before taking the snapshot.
        #[arg(long, default_value_t = 500)]
        settle_ms: u64,
    },
    /// Print this installation's participant id, creating it if needed.
    Whoami,
}
