use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rtrelay", about = "Realtime voice relay gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay server
    Serve {
        /// Port to listen on (overrides RELAY_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Generate an API key and the matching principals-file stanza
    Keygen {
        /// Human-readable principal name
        #[arg(long)]
        name: String,
        /// Subscription tier (trial, free, pro, enterprise)
        #[arg(long, default_value = "free")]
        tier: String,
        /// Billing region code
        #[arg(long, default_value = "US")]
        region: String,
    },
}

/// Mint a fresh `rt_`-prefixed API key.
pub fn generate_api_key() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("rt_{}", hex::encode(bytes))
}
