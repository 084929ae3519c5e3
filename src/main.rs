use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay::auth::file::{sha256_hex, FileStore};
use relay::cli::{self, Cli, Commands};
use relay::tools::ToolRegistryClient;
use relay::{build_router, config, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "relay=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = config::load()?;
    let args = Cli::parse();

    let result = match args.command {
        Some(Commands::Serve { port }) => run_server(cfg, port).await,
        Some(Commands::Keygen { name, tier, region }) => {
            handle_keygen(&name, &tier, &region);
            Ok(())
        }
        None => run_server(cfg, None).await,
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_server(mut cfg: config::Config, port_override: Option<u16>) -> anyhow::Result<()> {
    if let Some(port) = port_override {
        cfg.port = port;
    }

    tracing::info!(path = %cfg.principals_file, "loading credential store...");
    let store = match FileStore::load(&cfg.principals_file) {
        Ok(store) => {
            if store.is_empty() {
                tracing::warn!("principals file has no entries; every client will be rejected");
            }
            store
        }
        Err(e) => {
            tracing::warn!("failed to load principals file ({}); starting with an empty store", e);
            FileStore::from_entries(Vec::new())
        }
    };

    let tools = match &cfg.tool_registry_url {
        Some(url) => {
            let registry = Arc::new(ToolRegistryClient::new(url));
            match registry.refresh().await {
                Ok(count) => {
                    tracing::info!(url = %url, tools = count, "tool registry initialized");
                    Some(registry)
                }
                Err(e) => {
                    tracing::warn!(
                        "failed to initialize tool registry: {}; continuing without tool support",
                        e
                    );
                    None
                }
            }
        }
        None => None,
    };

    let listen_addr = cfg.listen_addr.clone();
    let port = cfg.port;
    let state = Arc::new(AppState::new(Arc::new(store), tools, cfg));
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", listen_addr, port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address: {}", e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("relay listening on ws://{}/ws", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn handle_keygen(name: &str, tier: &str, region: &str) {
    let api_key = cli::generate_api_key();
    let principal_id = uuid::Uuid::new_v4().to_string();
    println!("API key (give to the client, it is not stored anywhere):");
    println!("  {}", api_key);
    println!();
    println!("Add to the principals file:");
    println!("  - id: {}", principal_id);
    println!("    name: {}", name);
    println!("    tier: {}", tier);
    println!("    region: {}", region);
    println!("    api_key_sha256: \"{}\"", sha256_hex(&api_key));
}
