use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen_addr: String,
    pub port: u16,
    /// Upstream realtime API base, e.g. `https://api.openai.com/v1/realtime`.
    /// The sessions endpoint and the WebSocket URL are both derived from it.
    pub upstream_url: String,
    /// Explicit WebSocket URL override. Normally derived from `upstream_url`.
    pub upstream_ws_url: Option<String>,
    /// Long-lived server-held upstream secret. Never sent to clients.
    pub upstream_api_key: String,
    /// Maximum upstream sessions held by the pool (idle + leased).
    pub pool_capacity: usize,
    /// Per-principal token-bucket capacity (requests per window).
    pub rate_limit_capacity: u32,
    /// Refill window in seconds for the rate limiter.
    pub rate_limit_window_secs: u64,
    /// Close client connections idle for longer than this.
    pub idle_timeout_secs: u64,
    pub principals_file: String,
    /// Optional Tool Registry base URL. Unset = function.call interception off.
    pub tool_registry_url: Option<String>,
}

impl Config {
    /// URL of the upstream sessions endpoint used for ephemeral token minting.
    pub fn sessions_url(&self) -> String {
        format!("{}/sessions", self.upstream_url.trim_end_matches('/'))
    }

    /// WebSocket URL for upstream connections, with the model query attached.
    pub fn ws_url(&self, model: Option<&str>) -> String {
        let base = match &self.upstream_ws_url {
            Some(explicit) => explicit.trim_end_matches('/').to_string(),
            None => self
                .upstream_url
                .trim_end_matches('/')
                .replace("https://", "wss://")
                .replace("http://", "ws://"),
        };
        match model {
            Some(m) => format!("{}?model={}", base, urlencoding::encode(m)),
            None => base,
        }
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let upstream_api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();

    if upstream_api_key.is_empty() {
        let env_mode = std::env::var("RELAY_ENV")
            .or_else(|_| std::env::var("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "OPENAI_API_KEY is not set. The relay cannot mint ephemeral \
                 tokens without the server-held upstream key."
            );
        }
        eprintln!("⚠️  OPENAI_API_KEY is not set — token minting will fail until it is provided.");
    }

    let upstream_url = std::env::var("RELAY_UPSTREAM_URL")
        .unwrap_or_else(|_| "https://api.openai.com/v1/realtime".into());
    // Fail fast on an unparseable upstream base rather than at first mint.
    url::Url::parse(&upstream_url)
        .map_err(|e| anyhow::anyhow!("RELAY_UPSTREAM_URL is not a valid URL: {}", e))?;

    Ok(Config {
        listen_addr: std::env::var("RELAY_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0".into()),
        port: std::env::var("RELAY_PORT")
            .unwrap_or_else(|_| "9000".into())
            .parse()
            .unwrap_or(9000),
        upstream_url,
        upstream_ws_url: std::env::var("RELAY_UPSTREAM_WS_URL").ok(),
        upstream_api_key,
        pool_capacity: std::env::var("RELAY_POOL_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10),
        rate_limit_capacity: std::env::var("RELAY_RATE_LIMIT_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100),
        rate_limit_window_secs: std::env::var("RELAY_RATE_LIMIT_WINDOW")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60),
        idle_timeout_secs: std::env::var("RELAY_IDLE_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(600),
        principals_file: std::env::var("RELAY_PRINCIPALS_FILE")
            .unwrap_or_else(|_| "principals.yaml".into()),
        tool_registry_url: std::env::var("TOOL_REGISTRY_URL").ok(),
    })
}
