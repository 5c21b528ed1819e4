//! Analytics chat service
//!
//! Loads the tool backend manifest, wires the reasoning loop to a language
//! model and serves chat sessions over websockets.

use std::sync::Arc;
use std::time::Duration;

use ai_agent::{OpenAiConfig, PromptConfig, PromptedDecisionStrategy, ReasoningLoop};
use anyhow::{Context, Result};
use chat_server::{parse_listen_addr, ChatServer, RateLimit, ServerConfig, SessionSettings};
use clap::Parser;
use llm_router::{LlmRouter, RoutingPolicy};
use tokio_util::sync::CancellationToken;
use tool_gateway::{BackendManifest, ToolGateway, DEFAULT_MANIFEST_PATH};
use tracing_subscriber::{fmt, EnvFilter};

/// Command-line arguments for the analytics chat service
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to accept websocket connections on
    #[arg(long, env = "ANALYTICS_CHAT_LISTEN", default_value = chat_server::DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// Path to the tool backend manifest
    #[arg(long, env = "MCP_CONFIG", default_value = DEFAULT_MANIFEST_PATH)]
    mcp_config: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = ai_agent::openai::DEFAULT_OPENAI_BASE_URL)]
    openai_base_url: String,

    #[arg(long, env = "OPENAI_MODEL", default_value = ai_agent::openai::DEFAULT_OPENAI_MODEL)]
    openai_model: String,

    /// Sampling temperature for decisions
    #[arg(long, default_value_t = 0.1)]
    temperature: f32,

    /// Tool calls allowed per query
    #[arg(long, default_value_t = ai_agent::DEFAULT_AGENT_MAX_STEPS)]
    max_steps: usize,

    /// Seconds before a single tool call is abandoned
    #[arg(long, default_value_t = 30)]
    tool_timeout: u64,

    /// Wall-clock ceiling per query in seconds
    #[arg(long)]
    run_deadline: Option<u64>,

    /// End a query after this many failed tool calls in a row
    #[arg(long)]
    max_consecutive_failures: Option<usize>,

    /// Seconds between heartbeat pings
    #[arg(long, default_value_t = 30)]
    heartbeat: u64,

    #[arg(long, default_value_t = chat_server::DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Queries allowed per session within the rate window
    #[arg(long, default_value_t = 100)]
    rate_limit: u32,

    /// Rate window in seconds
    #[arg(long, default_value_t = 3600)]
    rate_window: u64,

    #[arg(long, default_value_t = chat_server::DEFAULT_MAX_QUERY_LENGTH)]
    max_query_length: usize,

    /// Connect every backend at startup instead of on first use
    #[arg(long, default_value_t = false)]
    eager_connect: bool,

    /// Enable debug logging
    #[arg(short, long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.debug {
            EnvFilter::new("debug,tool_gateway=debug,ai_agent=debug,chat_server=debug")
        } else {
            EnvFilter::new("info")
        }
    });
    fmt().with_env_filter(filter).init();

    tracing::info!("Starting analytics chat service...");

    let config = ServerConfig {
        listen: parse_listen_addr(&args.listen)?,
        heartbeat_interval: Duration::from_secs(args.heartbeat),
        max_connections: args.max_connections,
        session: SessionSettings {
            max_query_length: args.max_query_length,
            rate_limit: RateLimit {
                max_queries: args.rate_limit,
                window: Duration::from_secs(args.rate_window),
            },
            ..SessionSettings::default()
        },
    };
    config.validate()?;

    let tool_timeout = Duration::from_secs(args.tool_timeout);
    let gateway = Arc::new(register_backends(&args.mcp_config, tool_timeout).await?);
    if args.eager_connect {
        gateway.connect_all().await;
    }

    let openai = args.openai_api_key.clone().map(|key| OpenAiConfig {
        base_url: args.openai_base_url.clone(),
        model: args.openai_model.clone(),
        ..OpenAiConfig::new(key)
    });
    let router = LlmRouter::new(openai).context("setting up the language model")?;
    match router.model_name() {
        Some(model) => tracing::info!(model, "language model configured"),
        None => tracing::warn!("OPENAI_API_KEY is not set; queries will be answered with a configuration error"),
    }
    let model = router.route(RoutingPolicy::default())?;

    let mut prompt = PromptConfig::default();
    prompt.model_options.temperature = args.temperature;
    let strategy = Arc::new(PromptedDecisionStrategy::new(model, prompt));
    let agent = Arc::new(
        ReasoningLoop::builder(strategy, gateway.clone())
            .max_steps(args.max_steps)
            .tool_timeout(tool_timeout)
            .run_deadline(args.run_deadline.map(Duration::from_secs))
            .max_consecutive_failures(args.max_consecutive_failures)
            .build(),
    );

    let server = ChatServer::new(agent, gateway.clone(), config);
    let health = server.health().await;
    tracing::info!(
        overall = ?health.overall,
        backends = health.backends.len(),
        "initial health"
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down...");
        }
        shutdown.cancel();
    });

    let served = server.run(cancel).await;
    gateway.shutdown().await;
    served
}

/// Registers every manifest entry. A bad entry is logged and skipped.
async fn register_backends(path: &str, timeout: Duration) -> Result<ToolGateway> {
    let manifest = BackendManifest::load(path)?;
    let gateway = ToolGateway::new().with_default_timeout(timeout);
    for (name, entry) in manifest.entries() {
        let registered = match entry {
            Ok(config) => gateway.register(config).await,
            Err(err) => Err(err),
        };
        match registered {
            Ok(()) => tracing::info!(backend = %name, "backend registered"),
            Err(err) => tracing::error!(backend = %name, error = %err, "skipping backend"),
        }
    }
    Ok(gateway)
}
