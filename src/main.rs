use std::{net::SocketAddr, sync::Arc};

use agency_chat_proxy::{
    ChatProxy, DEFAULT_AI_API_URL, DEFAULT_AI_MODEL, DEFAULT_CONSULTANT_MAX_USAGE,
    DEFAULT_SCRIPT_CHAT_MAX_USAGE, Dispatcher, HttpIdentityProvider, ProxyError, UpstreamConfig,
    UsageLimits, UsageStore, server,
};
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(author, version, about = "Quota-limited proxy in front of an AI completion provider")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP server exposing the brand consultant and video script endpoints.
    Serve(ServeArgs),
    /// Print the stored usage record for one user.
    Usage(UsageArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Identity provider base URL; the proxy calls `<auth-url>/user`.
    #[arg(long, env = "AUTH_URL")]
    auth_url: String,

    /// Public API key sent to the identity provider as the `apikey` header.
    #[arg(long, env = "AUTH_API_KEY", hide_env_values = true)]
    auth_api_key: Option<String>,

    #[command(flatten)]
    upstream: UpstreamArgs,

    /// SQLite database path holding the usage_tracking table.
    #[arg(long, env = "USAGE_DB_PATH", default_value = "usage_tracking.db")]
    db_path: String,

    /// Successful brand consultant calls allowed per user.
    #[arg(long, env = "CONSULTANT_MAX_USAGE", default_value_t = DEFAULT_CONSULTANT_MAX_USAGE)]
    consultant_max_usage: i64,

    /// Successful video script calls allowed per user.
    #[arg(long, env = "SCRIPT_CHAT_MAX_USAGE", default_value_t = DEFAULT_SCRIPT_CHAT_MAX_USAGE)]
    script_chat_max_usage: i64,

    /// Address to bind the server to.
    #[arg(long, env = "PROXY_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Port to bind the server to.
    #[arg(long, env = "PROXY_PORT", default_value_t = 8787)]
    port: u16,
}

#[derive(Debug, Args)]
struct UpstreamArgs {
    /// Chat-completion endpoint of the AI provider.
    #[arg(long, env = "AI_API_URL", default_value = DEFAULT_AI_API_URL)]
    ai_api_url: String,

    /// Provider API key. Without it the legacy webhook is used.
    #[arg(long, env = "AI_API_KEY", hide_env_values = true)]
    ai_api_key: Option<String>,

    #[arg(long, env = "AI_MODEL", default_value = DEFAULT_AI_MODEL)]
    ai_model: String,

    /// Sent as `HTTP-Referer` to the provider.
    #[arg(long, env = "AI_HTTP_REFERER")]
    http_referer: Option<String>,

    /// Sent as `X-Title` to the provider.
    #[arg(long, env = "AI_TITLE")]
    title: Option<String>,

    /// Legacy GET webhook used when no provider key is configured.
    #[arg(long, env = "FALLBACK_WEBHOOK_URL")]
    fallback_webhook_url: Option<String>,
}

impl From<UpstreamArgs> for UpstreamConfig {
    fn from(args: UpstreamArgs) -> Self {
        Self {
            ai_api_url: args.ai_api_url,
            ai_api_key: args.ai_api_key,
            ai_model: args.ai_model,
            http_referer: args.http_referer,
            title: args.title,
            fallback_webhook_url: args.fallback_webhook_url,
        }
    }
}

#[derive(Debug, Args)]
struct UsageArgs {
    /// User id as issued by the identity provider.
    user_id: String,

    #[arg(long, env = "USAGE_DB_PATH", default_value = "usage_tracking.db")]
    db_path: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => run_server(args).await?,
        Command::Usage(args) => {
            if let Err(err) = show_usage(args).await {
                report_error(&err);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let identity = HttpIdentityProvider::new(&args.auth_url, args.auth_api_key)?;
    let upstream: UpstreamConfig = args.upstream.into();
    let dispatcher = Dispatcher::from_config(&upstream)?;
    tracing::info!(provider = dispatcher.kind(), "AI provider selected");

    let usage = UsageStore::open(&args.db_path).await?;
    let limits = UsageLimits {
        brand_consultant: args.consultant_max_usage,
        video_script_chat: args.script_chat_max_usage,
    };

    let proxy = ChatProxy::new(Arc::new(identity), usage, dispatcher, limits);
    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;

    server::serve(addr, proxy).await
}

async fn show_usage(args: UsageArgs) -> Result<(), ProxyError> {
    let store = UsageStore::open(&args.db_path).await?;
    match store.fetch(&args.user_id).await? {
        Some(record) => {
            let last_used = record
                .last_used_at
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            println!(
                "{}\tusage_count={}\tlast_used_at={}",
                record.user_id, record.usage_count, last_used
            );
        }
        None => println!("{}\tusage_count=0\tlast_used_at=never", args.user_id),
    }
    Ok(())
}

fn report_error(err: &ProxyError) {
    eprintln!("error: {err}");
    if let ProxyError::Database(db_err) = err {
        eprintln!("  database: {db_err}");
    }
}
