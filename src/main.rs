use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use gamemaster_orchestrator::adapter::AdapterRegistry;
use gamemaster_orchestrator::adapter::http::OpenAiCompatibleAdapter;
use gamemaster_orchestrator::adapter::mock::MockAdapter;
use gamemaster_orchestrator::api::{self, AppState};
use gamemaster_orchestrator::locks::SessionLockRegistry;
use gamemaster_orchestrator::orchestrator::Orchestrator;
use gamemaster_orchestrator::store::{SqliteStore, Store};
use gamemaster_orchestrator::streams::StreamRegistry;

#[derive(Parser)]
#[command(name = "gamemaster-orchestrator")]
#[command(version)]
#[command(about = "Session orchestrator for an AI game-master text-adventure platform")]
#[command(long_about = "\
gamemaster-orchestrator resolves a credential for a user and game, creates
and persists sessions, drives the structured-reply / narration / image
turn pipeline, and serves the result over HTTP with server-sent events.")]
#[command(after_long_help = "\
ENVIRONMENT VARIABLES:
    RUST_LOG           Log level filter (default: gamemaster_orchestrator=info)
    GM_HTTP_PORT       HTTP server port (default: 8080)
    GM_BIND_ADDR       HTTP server bind address (default: 127.0.0.1)
    GM_DB_PATH         SQLite database path (default: ./gamemaster.sqlite)
    OPENAI_API_KEY     Registers the OpenAI-compatible adapter under vendor tag 'openai'
    ANTHROPIC_API_KEY  Registers the OpenAI-compatible adapter under vendor tag 'anthropic'

A 'mock' vendor adapter is always registered, for sessions that have no
real credential resolved yet or for local development.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// HTTP server bind address
        #[arg(long, env = "GM_BIND_ADDR", default_value = "127.0.0.1")]
        bind_addr: String,

        /// HTTP server port
        #[arg(long, env = "GM_HTTP_PORT", default_value_t = 8080)]
        http_port: u16,

        /// SQLite database path
        #[arg(long, env = "GM_DB_PATH", default_value = "./gamemaster.sqlite")]
        db_path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    initialize_logging();

    let Cli { command: Commands::Serve { bind_addr, http_port, db_path } } = Cli::parse();

    let database_url = format!("sqlite://{db_path}?mode=rwc");
    let store: Arc<dyn Store> = Arc::new(SqliteStore::connect(&database_url).await?);

    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::new(MockAdapter::new()));
    if std::env::var("OPENAI_API_KEY").is_ok() {
        adapters.register(Arc::new(OpenAiCompatibleAdapter::new("openai", "https://api.openai.com/v1")));
    }
    if std::env::var("ANTHROPIC_API_KEY").is_ok() {
        adapters.register(Arc::new(OpenAiCompatibleAdapter::new("anthropic", "https://api.anthropic.com/v1")));
    }

    let streams = Arc::new(StreamRegistry::new());
    let locks = SessionLockRegistry::new();
    let orchestrator = Orchestrator::new(Arc::clone(&store), adapters, Arc::clone(&streams), locks);

    let state = AppState { orchestrator, store, streams };
    let router = api::create_router(state);

    let listener = tokio::net::TcpListener::bind((bind_addr.as_str(), http_port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router).await?;

    Ok(())
}

fn initialize_logging() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "gamemaster_orchestrator=info".into()),
    );

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(env_filter))
        .init();
}
