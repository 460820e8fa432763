use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{fmt, EnvFilter};

mod backend;
mod error;
mod gemini;
mod navigation;
mod registry;
mod router;
mod server;
mod session;
mod settings;
mod storage;

use backend::GenerativeBackend;
use gemini::GeminiBackend;
use navigation::{DisabledNavigator, HistoryNavigator, NavigationSynchronizer, Navigator};
use registry::SessionRegistry;
use router::ConversationRouter;
use settings::{EffectiveSettings, SettingsLayer, resolve_effective_settings};
use storage::{MemorySessionStore, SessionStore, SqliteSessionStore};

#[derive(Debug, Parser)]
#[command(name = "chat_relay")]
#[command(about = "Multi-session chat relay for a generative tutor backend", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the chat API.
    Start(StartArgs),
    /// Print stored sessions, most recent first.
    Sessions(CommonArgs),
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// TOML file with default settings.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    database_url: Option<String>,
}

#[derive(Debug, Args)]
struct StartArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    listen: Option<String>,
    #[arg(long)]
    api_base: Option<String>,
    #[arg(long)]
    text_model: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
    /// Location to restore at startup, e.g. `#/chat/chat_1700000000000`.
    #[arg(long)]
    open: Option<String>,
    /// Keep sessions in memory only.
    #[arg(long)]
    ephemeral: bool,
    /// Track the active session without maintaining an address history.
    #[arg(long)]
    no_address: bool,
    /// Start even when no Gemini API key is configured.
    #[arg(long)]
    allow_missing_key: bool,
}

fn load_settings(common: &CommonArgs, cli_layer: SettingsLayer) -> anyhow::Result<EffectiveSettings> {
    let file_layer = match &common.config {
        Some(path) => SettingsLayer::load_file(path)?,
        None => SettingsLayer::default(),
    };
    resolve_effective_settings(&file_layer, &SettingsLayer::from_env(), &cli_layer)
}

fn require_api_key(settings: &EffectiveSettings, allow_missing: bool) -> anyhow::Result<()> {
    if settings.api_key.is_none() && !allow_missing {
        anyhow::bail!(
            "no Gemini API key configured; set CHAT_RELAY_API_KEY or GEMINI_API_KEY, or pass --allow-missing-key"
        );
    }
    Ok(())
}

fn build_navigator(address_sync: bool, open: Option<String>) -> Arc<dyn Navigator> {
    if address_sync {
        Arc::new(HistoryNavigator::new(open))
    } else {
        Arc::new(DisabledNavigator)
    }
}

async fn open_store(database_url: Option<String>, ephemeral: bool) -> Arc<dyn SessionStore> {
    if ephemeral {
        return Arc::new(MemorySessionStore::default());
    }
    match SqliteSessionStore::initialize(database_url).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "session store unavailable; sessions will not survive a restart");
            Arc::new(MemorySessionStore::default())
        }
    }
}

fn spawn_event_log(registry: &SessionRegistry) {
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!(?event, "session event"),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "session event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn start(args: StartArgs) -> anyhow::Result<()> {
    let cli_layer = SettingsLayer {
        listen: args.listen,
        database_url: args.common.database_url.clone(),
        api_base: args.api_base,
        text_model: args.text_model,
        image_model: args.image_model,
        open: args.open,
        ..SettingsLayer::default()
    };
    let settings = load_settings(&args.common, cli_layer)?;
    require_api_key(&settings, args.allow_missing_key)?;
    let addr: SocketAddr = settings.listen.parse()?;

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!(error = %err, "metrics recorder unavailable");
            None
        }
    };

    let backend: Arc<dyn GenerativeBackend> = Arc::new(GeminiBackend::new(
        settings.api_base.clone(),
        settings.api_key.clone(),
        settings.text_model.clone(),
        settings.image_model.clone(),
    ));
    let navigator = build_navigator(!args.no_address, settings.open.clone());

    let store = open_store(settings.database_url.clone(), args.ephemeral).await;
    let mut registry = Arc::new(SessionRegistry::new(store, backend.clone(), settings.system_prompt.clone()));
    let mut sync = Arc::new(NavigationSynchronizer::new(registry.clone(), navigator.clone(), settings.welcome_message.clone()));
    let outcome = match sync.startup().await {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(error = %err, "startup from stored sessions failed; continuing in memory");
            registry = Arc::new(SessionRegistry::new(
                Arc::new(MemorySessionStore::default()),
                backend.clone(),
                settings.system_prompt.clone(),
            ));
            sync = Arc::new(NavigationSynchronizer::new(registry.clone(), navigator, settings.welcome_message.clone()));
            sync.startup().await?
        }
    };
    tracing::info!(active = %outcome.active, resolution = ?outcome.resolution, "chat relay ready");

    spawn_event_log(&registry);
    let router = Arc::new(ConversationRouter::new(registry, backend));
    server::serve(addr, server::AppState { sync, router, metrics }).await
}

async fn print_sessions(args: CommonArgs) -> anyhow::Result<()> {
    let settings = load_settings(&args, SettingsLayer { database_url: args.database_url.clone(), ..SettingsLayer::default() })?;
    let store = SqliteSessionStore::initialize(settings.database_url).await?;
    let active = store.get_active_session_id().await?;
    let mut sessions: Vec<_> = store.get_all_sessions().await?.into_values().collect();
    sessions.sort_by(|a, b| a.id.recency_cmp(&b.id));
    for s in sessions {
        let marker = if Some(&s.id) == active.as_ref() { "*" } else { " " };
        println!("{marker} {}\t{}\t{} messages", s.id, s.title, s.messages.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => start(args).await?,
        Commands::Sessions(args) => print_sessions(args).await?,
    }
    Ok(())
}
