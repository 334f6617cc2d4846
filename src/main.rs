//! strata — tiered memory engine for conversational companions.
//! hot → warm → cold, with clustering, heat-based promotion and hybrid recall.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use strata::ai::{AiConfig, Distiller, ExtractiveDistiller, LlmDistiller};
use strata::api;
use strata::config::MemoryConfig;
use strata::distlock::DistLock;
use strata::index::{Embedder, LocalHashEmbedder, RelevanceIndex};
use strata::orchestrate::{Orchestrator, QueueSource};
use strata::retrieve::Retriever;
use strata::store::TierStore;
use strata::AppState;

#[derive(Parser)]
#[command(name = "strata", version, about = "Tiered memory engine for conversational companions")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "4021", env = "STRATA_PORT")]
    port: u16,

    /// SQLite database path
    #[arg(short, long, default_value = "strata.db", env = "STRATA_DB")]
    db: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let cfg = MemoryConfig::from_env();
    let store = Arc::new(TierStore::open(&args.db).expect("failed to open database"));

    let ai_cfg = AiConfig::from_env();
    let ai_status = match &ai_cfg {
        Some(c) => format!("llm={}, embed={}", c.llm_model, c.embed_model),
        None => "offline (hash embedder, extractive distiller)".into(),
    };
    let embedder: Arc<dyn Embedder> = match &ai_cfg {
        Some(c) => Arc::new(c.clone()),
        None => Arc::new(LocalHashEmbedder::default()),
    };
    let distiller: Arc<dyn Distiller> = match ai_cfg {
        Some(c) => Arc::new(LlmDistiller::new(c)),
        None => Arc::new(ExtractiveDistiller::default()),
    };

    let index = Arc::new(RelevanceIndex::new(store.clone(), embedder, 128));
    let retriever = Arc::new(Retriever::new(store.clone(), index.clone(), cfg.clone()));
    let (signal_tx, source) = QueueSource::channel(cfg.queue_depth);

    let lock = DistLock::new(store.clone());
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        index.clone(),
        lock,
        distiller,
        cfg.clone(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator_handle = tokio::spawn(orchestrator.run(Arc::new(source), shutdown_rx));

    let api_key = std::env::var("STRATA_API_KEY").ok();
    let auth_status = if api_key.is_some() { "enabled" } else { "disabled" };

    let state = Arc::new(AppState {
        store,
        index,
        retriever,
        signals: signal_tx,
        cfg,
        api_key,
        started_at: std::time::Instant::now(),
    });
    let app = api::router(state).layer(TraceLayer::new_for_http());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        db = %args.db,
        ai = %ai_status,
        auth = auth_status,
        "strata starting"
    );

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // stop intake and let the workers drain what is already queued
    let _ = shutdown_tx.send(true);
    let _ = orchestrator_handle.await;
    info!("consolidation stopped");
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    info!("shutting down");
}
