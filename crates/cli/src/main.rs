//! Binary entry point: loads `AppConfig`, starts the subprocess
//! supervisor(s), and serves the orchestration HTTP API until interrupted.
//!
//! Argument parsing around *what to run* (download a model, fine-tune,
//! onboard) is explicitly out of scope here; this binary only starts the
//! core system.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use orc_config::AppConfig;
use orc_memory::MemoryStore;
use orc_server::AppState;
use orc_supervisor::{SubprocessConfig, SupervisorSet};

fn subprocess_config_from(section: &orc_config::SupervisorConfig) -> SubprocessConfig {
    let mut config = SubprocessConfig::new(&section.binary_path, &section.model_path)
        .with_extra_args(section.extra_args.clone());
    if section.port != 0 {
        config = config.with_port(section.port);
    }
    config.host = section.host.clone();
    config.health_poll_interval = std::time::Duration::from_millis(section.health_poll_interval_ms);
    config.startup_timeout = std::time::Duration::from_secs(section.startup_timeout_secs);
    config.max_restart_attempts = section.max_restart_attempts;
    config.label = section.label.clone();
    config.quiet = section.quiet;
    config
}

#[derive(Parser)]
#[command(name = "orc", about = "Local-first OpenAI-compatible LLM orchestration layer")]
struct Cli {
    #[arg(long, default_value = "config/default.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.telemetry.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if config.supervisor.model_path.is_empty() {
        anyhow::bail!("supervisor.model_path must be set (config file or ORC_MODEL_PATH)");
    }

    let inference_config = subprocess_config_from(&config.supervisor);
    let embedding_config = if config.embedding.enabled {
        Some(subprocess_config_from(&config.embedding.supervisor))
    } else {
        None
    };

    tracing::info!("starting inference subprocess");
    let supervisor = Arc::new(SupervisorSet::start(inference_config, embedding_config).await?);

    let embed_fn: orc_memory::EmbedFn = {
        let client = supervisor.embedding.as_ref().map(|h| h.client().clone());
        let inference_client = supervisor.inference.client().clone();
        Arc::new(move |text: String| {
            let client = client.clone().unwrap_or_else(|| inference_client.clone());
            Box::pin(async move { Ok(client.embed(&text, "embedding").await.ok()) })
        })
    };
    let memory = Arc::new(MemoryStore::open(&config.memory.data_dir, embed_fn).await?);

    let embedding_client = supervisor.embedding.as_ref().map(|h| h.client().clone());
    let state = AppState::new(
        supervisor.inference.client().clone(),
        embedding_client,
        "embedding",
        memory,
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "orchestration server listening");

    let app = orc_server::router(state);
    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    supervisor.stop_all().await?;
    Ok(())
}
