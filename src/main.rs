use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use denoise_relay::{
    create_router, AppState, Config, ConfigError, EngineProvider, JwtIssuer, NatsSessionProtocol,
    SessionProtocol, SessionSupervisor, SupervisorSettings,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "denoise-relay", version, about = "Real-time noise enhancement relay for audio sessions")]
struct Cli {
    /// Configuration file (TOML, extension optional)
    #[arg(short, long, default_value = "config/denoise-relay")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Join sessions and relay enhanced audio until interrupted (default)
    Run,
    /// List sessions known to the session directory and exit
    Sessions,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    info!("Denoise Relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);

    let protocol = Arc::new(NatsSessionProtocol::connect(&cfg.session.url).await?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(cfg, protocol).await,
        Command::Sessions => list_sessions(protocol.as_ref()).await,
    }
}

async fn run(cfg: Config, protocol: Arc<NatsSessionProtocol>) -> Result<()> {
    let (Some(api_key), Some(api_secret)) = (&cfg.session.api_key, &cfg.session.api_secret) else {
        return Err(ConfigError::Missing("session.api_key").into());
    };

    info!(
        "Audio: {}Hz, {} channels, {} sample frames, {}ms context, gain {}x, attenuation {}dB",
        cfg.audio.sample_rate,
        cfg.audio.channels,
        cfg.audio.frame_samples,
        cfg.audio.min_context_ms,
        cfg.audio.post_gain,
        cfg.audio.attenuation_limit_db
    );

    let issuer = Arc::new(JwtIssuer::new(api_key, api_secret));
    let engines = EngineProvider::new(cfg.engine.kind, cfg.engine.mode);
    let supervisor = SessionSupervisor::new(
        SupervisorSettings::from_config(&cfg),
        protocol,
        issuer,
        engines,
    );

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind health server to {}", addr))?;
    let app = create_router(AppState::new(supervisor.clone()));
    let server = tokio::spawn(async move { axum::serve(listener, app).await });
    info!("Health check server started on {}", addr);

    supervisor.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    supervisor.stop().await;
    server.abort();

    Ok(())
}

async fn list_sessions(protocol: &dyn SessionProtocol) -> Result<()> {
    let sessions = protocol.list_sessions().await?;

    println!("Found {} sessions", sessions.len());
    for session in sessions {
        println!("  {} ({} participants)", session.name, session.num_participants);
    }

    Ok(())
}
