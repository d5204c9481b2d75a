#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use diverge_backend::{
    build_router, connect_ledger, open_cache, AppState, ServiceConfig, StartupError, TokioSleeper,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run(config: ServiceConfig) -> Result<(), StartupError> {
    let missing = config.missing_required();
    if !missing.is_empty() {
        warn!(?missing, "required configuration missing; every request will fail");
    }
    if config.therapist_secret.is_none() {
        warn!("THERAPIST_SECRET not set; session recording and ledger queries are disabled");
    }

    let ledger = connect_ledger(&config)?;
    info!(
        backend = %config.ledger_backend,
        contract_id = config.contract_id.as_deref().unwrap_or(""),
        "ledger gateway ready"
    );

    let cache = open_cache(&config).await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = AppState::new(config, ledger, cache, Arc::new(TokioSleeper));
    let app = build_router(state);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "diverge-backend listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await?;

    info!("diverge-backend stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(config.log_json);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "diverge-backend failed");
            ExitCode::FAILURE
        }
    }
}
