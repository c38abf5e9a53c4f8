use frontgate::bootstrap::ensure_settings;
use frontgate::config::Config;
use frontgate::proxy::ProxyServer;
use frontgate::readiness::ReadinessGate;
use frontgate::supervisor::{BackendProcess, INDETERMINATE_EXIT_CODE};
use frontgate::upstream::Upstream;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// How the supervision loop ended
enum Stop {
    /// SIGINT or SIGTERM received
    Signal(&'static str),
    /// The backend exited on its own with this code
    BackendExited(i32),
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("frontgate=debug".parse().expect("valid log directive")),
        )
        .init();

    match run().await {
        Ok(code) => exit_code(code),
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<i32> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("frontgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // The backend must not start with an unknown trust configuration
    ensure_settings(&config.state).map_err(|e| {
        error!(error = %e, "Settings bootstrap failed");
        e
    })?;

    let gate = ReadinessGate::shared(config.backend.ready_markers.clone());

    let mut backend = BackendProcess::spawn(&config.backend, gate.clone()).map_err(|e| {
        error!(error = %e, "Backend failed to start");
        e
    })?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "Failed to bind listener");
            backend.terminate(config.backend.shutdown_grace_period()).await;
            return Err(e.into());
        }
    };

    let proxy = ProxyServer::new(
        bind_addr,
        gate,
        Upstream::loopback(config.backend.port),
        shutdown_rx,
    )
    .with_probe_path(config.server.probe_path.clone());

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.serve(listener).await {
            error!(error = %e, "Proxy server error");
        }
    });

    let stop = tokio::select! {
        signal = shutdown_signal() => Stop::Signal(signal),
        result = backend.wait() => match result {
            Ok(code) => Stop::BackendExited(code),
            Err(e) => {
                error!(error = %e, "Lost track of backend process");
                Stop::BackendExited(INDETERMINATE_EXIT_CODE)
            }
        },
    };

    // Stop accepting new connections first
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    let code = match stop {
        Stop::Signal(signal) => {
            info!(signal, "Shutting down, stopping backend...");
            let backend_code = backend.terminate(config.backend.shutdown_grace_period()).await;
            info!(backend_code, "Backend stopped");
            0
        }
        Stop::BackendExited(code) => {
            warn!(code, "Backend exited, shutting down");
            code
        }
    };

    info!(code, "Shutdown complete");
    Ok(code)
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = sigterm.recv() => "SIGTERM",
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, only Ctrl+C will stop the proxy");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "Ctrl+C"
    }
}

fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code)
        .map(ExitCode::from)
        .unwrap_or(ExitCode::FAILURE)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        probe_path = %config.server.probe_path,
        "Server configuration"
    );
    info!(
        command = %config.backend.command,
        args = ?config.backend.args,
        port = config.backend.port,
        ready_markers = ?config.backend.ready_markers,
        watch_stderr = config.backend.watch_stderr,
        "Backend configuration"
    );
    info!(
        settings = %config.state.settings_path().display(),
        trusted_proxies = ?config.state.trusted_proxies,
        "State configuration"
    );
}
