use relaymux::config::Config;
use relaymux::orchestrator::Orchestrator;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

fn usage() -> ! {
    eprintln!("usage: relaymux <config.toml>");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = match std::env::args().nth(1) {
        Some(path) => path,
        None => usage(),
    };

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("relaymux: {}", e);
            return ExitCode::FAILURE;
        }
    };

    env_logger::Builder::new()
        .parse_filters(&format!("relaymux={}", config.log.level))
        .init();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let privacy = Arc::new(AtomicBool::new(false));

    // interrupt/termination -> graceful shutdown
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    log::error!("signal handler setup failed: {}", e);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            log::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        });
    }

    // SIGUSR1 engages the privacy hold (pin to fallback), SIGUSR2 releases
    {
        let privacy = Arc::clone(&privacy);
        tokio::spawn(async move {
            let (mut engage, mut release) = match (
                signal(SignalKind::user_defined1()),
                signal(SignalKind::user_defined2()),
            ) {
                (Ok(a), Ok(b)) => (a, b),
                _ => {
                    log::error!("privacy signal handler setup failed");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = engage.recv() => privacy.store(true, Ordering::Relaxed),
                    _ = release.recv() => privacy.store(false, Ordering::Relaxed),
                }
            }
        });
    }

    let mut orchestrator = match Orchestrator::new(config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            log::error!("startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match orchestrator.run(shutdown_rx, privacy).await {
        Ok(()) => {
            log::info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
