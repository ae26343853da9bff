use clap::Parser;
use std::future::Future;
use std::io;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod codec;
mod config;
mod error;
mod filter;
mod manager;
mod sequencer;
mod session;
mod state;

use config::{CliArgs, Config};
use filter::{PacketFilter, XdpFilter};
use manager::TargetManager;
use session::Session;
use state::{AgentStats, TargetCache};

/// Capture requests buffered between the drain worker and the session.
const REQUEST_QUEUE_LEN: usize = 1024;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = match cli.config {
        Some(ref config_path) => match Config::from_file(Path::new(config_path)) {
            Ok(config) => config,
            Err(e) => {
                println!("coldgate: {:#}", e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };
    config.merge_cli(&cli);

    // Logging.
    let filter = if config.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        )
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            println!("coldgate: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let filter = XdpFilter::new(&config.bpf_object);
    serve(config, filter, tokio::signal::ctrl_c()).await
}

/// Attach `filter`, run the control session and wait for `shutdown`.
///
/// Returns `Ok` only when `shutdown` fires; a broken session or capture
/// stream is an error.  The filter is closed on every path past a
/// successful attach.
async fn serve<F, S>(config: Config, filter: F, shutdown: S) -> anyhow::Result<()>
where
    F: PacketFilter,
    S: Future<Output = io::Result<()>>,
{
    // ── Shared state ──────────────────────────────────────────────────
    let stats = Arc::new(AgentStats::new());
    let cache = Arc::new(TargetCache::new());
    let (request_tx, mut request_rx) = mpsc::channel(REQUEST_QUEUE_LEN);
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();

    // ── Capture filter ────────────────────────────────────────────────
    let manager = Arc::new(TargetManager::new(
        filter,
        request_tx,
        fatal_tx,
        stats.clone(),
    ));
    manager.start(&config.ifname)?;
    let session_config = config.session();

    // ── Control channel ───────────────────────────────────────────────
    let mut session = Session::new(session_config, manager.clone(), cache.clone(), stats.clone());
    let mut session_task = tokio::spawn({
        let manager = manager.clone();
        let poll = config.ready_poll();
        async move {
            sequencer::connect_when_ready(manager, poll, || async move {
                session.connect(&mut request_rx).await
            })
            .await
        }
    });

    // ── HTTP API ──────────────────────────────────────────────────────
    if let Some(port) = config.api_port {
        let app_state = Arc::new(api::AppState {
            view: manager.clone(),
            cache: cache.clone(),
            stats: stats.clone(),
            start_time: std::time::Instant::now(),
        });
        let app = api::router(app_state, &config.allowed_ips);
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        tracing::info!("Status API on http://0.0.0.0:{}", port);
        tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<std::net::SocketAddr>();
            if let Err(e) = axum::serve(listener, service).await {
                tracing::error!("Status API stopped: {}", e);
            }
        });
    }

    // ── Wait for shutdown ─────────────────────────────────────────────
    let outcome = tokio::select! {
        signal = shutdown => match signal {
            Ok(()) => {
                tracing::info!("Interrupted, shutting down");
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(e).context("listening for interrupt")),
        },
        joined = &mut session_task => match joined {
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("control session failed")),
            Ok(Ok(())) => Err(anyhow::anyhow!("control session ended")),
            Err(e) => Err(anyhow::Error::new(e).context("control session panicked")),
        },
        Some(e) = fatal_rx.recv() => Err(anyhow::Error::new(e).context("capture stream failed")),
    };

    session_task.abort();
    manager.close();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;
    use tokio::net::UdpSocket;
    use tokio::sync::oneshot;
    use tokio::time::{timeout, Duration};

    use crate::error::FilterError;
    use crate::filter::testing::{FakeFilter, Journal};

    const WAIT: Duration = Duration::from_secs(2);

    async fn coordinator() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    fn config_for(coordinator: &UdpSocket) -> Config {
        Config {
            coordinator: coordinator.local_addr().unwrap().to_string(),
            ready_poll_millis: 10,
            ..Config::default()
        }
    }

    /// Wait for the agent's first hello and return where it came from.
    async fn first_hello(coordinator: &UdpSocket) -> std::net::SocketAddr {
        let mut buf = [0u8; 64];
        let (_, agent) = timeout(WAIT, coordinator.recv_from(&mut buf))
            .await
            .expect("no hello from agent")
            .unwrap();
        agent
    }

    fn last_entry(journal: &Journal) -> Option<&'static str> {
        journal.lock().unwrap().last().copied()
    }

    #[tokio::test]
    async fn test_session_failure_closes_filter() {
        let coordinator = coordinator().await;
        let (filter, _events) = FakeFilter::new();
        let journal = filter.journal.clone();
        let agent = tokio::spawn(serve(
            config_for(&coordinator),
            filter,
            pending::<io::Result<()>>(),
        ));

        let from = first_hello(&coordinator).await;
        coordinator.send_to(&[0x02, 0x0a], from).await.unwrap();

        let err = timeout(WAIT, agent).await.unwrap().unwrap().unwrap_err();
        assert!(format!("{err:#}").contains("control session failed"));
        assert_eq!(last_entry(&journal), Some("close"));
    }

    #[tokio::test]
    async fn test_capture_failure_closes_filter() {
        let coordinator = coordinator().await;
        let (filter, events) = FakeFilter::new();
        let journal = filter.journal.clone();
        let agent = tokio::spawn(serve(
            config_for(&coordinator),
            filter,
            pending::<io::Result<()>>(),
        ));

        first_hello(&coordinator).await;
        events
            .send(Err(FilterError::EventRead("cpu 1: EIO".into())))
            .await
            .unwrap();

        let err = timeout(WAIT, agent).await.unwrap().unwrap().unwrap_err();
        assert!(format!("{err:#}").contains("capture stream failed"));
        assert_eq!(last_entry(&journal), Some("close"));
    }

    #[tokio::test]
    async fn test_interrupt_closes_filter_and_succeeds() {
        let coordinator = coordinator().await;
        let (filter, _events) = FakeFilter::new();
        let journal = filter.journal.clone();
        let (interrupt, interrupted) = oneshot::channel::<()>();
        let agent = tokio::spawn(serve(config_for(&coordinator), filter, async move {
            let _ = interrupted.await;
            Ok(())
        }));

        first_hello(&coordinator).await;
        interrupt.send(()).unwrap();

        timeout(WAIT, agent).await.unwrap().unwrap().unwrap();
        assert_eq!(*journal.lock().unwrap(), vec!["attach", "close"]);
    }

    #[tokio::test]
    async fn test_attach_failure_is_reported() {
        let coordinator = coordinator().await;
        let filter = FakeFilter::failing(FilterError::InterfaceNotFound("nope0".into()));
        let journal = filter.journal.clone();

        let err = serve(config_for(&coordinator), filter, pending::<io::Result<()>>())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope0"));
        assert_eq!(*journal.lock().unwrap(), vec!["attach"]);
    }
}
