use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Duration, Instant};

use crate::codec::{CodecError, ControlMessage};
use crate::error::SessionError;
use crate::manager::TargetSink;
use crate::state::{AgentStats, SessionState, TargetCache};

/// Datagrams longer than a control message are still read whole so they can
/// be rejected instead of silently truncated.
const RECV_BUFFER_LEN: usize = 512;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// `host:port` of the coordinator.
    pub coordinator: String,
    pub hello_interval: Duration,
    /// Longest silence tolerated from the coordinator.
    pub read_timeout: Duration,
    /// Mismatched hellos tolerated between two ticker hellos.
    pub loop_guard_limit: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            coordinator: "coldgate-coordinator:3030".to_string(),
            hello_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(90),
            loop_guard_limit: 30,
        }
    }
}

/// UDP session with the coordinator.
///
/// A reader task receives datagrams and applies them; the task running
/// `connect` sends the periodic hello and forwards capture requests.  Both
/// share the socket for sending only.
pub struct Session<S: TargetSink> {
    config: SessionConfig,
    sink: Arc<S>,
    cache: Arc<TargetCache>,
    stats: Arc<AgentStats>,
    socket: Option<Arc<UdpSocket>>,
    loop_guard: Arc<AtomicU32>,
}

impl<S: TargetSink> Session<S> {
    pub fn new(
        config: SessionConfig,
        sink: Arc<S>,
        cache: Arc<TargetCache>,
        stats: Arc<AgentStats>,
    ) -> Self {
        Self {
            config,
            sink,
            cache,
            stats,
            socket: None,
            loop_guard: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn local_cold_count(&self) -> u16 {
        self.cache.cold_count()
    }

    /// Encode and write one datagram on the current connection.
    pub async fn send(&self, message: &ControlMessage) -> Result<(), SessionError> {
        let socket = self.socket.as_ref().ok_or(SessionError::NotConnected)?;
        socket.send(&message.encode()).await?;
        Ok(())
    }

    /// Connect and serve until the session breaks.
    ///
    /// Only ever returns an error; there is no graceful end to a session.
    pub async fn connect(
        &mut self,
        requests: &mut mpsc::Receiver<ControlMessage>,
    ) -> Result<(), SessionError> {
        self.stats.set_session_state(SessionState::Connecting);
        let result = self.serve(requests).await;
        self.socket = None;
        self.stats.set_session_state(SessionState::Disconnected);
        if let Err(ref e) = result {
            tracing::error!("Session with {} ended: {}", self.config.coordinator, e);
        }
        result
    }

    async fn serve(
        &mut self,
        requests: &mut mpsc::Receiver<ControlMessage>,
    ) -> Result<(), SessionError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(&self.config.coordinator).await?;
        let socket = Arc::new(socket);
        self.socket = Some(socket.clone());
        self.loop_guard.store(0, Ordering::Relaxed);
        self.stats.set_session_state(SessionState::Connected);
        tracing::info!(
            cold = self.local_cold_count(),
            "Connected to coordinator {} from {}",
            self.config.coordinator,
            socket.local_addr()?
        );

        let reader = Reader {
            socket: socket.clone(),
            sink: self.sink.clone(),
            cache: self.cache.clone(),
            stats: self.stats.clone(),
            loop_guard: self.loop_guard.clone(),
            read_timeout: self.config.read_timeout,
            loop_guard_limit: self.config.loop_guard_limit,
        };
        let mut reader = tokio::spawn(reader.run());

        let period = self.config.hello_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        let mut requests_open = true;

        let result = match send_hello(&socket, &self.cache, &self.stats).await {
            Err(e) => Err(e),
            Ok(()) => loop {
                tokio::select! {
                    joined = &mut reader => {
                        break Err(joined.unwrap_or(SessionError::ReaderStopped));
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = send_hello(&socket, &self.cache, &self.stats).await {
                            break Err(e);
                        }
                        self.loop_guard.store(0, Ordering::Relaxed);
                    }
                    request = requests.recv(), if requests_open => match request {
                        Some(request) => self.forward(&request).await,
                        None => requests_open = false,
                    },
                }
            },
        };

        reader.abort();
        result
    }

    /// Capture requests are fire-and-forget; a lost one is regenerated by the
    /// client's SYN retransmit.
    async fn forward(&self, request: &ControlMessage) {
        match self.send(request).await {
            Ok(()) => tracing::debug!("Forwarded {}", request),
            Err(e) => {
                tracing::warn!("Failed to forward {}: {}", request, e);
                AgentStats::bump(&self.stats.capture_requests_dropped);
            }
        }
    }
}

async fn send_hello(
    socket: &UdpSocket,
    cache: &TargetCache,
    stats: &AgentStats,
) -> Result<(), SessionError> {
    let hello = ControlMessage::Hello {
        peer_cold_count: cache.cold_count(),
    };
    socket.send(&hello.encode()).await?;
    AgentStats::bump(&stats.hellos_sent);
    tracing::debug!("Sent {}", hello);
    Ok(())
}

/// Receive side of a session: the only writer of the target cache and the
/// only caller of the sink.
struct Reader<S> {
    socket: Arc<UdpSocket>,
    sink: Arc<S>,
    cache: Arc<TargetCache>,
    stats: Arc<AgentStats>,
    loop_guard: Arc<AtomicU32>,
    read_timeout: Duration,
    loop_guard_limit: u32,
}

impl<S: TargetSink> Reader<S> {
    async fn run(self) -> SessionError {
        let mut buf = [0u8; RECV_BUFFER_LEN];
        loop {
            let len = match timeout(self.read_timeout, self.socket.recv(&mut buf)).await {
                Err(_) => return SessionError::ReadTimeout(self.read_timeout),
                Ok(Err(e)) => return SessionError::Io(e),
                Ok(Ok(len)) => len,
            };

            let message = match ControlMessage::decode(&buf[..len]) {
                Ok(message) => message,
                Err(CodecError::UnknownTag(tag)) => {
                    tracing::warn!("Ignoring message with unknown tag {:#04x}", tag);
                    AgentStats::bump(&self.stats.unknown_messages);
                    continue;
                }
                Err(e) => return SessionError::Malformed(e),
            };
            tracing::debug!("Received {}", message);

            if let Err(e) = self.handle(message).await {
                return e;
            }
        }
    }

    async fn handle(&self, message: ControlMessage) -> Result<(), SessionError> {
        match message {
            ControlMessage::Hello { peer_cold_count } => self.on_hello(peer_cold_count).await,
            ControlMessage::TargetUpdate {
                address,
                port,
                replicas,
            } => {
                self.on_target_update(address, port, replicas);
                Ok(())
            }
            ControlMessage::CaptureRequest { .. } => {
                tracing::warn!("Ignoring unexpected {} from coordinator", message);
                AgentStats::bump(&self.stats.unknown_messages);
                Ok(())
            }
        }
    }

    async fn on_hello(&self, peer_cold_count: u16) -> Result<(), SessionError> {
        let local = self.cache.cold_count();
        if peer_cold_count == local {
            return Ok(());
        }

        AgentStats::bump(&self.stats.hello_mismatches);
        let rounds = self.loop_guard.fetch_add(1, Ordering::Relaxed) + 1;
        if rounds > self.loop_guard_limit {
            return Err(SessionError::LoopGuard(rounds));
        }
        tracing::debug!(
            peer = peer_cold_count,
            local,
            rounds,
            "Cold count mismatch, re-sending hello"
        );
        send_hello(&self.socket, &self.cache, &self.stats).await
    }

    /// Best effort: the coordinator re-sends state, so a failed table write is
    /// only logged.
    fn on_target_update(&self, address: u32, port: u16, replicas: u16) {
        self.cache.apply(address, port, replicas);

        let result = if replicas == 0 {
            self.sink.set_target(address, port)
        } else {
            self.sink.remove_target(address)
        };

        match result {
            Ok(()) => AgentStats::bump(&self.stats.target_updates_applied),
            Err(e) => {
                tracing::warn!(
                    "Applying target {}:{} (replicas={}) failed: {}",
                    Ipv4Addr::from(address),
                    port,
                    replicas,
                    e
                );
                AgentStats::bump(&self.stats.target_update_failures);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use tokio::task::JoinHandle;

    use crate::codec::MESSAGE_LEN;
    use crate::error::TableError;
    use crate::filter::testing::FakeFilter;
    use crate::manager::TargetManager;

    const WAIT: Duration = Duration::from_secs(2);

    fn addr(a: u8, b: u8, c: u8, d: u8) -> u32 {
        u32::from(Ipv4Addr::new(a, b, c, d))
    }

    /// Sink whose table was never attached.
    struct DetachedSink;

    impl TargetSink for DetachedSink {
        fn set_target(&self, _address: u32, _port: u16) -> Result<(), TableError> {
            Err(TableError::Unavailable)
        }

        fn remove_target(&self, _address: u32) -> Result<(), TableError> {
            Err(TableError::Unavailable)
        }
    }

    /// Loopback socket playing the coordinator.
    struct Coordinator {
        socket: UdpSocket,
        agent: Option<SocketAddr>,
    }

    impl Coordinator {
        async fn bind() -> Self {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            Self {
                socket,
                agent: None,
            }
        }

        fn address(&self) -> String {
            self.socket.local_addr().unwrap().to_string()
        }

        async fn recv(&mut self) -> ControlMessage {
            let mut buf = [0u8; 64];
            let (len, from) = timeout(WAIT, self.socket.recv_from(&mut buf))
                .await
                .expect("agent went quiet")
                .unwrap();
            self.agent = Some(from);
            ControlMessage::decode(&buf[..len]).unwrap()
        }

        async fn send_raw(&self, bytes: &[u8]) {
            let agent = self.agent.expect("agent has not spoken yet");
            self.socket.send_to(bytes, agent).await.unwrap();
        }

        async fn send(&self, message: ControlMessage) {
            self.send_raw(&message.encode()).await;
        }
    }

    fn config(coordinator: &Coordinator) -> SessionConfig {
        SessionConfig {
            coordinator: coordinator.address(),
            hello_interval: Duration::from_secs(3600),
            read_timeout: Duration::from_secs(30),
            loop_guard_limit: 30,
        }
    }

    struct Running {
        task: JoinHandle<Result<(), SessionError>>,
        requests: mpsc::Sender<ControlMessage>,
    }

    fn spawn_session<S: TargetSink>(session: Session<S>) -> Running {
        let (tx, mut rx) = mpsc::channel(8);
        let mut session = session;
        let task = tokio::spawn(async move { session.connect(&mut rx).await });
        Running { task, requests: tx }
    }

    async fn eventually(check: impl Fn() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let session = Session::new(
            SessionConfig::default(),
            Arc::new(DetachedSink),
            Arc::new(TargetCache::new()),
            Arc::new(AgentStats::new()),
        );
        let hello = ControlMessage::Hello { peer_cold_count: 0 };
        assert!(matches!(
            session.send(&hello).await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_initial_hello_carries_local_cold_count() {
        let mut coordinator = Coordinator::bind().await;
        let cache = Arc::new(TargetCache::new());
        cache.apply(addr(10, 0, 0, 5), 80, 0);
        cache.apply(addr(10, 0, 0, 6), 80, 0);
        cache.apply(addr(10, 0, 0, 7), 80, 4);
        let stats = Arc::new(AgentStats::new());

        let session = Session::new(
            config(&coordinator),
            Arc::new(DetachedSink),
            cache,
            stats.clone(),
        );
        assert_eq!(session.local_cold_count(), 2);
        let running = spawn_session(session);

        assert_eq!(
            coordinator.recv().await,
            ControlMessage::Hello { peer_cold_count: 2 }
        );
        assert_eq!(stats.session_state(), SessionState::Connected);
        running.task.abort();
    }

    #[tokio::test]
    async fn test_target_updates_reach_kernel_table() {
        let mut coordinator = Coordinator::bind().await;
        let (filter, _events) = FakeFilter::new();
        let table = filter.table.entries.clone();
        let (req_tx, _req_rx) = mpsc::channel(8);
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(AgentStats::new());
        let manager = Arc::new(TargetManager::new(filter, req_tx, fatal_tx, stats.clone()));
        manager.start("eth0").unwrap();

        let cache = Arc::new(TargetCache::new());
        let session = Session::new(config(&coordinator), manager, cache.clone(), stats);
        let running = spawn_session(session);
        coordinator.recv().await;

        coordinator
            .send(ControlMessage::TargetUpdate {
                address: addr(10, 0, 0, 5),
                port: 80,
                replicas: 0,
            })
            .await;
        eventually(|| table.lock().unwrap().get(&addr(10, 0, 0, 5)) == Some(&80)).await;
        assert_eq!(cache.cold_count(), 1);

        coordinator
            .send(ControlMessage::TargetUpdate {
                address: addr(10, 0, 0, 5),
                port: 80,
                replicas: 3,
            })
            .await;
        eventually(|| !table.lock().unwrap().contains_key(&addr(10, 0, 0, 5))).await;
        assert_eq!(cache.cold_count(), 0);
        assert_eq!(cache.len(), 1);

        assert!(!running.task.is_finished());
        running.task.abort();
    }

    #[tokio::test]
    async fn test_table_errors_do_not_end_session() {
        let mut coordinator = Coordinator::bind().await;
        let cache = Arc::new(TargetCache::new());
        let stats = Arc::new(AgentStats::new());
        let session = Session::new(
            config(&coordinator),
            Arc::new(DetachedSink),
            cache.clone(),
            stats.clone(),
        );
        let running = spawn_session(session);
        coordinator.recv().await;

        coordinator
            .send(ControlMessage::TargetUpdate {
                address: addr(10, 0, 0, 9),
                port: 443,
                replicas: 0,
            })
            .await;
        eventually(|| stats.target_update_failures.load(Ordering::Relaxed) == 1).await;

        // Shadow cache is updated regardless, so the next hello agrees.
        assert_eq!(cache.cold_count(), 1);
        coordinator
            .send(ControlMessage::Hello { peer_cold_count: 0 })
            .await;
        assert_eq!(
            coordinator.recv().await,
            ControlMessage::Hello { peer_cold_count: 1 }
        );
        assert!(!running.task.is_finished());
        running.task.abort();
    }

    #[tokio::test]
    async fn test_loop_guard_trips_on_31st_mismatch() {
        let mut coordinator = Coordinator::bind().await;
        let stats = Arc::new(AgentStats::new());
        let session = Session::new(
            config(&coordinator),
            Arc::new(DetachedSink),
            Arc::new(TargetCache::new()),
            stats.clone(),
        );
        let running = spawn_session(session);
        coordinator.recv().await;

        for round in 1..=30 {
            coordinator
                .send(ControlMessage::Hello { peer_cold_count: 9 })
                .await;
            assert_eq!(
                coordinator.recv().await,
                ControlMessage::Hello { peer_cold_count: 0 },
                "no corrective hello in round {round}"
            );
        }
        assert!(!running.task.is_finished());

        coordinator
            .send(ControlMessage::Hello { peer_cold_count: 9 })
            .await;
        let result = timeout(WAIT, running.task).await.unwrap().unwrap();
        assert!(matches!(result, Err(SessionError::LoopGuard(31))));
        assert_eq!(stats.hello_mismatches.load(Ordering::Relaxed), 31);
        // Initial hello plus 30 corrections.
        assert_eq!(stats.hellos_sent.load(Ordering::Relaxed), 31);
        assert_eq!(stats.session_state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_matching_hello_is_not_answered() {
        let mut coordinator = Coordinator::bind().await;
        let stats = Arc::new(AgentStats::new());
        let session = Session::new(
            config(&coordinator),
            Arc::new(DetachedSink),
            Arc::new(TargetCache::new()),
            stats.clone(),
        );
        let running = spawn_session(session);
        coordinator.recv().await;

        for _ in 0..40 {
            coordinator
                .send(ControlMessage::Hello { peer_cold_count: 0 })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stats.hellos_sent.load(Ordering::Relaxed), 1);
        assert_eq!(stats.hello_mismatches.load(Ordering::Relaxed), 0);
        assert!(!running.task.is_finished());
        running.task.abort();
    }

    #[tokio::test]
    async fn test_ticker_hello_resets_loop_guard() {
        let mut coordinator = Coordinator::bind().await;
        let mut cfg = config(&coordinator);
        cfg.hello_interval = Duration::from_millis(300);
        let session = Session::new(
            cfg,
            Arc::new(DetachedSink),
            Arc::new(TargetCache::new()),
            Arc::new(AgentStats::new()),
        );
        let running = spawn_session(session);
        coordinator.recv().await;

        for _ in 0..30 {
            coordinator
                .send(ControlMessage::Hello { peer_cold_count: 5 })
                .await;
            coordinator.recv().await;
        }
        // Periodic hello.
        coordinator.recv().await;

        coordinator
            .send(ControlMessage::Hello { peer_cold_count: 5 })
            .await;
        coordinator.recv().await;
        assert!(!running.task.is_finished());
        running.task.abort();
    }

    #[tokio::test]
    async fn test_unknown_tag_is_ignored() {
        let mut coordinator = Coordinator::bind().await;
        let stats = Arc::new(AgentStats::new());
        let session = Session::new(
            config(&coordinator),
            Arc::new(DetachedSink),
            Arc::new(TargetCache::new()),
            stats.clone(),
        );
        let running = spawn_session(session);
        coordinator.recv().await;

        let mut bogus = [0u8; MESSAGE_LEN];
        bogus[0] = 0x7f;
        coordinator.send_raw(&bogus).await;
        coordinator
            .send(ControlMessage::CaptureRequest {
                address: addr(1, 2, 3, 4),
                port: 1,
            })
            .await;

        // Still alive: a mismatch gets its correction.
        coordinator
            .send(ControlMessage::Hello { peer_cold_count: 1 })
            .await;
        assert_eq!(
            coordinator.recv().await,
            ControlMessage::Hello { peer_cold_count: 0 }
        );
        assert_eq!(stats.unknown_messages.load(Ordering::Relaxed), 2);
        running.task.abort();
    }

    #[tokio::test]
    async fn test_malformed_datagram_ends_session() {
        let mut coordinator = Coordinator::bind().await;
        let session = Session::new(
            config(&coordinator),
            Arc::new(DetachedSink),
            Arc::new(TargetCache::new()),
            Arc::new(AgentStats::new()),
        );
        let running = spawn_session(session);
        coordinator.recv().await;

        coordinator.send_raw(&[0x01, 0x00, 0x01]).await;
        let result = timeout(WAIT, running.task).await.unwrap().unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Malformed(CodecError::Length(3)))
        ));
    }

    #[tokio::test]
    async fn test_silent_coordinator_times_out() {
        let mut coordinator = Coordinator::bind().await;
        let mut cfg = config(&coordinator);
        cfg.read_timeout = Duration::from_millis(200);
        let session = Session::new(
            cfg,
            Arc::new(DetachedSink),
            Arc::new(TargetCache::new()),
            Arc::new(AgentStats::new()),
        );
        let running = spawn_session(session);
        coordinator.recv().await;

        let result = timeout(WAIT, running.task).await.unwrap().unwrap();
        let err = result.unwrap_err();
        assert!(matches!(err, SessionError::ReadTimeout(d) if d == Duration::from_millis(200)));
        assert_eq!(
            err.to_string(),
            "no datagram from coordinator within 200ms"
        );
    }

    #[tokio::test]
    async fn test_capture_requests_are_forwarded() {
        let mut coordinator = Coordinator::bind().await;
        let session = Session::new(
            config(&coordinator),
            Arc::new(DetachedSink),
            Arc::new(TargetCache::new()),
            Arc::new(AgentStats::new()),
        );
        let running = spawn_session(session);
        coordinator.recv().await;

        let request = ControlMessage::CaptureRequest {
            address: addr(10, 0, 0, 5),
            port: 8080,
        };
        running.requests.send(request).await.unwrap();
        assert_eq!(coordinator.recv().await, request);
        running.task.abort();
    }
}
