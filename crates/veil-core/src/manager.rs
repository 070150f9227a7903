//! Connection Manager
//!
//! Composes the parser, config builder, supervisor, host integration and
//! stats collector into the one object callers talk to.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──▶ Connected
//!      ▲                        │              │
//!      │                        ▼              │ crash
//!      └───────disconnect──── Error ◀──────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = ConnectionManager::with_system_proxy(Settings::default());
//! manager.connect("vless://uuid@host:443?security=tls#Home").await?;
//!
//! let stats = manager.stats().await;
//! println!("{} bytes down this session", stats.session_downlink);
//!
//! manager.disconnect().await;
//! ```
//!
//! At most one session exists at a time. `connect` and `disconnect` are
//! serialized by the session lock; `status` never waits on it.

use crate::config::Settings;
use crate::descriptor::{ConnectionDescriptor, ParseError};
use crate::stats::{StatsCollector, StatsStore, TrafficStats, TrafficTotals};
use crate::supervisor::{
    CrashReport, EngineHandle, EngineOutput, ProcessWatch, StartError, Supervisor,
};
use crate::system_proxy::{HostNetwork, NetworkConfigError, SystemProxy};
use crate::transport::TransportConfigBuilder;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

/// Connection state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No session
    #[default]
    Disconnected,
    /// Engine starting, host not yet reconfigured
    Connecting,
    /// Traffic flowing through the engine
    Connected,
    /// Last connect failed or the engine crashed
    Error,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ConnectionState::Error)
    }
}

/// What callers see
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Set only in [`ConnectionState::Error`]
    pub error: Option<String>,
    /// Display name of the server being used or last attempted
    pub server: Option<String>,
}

/// Connect failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    #[error("Invalid connection link: {0}")]
    Parse(#[from] ParseError),

    #[error("{0}")]
    Start(#[from] StartError),

    #[error("Failed to configure system proxy: {0}")]
    Network(#[from] NetworkConfigError),

    #[error("Proxy engine crashed ({0})")]
    Crashed(CrashReport),
}

struct Session {
    id: u64,
    descriptor: ConnectionDescriptor,
    supervisor: Supervisor,
    /// Service the host integration modified
    service: String,
}

/// Lock-free view of the current session for readers
#[derive(Default)]
struct LiveView {
    handle: Option<EngineHandle>,
    connected_at: Option<Instant>,
    /// Kept after the session ends so failures can be inspected
    output: Option<EngineOutput>,
}

struct Inner {
    settings: Settings,
    network: Arc<dyn HostNetwork>,
    builder: TransportConfigBuilder,
    collector: StatsCollector,
    /// Held for the whole of every connect, disconnect and crash teardown
    session: Mutex<Option<Session>>,
    status: watch::Sender<ConnectionStatus>,
    live: RwLock<LiveView>,
    next_session: AtomicU64,
}

/// The connection supervisor exposed to the application
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(settings: Settings, network: Arc<dyn HostNetwork>) -> Self {
        let builder = TransportConfigBuilder::new(settings.ports)
            .with_log_level(settings.engine.log_level.clone());
        let collector = StatsCollector::new(
            StatsStore::new(settings.stats_record_path()),
            settings.query_timeout(),
        );
        let (status, _) = watch::channel(ConnectionStatus::default());

        Self {
            inner: Arc::new(Inner {
                settings,
                network,
                builder,
                collector,
                session: Mutex::new(None),
                status,
                live: RwLock::new(LiveView::default()),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Manager that reconfigures the real host proxy settings
    pub fn with_system_proxy(settings: Settings) -> Self {
        let network = SystemProxy::new(
            settings.network.fallback_service.clone(),
            settings.command_timeout(),
        );
        Self::new(settings, Arc::new(network))
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status().state.is_connected()
    }

    /// Receive every status change
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Time since the current session reached `Connected`
    pub fn connection_duration(&self) -> Option<Duration> {
        self.inner.read_live(|live| live.connected_at.map(|t| t.elapsed()))
    }

    /// Recent output of the current or most recent engine
    pub fn engine_output(&self) -> Vec<String> {
        self.inner
            .read_live(|live| live.output.clone())
            .map(|output| output.lines())
            .unwrap_or_default()
    }

    /// Cumulative totals plus live session counters
    pub async fn stats(&self) -> TrafficStats {
        let handle = self.inner.read_live(|live| live.handle.clone());
        let session = match handle {
            Some(handle) => self.inner.collector.session_snapshot(&handle).await,
            None => TrafficTotals::default(),
        };
        TrafficStats::new(self.inner.collector.cumulative(), session)
    }

    /// Connect to the server described by `uri`, replacing any active session.
    ///
    /// On failure everything started so far is torn down and the status is
    /// left in [`ConnectionState::Error`].
    pub async fn connect(&self, uri: &str) -> Result<(), ConnectError> {
        let inner = &self.inner;
        let mut slot = inner.session.lock().await;

        // Parsed up front so a bad link never reaches the engine or the host
        let parsed = ConnectionDescriptor::parse(uri);

        if slot.is_some() {
            info!("Replacing the active session");
            inner.teardown(&mut slot).await;
        }

        let descriptor = match parsed {
            Ok(descriptor) => descriptor,
            Err(e) => return Err(inner.fail(e.into(), None)),
        };
        let server = descriptor.to_string();

        info!("Connecting to {}", server);
        inner.set_status(ConnectionState::Connecting, None, Some(server.clone()));

        let config = inner.builder.build(&descriptor);
        let mut supervisor = Supervisor::new(inner.settings.engine_command())
            .with_readiness_timeout(inner.settings.readiness_timeout())
            .with_stop_grace(inner.settings.stop_grace());
        inner.write_live(|live| live.output = Some(supervisor.output()));

        let handle = match supervisor.start(&config).await {
            Ok(handle) => handle,
            Err(e) => return Err(inner.fail(e.into(), Some(server))),
        };

        let endpoints = inner.builder.ports().proxy_endpoints();
        let service = match inner.network.enable(&endpoints).await {
            Ok(service) => service,
            Err(e) => {
                supervisor.stop().await;
                inner.network.disable(&inner.settings.network.fallback_service).await;
                return Err(inner.fail(e.into(), Some(server)));
            }
        };

        let id = inner.next_session.fetch_add(1, Ordering::Relaxed);
        let watch = supervisor.watch();
        *slot = Some(Session {
            id,
            descriptor,
            supervisor,
            service,
        });
        inner.write_live(|live| {
            live.handle = Some(handle);
            live.connected_at = Some(Instant::now());
        });
        inner.set_status(ConnectionState::Connected, None, Some(server.clone()));

        tokio::spawn(watch_for_crash(Arc::downgrade(inner), id, watch));

        info!(
            "Connected to {} (socks {}, http {})",
            server, endpoints.socks, endpoints.http
        );
        Ok(())
    }

    /// Tear down the current session. Safe to call in any state.
    pub async fn disconnect(&self) {
        let mut slot = self.inner.session.lock().await;
        if slot.is_some() {
            self.inner.teardown(&mut slot).await;
            info!("Disconnected");
        }
        self.inner.set_status(ConnectionState::Disconnected, None, None);
    }
}

impl Inner {
    fn set_status(&self, state: ConnectionState, error: Option<String>, server: Option<String>) {
        debug!("Connection state -> {:?}", state);
        self.status.send_replace(ConnectionStatus {
            state,
            error,
            server,
        });
    }

    fn fail(&self, err: ConnectError, server: Option<String>) -> ConnectError {
        error!("Connection failed: {}", err);
        self.set_status(ConnectionState::Error, Some(err.to_string()), server);
        err
    }

    fn read_live<T>(&self, f: impl FnOnce(&LiveView) -> T) -> T {
        f(&self.live.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write_live(&self, f: impl FnOnce(&mut LiveView)) {
        f(&mut self.live.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Fold stats, stop the engine, restore the host proxy settings
    async fn teardown(&self, slot: &mut Option<Session>) {
        let Some(mut session) = slot.take() else {
            return;
        };

        let (handle, connected_at) = {
            let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
            (live.handle.take(), live.connected_at.take())
        };

        let delta = match handle {
            Some(handle) if session.supervisor.state().is_running() => {
                self.collector.session_snapshot(&handle).await
            }
            _ => TrafficTotals::default(),
        };
        self.collector.fold_into_cumulative(delta);

        session.supervisor.stop().await;
        self.network.disable(&session.service).await;

        info!(
            "Session {} to {} closed after {:?}",
            session.id,
            session.descriptor.endpoint(),
            connected_at.map(|t| t.elapsed()).unwrap_or_default()
        );
    }
}

/// Tears the session down if its engine dies on its own
async fn watch_for_crash(inner: Weak<Inner>, id: u64, mut watch: ProcessWatch) {
    let Some(report) = watch.crashed().await else {
        return;
    };
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let mut slot = inner.session.lock().await;
    if slot.as_ref().map(|s| s.id) != Some(id) {
        debug!("Session {} already replaced, ignoring its crash", id);
        return;
    }

    let server = slot.as_ref().map(|s| s.descriptor.to_string());
    let err = ConnectError::Crashed(report);
    warn!("{}, disconnecting", err);

    inner.teardown(&mut slot).await;
    inner.set_status(ConnectionState::Error, Some(err.to_string()), server);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(ConnectionState::Error.is_error());
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_status_serialization() {
        let status = ConnectionStatus {
            state: ConnectionState::Error,
            error: Some("boom".into()),
            server: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "error");
        assert_eq!(json["error"], "boom");
    }

    #[cfg(unix)]
    mod engine {
        use super::*;
        use crate::descriptor::Scheme;
        use crate::testing::{NetworkCall, READY_ENGINE, RecordingNetwork, TLS_URI};
        use crate::transport::LocalPorts;
        use tempfile::TempDir;

        /// Starts, but reports no traffic
        const QUIET_ENGINE: &str = r#"
if [ "$1" = "api" ]; then exit 0; fi
echo "Xray 1.8.24 started"
exec sleep 30
"#;

        fn settings(dir: &TempDir, script: &str) -> Settings {
            let mut settings = Settings::default();
            settings.engine.binary = "/bin/sh".into();
            settings.engine.extra_args = vec!["-c".into(), script.into(), "engine".into()];
            settings.engine.readiness_timeout_ms = 10_000;
            settings.engine.stop_grace_ms = 2_000;
            settings.stats.record_path = Some(dir.path().join("traffic.json"));
            settings
        }

        fn manager(script: &str) -> (TempDir, Arc<RecordingNetwork>, ConnectionManager) {
            let dir = tempfile::tempdir().unwrap();
            let network = Arc::new(RecordingNetwork::default());
            let manager = ConnectionManager::new(settings(&dir, script), network.clone());
            (dir, network, manager)
        }

        fn enable() -> NetworkCall {
            NetworkCall::Enable(LocalPorts::default().proxy_endpoints())
        }

        fn disable() -> NetworkCall {
            NetworkCall::Disable("Test Service".into())
        }

        #[tokio::test]
        async fn test_disconnect_is_idempotent() {
            let (_dir, network, manager) = manager(READY_ENGINE);

            manager.disconnect().await;
            manager.disconnect().await;

            assert_eq!(manager.status(), ConnectionStatus::default());
            assert!(network.calls().is_empty());
        }

        #[tokio::test]
        async fn test_connect_then_disconnect() {
            let (_dir, network, manager) = manager(QUIET_ENGINE);

            manager.connect(TLS_URI).await.unwrap();
            let status = manager.status();
            assert_eq!(status.state, ConnectionState::Connected);
            assert_eq!(status.error, None);
            assert!(status.server.unwrap().contains("Label"));
            assert!(manager.connection_duration().is_some());
            assert!(manager.engine_output().iter().any(|l| l.contains("started")));
            assert_eq!(network.calls(), vec![enable()]);

            manager.disconnect().await;
            assert_eq!(manager.status().state, ConnectionState::Disconnected);
            assert_eq!(network.calls(), vec![enable(), disable()]);
            assert!(manager.connection_duration().is_none());

            let stats = manager.stats().await;
            assert_eq!(stats.session_uplink, 0);
            assert_eq!(stats.session_downlink, 0);
            assert_eq!(stats.cumulative_uplink, 0);

            manager.disconnect().await;
            assert_eq!(network.calls().len(), 2);
        }

        #[tokio::test]
        async fn test_session_stats_fold_into_cumulative() {
            let (dir, _network, manager) = manager(READY_ENGINE);

            manager.connect(TLS_URI).await.unwrap();
            let live = manager.stats().await;
            assert_eq!((live.session_uplink, live.session_downlink), (1024, 4096));
            assert_eq!(live.cumulative_uplink, 0);

            let mut previous = 0;
            manager.disconnect().await;
            for _ in 0..2 {
                let stats = manager.stats().await;
                assert!(stats.cumulative_uplink > previous);
                assert_eq!(stats.session_uplink, 0);
                previous = stats.cumulative_uplink;

                manager.connect(TLS_URI).await.unwrap();
                manager.disconnect().await;
            }
            assert_eq!(manager.stats().await.cumulative_downlink, 3 * 4096);

            let record = StatsStore::new(dir.path().join("traffic.json")).load();
            assert_eq!(record, TrafficTotals::new(3 * 1024, 3 * 4096));
        }

        #[tokio::test]
        async fn test_reconnect_tears_down_first() {
            let (_dir, network, manager) = manager(QUIET_ENGINE);

            manager.connect(TLS_URI).await.unwrap();
            manager.connect(TLS_URI).await.unwrap();

            assert_eq!(network.calls(), vec![enable(), disable(), enable()]);
            assert!(manager.is_connected());

            manager.disconnect().await;
            assert_eq!(network.calls(), vec![enable(), disable(), enable(), disable()]);
        }

        fn is_alive(pid: i32) -> bool {
            nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
        }

        #[tokio::test]
        async fn test_reconnect_stops_previous_engine() {
            let dir = tempfile::tempdir().unwrap();
            let pids = dir.path().join("engine.pids");
            let script = format!(
                "if [ \"$1\" = \"api\" ]; then exit 0; fi\n\
                 echo $$ >> '{}'\n\
                 echo 'Xray started'\n\
                 exec sleep 30\n",
                pids.display()
            );
            let network = Arc::new(RecordingNetwork::default());
            let manager = ConnectionManager::new(settings(&dir, &script), network);

            manager.connect(TLS_URI).await.unwrap();
            manager.connect(TLS_URI).await.unwrap();

            let started: Vec<i32> = std::fs::read_to_string(&pids)
                .unwrap()
                .lines()
                .map(|l| l.trim().parse().unwrap())
                .collect();
            assert_eq!(started.len(), 2);
            assert!(!is_alive(started[0]));
            assert!(is_alive(started[1]));

            manager.disconnect().await;
            assert!(!is_alive(started[1]));
        }

        #[tokio::test]
        async fn test_unsupported_scheme_has_no_side_effects() {
            let (_dir, network, manager) = manager(READY_ENGINE);

            let err = manager
                .connect("trojan://secret@example.com:443#Other")
                .await
                .unwrap_err();
            assert!(matches!(err, ConnectError::Parse(ParseError::UnsupportedScheme(_))));
            assert!(Scheme::from_name("trojan").is_none());

            let status = manager.status();
            assert_eq!(status.state, ConnectionState::Error);
            assert!(status.error.is_some());
            assert!(network.calls().is_empty());
            assert!(manager.engine_output().is_empty());

            manager.disconnect().await;
            assert_eq!(manager.status().state, ConnectionState::Disconnected);
        }

        #[tokio::test]
        async fn test_start_failure_reports_diagnostic() {
            let script = "echo 'Failed to start: infra/conf: failed to parse json config' >&2; exit 23";
            let (_dir, network, manager) = manager(script);

            let err = manager.connect(TLS_URI).await.unwrap_err();
            assert!(matches!(err, ConnectError::Start(StartError::Exited { code: Some(23), .. })));

            let status = manager.status();
            assert_eq!(status.state, ConnectionState::Error);
            assert!(status.error.unwrap().contains("failed to parse json config"));
            assert!(network.calls().is_empty());
            assert!(!manager.engine_output().is_empty());
        }

        #[tokio::test]
        async fn test_network_failure_cleans_up() {
            let dir = tempfile::tempdir().unwrap();
            let network = Arc::new(RecordingNetwork::failing());
            let manager = ConnectionManager::new(settings(&dir, QUIET_ENGINE), network.clone());

            let err = manager.connect(TLS_URI).await.unwrap_err();
            assert!(matches!(err, ConnectError::Network(_)));
            assert_eq!(manager.status().state, ConnectionState::Error);
            assert_eq!(
                network.calls(),
                vec![enable(), NetworkCall::Disable("Wi-Fi".into())]
            );
            assert_eq!(network.enables(), 1);
        }

        #[tokio::test]
        async fn test_crash_moves_to_error() {
            let script = "echo 'Xray started'; sleep 0.3; echo 'panic: out of memory' >&2; exit 3";
            let (_dir, network, manager) = manager(script);
            let mut status = manager.subscribe();

            manager.connect(TLS_URI).await.unwrap();

            let crashed = tokio::time::timeout(
                Duration::from_secs(10),
                status.wait_for(|s| s.state == ConnectionState::Error),
            )
            .await
            .unwrap()
            .unwrap()
            .clone();

            let message = crashed.error.unwrap();
            assert!(message.contains("exit code 3"));
            assert!(message.contains("panic: out of memory"));
            assert_eq!(network.calls(), vec![enable(), disable()]);

            manager.disconnect().await;
            assert_eq!(manager.status().state, ConnectionState::Disconnected);
            assert_eq!(network.calls().len(), 2);
        }
    }
}
