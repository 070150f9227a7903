//! Veil Core - Local VPN Connection Supervisor
//!
//! Turns a shareable connection link into a running proxy engine and routes
//! the host's traffic through it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     ConnectionManager                        │
//! │                                                              │
//! │  vless://…  ┌────────────┐   ┌──────────────┐                │
//! │ ──────────▶ │ descriptor │──▶│  transport   │                │
//! │             └────────────┘   └──────┬───────┘                │
//! │                                     │ JSON                   │
//! │  ┌──────────┐   statsquery   ┌──────▼───────┐  ┌───────────┐ │
//! │  │  stats   │◀──────────────▶│  supervisor  │  │  system   │ │
//! │  └──────────┘                └──────┬───────┘  │  proxy    │ │
//! │                                     │          └─────┬─────┘ │
//! └─────────────────────────────────────│────────────────│───────┘
//!                                       ▼                ▼
//!                              ┌─────────────────┐  OS proxy settings
//!                              │  proxy engine   │  (SOCKS, HTTP, HTTPS)
//!                              │ 127.0.0.1:10808 │
//!                              └─────────────────┘
//! ```
//!
//! # Features
//!
//! - **Link parsing**: `vless://` links with TLS, REALITY, WebSocket, gRPC
//! - **Engine supervision**: readiness detection, crash detection, graceful stop
//! - **System proxy**: per-service settings with symmetric teardown
//! - **Traffic accounting**: live session counters and persisted totals

mod config;
mod descriptor;
mod manager;
mod readiness;
mod stats;
mod supervisor;
mod system_proxy;
mod transport;

#[cfg(test)]
mod testing;

pub use config::{
    EngineSettings, LoggingSettings, NetworkSettings, Settings, SettingsError, StatsSettings,
};
pub use descriptor::{
    ConnectionDescriptor, DEFAULT_LABEL, DEFAULT_TLS_FINGERPRINT, ParseError, RealityParams,
    Scheme, Security, TlsParams, Transport,
};
pub use manager::{ConnectError, ConnectionManager, ConnectionState, ConnectionStatus};
pub use readiness::{DiagnosticExtractor, FailureLineExtractor, MarkerProbe, ReadinessProbe};
pub use stats::{
    DOWNLINK_PATTERN, StatsCollector, StatsError, StatsStore, TrafficStats, TrafficTotals,
    UPLINK_PATTERN, format_bytes,
};
pub use supervisor::{
    CrashReport, EngineCommand, EngineHandle, EngineOutput, ProcessState, ProcessWatch,
    StartError, Supervisor,
};
pub use system_proxy::{
    DEFAULT_FALLBACK_SERVICE, HostCommand, HostNetwork, HostPlatform, NetworkConfigError,
    SystemProxy,
};
pub use transport::{
    BLOCK_TAG, CONTROL_TAG, DIRECT_TAG, HTTP_INBOUND_TAG, Inbound, LocalPorts, Outbound,
    PRIVATE_RANGES, PROXY_TAG, ProxyEndpoints, Routing, RoutingRule, SOCKS_INBOUND_TAG,
    TransportConfig, TransportConfigBuilder,
};
