//! Traffic Statistics
//!
//! Session counters come from the engine's control endpoint; cumulative
//! counters live in a small JSON record that survives restarts.
//!
//! # Lifecycle
//!
//! ```text
//! load record ──▶ [session: poll engine] ──fold──▶ save record
//! ```
//!
//! Folding happens once per session, right before the engine is stopped.
//! A failed query reads as zero rather than an error.

use crate::supervisor::EngineHandle;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bytes sent through the proxy outbound
pub const UPLINK_PATTERN: &str = "outbound>>>proxy>>>traffic>>>uplink";

/// Bytes received through the proxy outbound
pub const DOWNLINK_PATTERN: &str = "outbound>>>proxy>>>traffic>>>downlink";

/// An uplink/downlink pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficTotals {
    #[serde(default)]
    pub uplink: u64,
    #[serde(default)]
    pub downlink: u64,
}

impl TrafficTotals {
    pub fn new(uplink: u64, downlink: u64) -> Self {
        Self { uplink, downlink }
    }

    pub fn saturating_add(self, other: TrafficTotals) -> TrafficTotals {
        TrafficTotals {
            uplink: self.uplink.saturating_add(other.uplink),
            downlink: self.downlink.saturating_add(other.downlink),
        }
    }

    pub fn total(&self) -> u64 {
        self.uplink.saturating_add(self.downlink)
    }
}

/// Everything a caller can display about traffic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficStats {
    pub cumulative_uplink: u64,
    pub cumulative_downlink: u64,
    /// Zero while disconnected
    pub session_uplink: u64,
    pub session_downlink: u64,
}

impl TrafficStats {
    pub fn new(cumulative: TrafficTotals, session: TrafficTotals) -> Self {
        Self {
            cumulative_uplink: cumulative.uplink,
            cumulative_downlink: cumulative.downlink,
            session_uplink: session.uplink,
            session_downlink: session.downlink,
        }
    }
}

/// Durable record of cumulative totals
#[derive(Debug, Clone)]
pub struct StatsStore {
    path: PathBuf,
}

impl StatsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/veil/traffic.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("veil").join("traffic.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable records count as zero
    pub fn load(&self) -> TrafficTotals {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(totals) => totals,
                Err(e) => {
                    warn!("Ignoring corrupt traffic record {}: {}", self.path.display(), e);
                    TrafficTotals::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TrafficTotals::default(),
            Err(e) => {
                warn!("Failed to read traffic record {}: {}", self.path.display(), e);
                TrafficTotals::default()
            }
        }
    }

    /// Replace the record atomically
    pub fn save(&self, totals: &TrafficTotals) -> Result<(), StatsError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(totals)?)?;
        std::fs::rename(&tmp, &self.path)?;

        Ok(())
    }
}

/// Reads session counters and keeps the cumulative record
#[derive(Debug)]
pub struct StatsCollector {
    store: StatsStore,
    cumulative: Mutex<TrafficTotals>,
    query_timeout: Duration,
}

impl StatsCollector {
    /// Loads the cumulative totals from `store`
    pub fn new(store: StatsStore, query_timeout: Duration) -> Self {
        let cumulative = store.load();
        debug!(
            "Loaded traffic record {} (up {}, down {})",
            store.path().display(),
            cumulative.uplink,
            cumulative.downlink
        );

        Self {
            store,
            cumulative: Mutex::new(cumulative),
            query_timeout,
        }
    }

    pub fn cumulative(&self) -> TrafficTotals {
        *self.cumulative.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sum of all counters matching `pattern`, zero on failure
    pub async fn query(&self, handle: &EngineHandle, pattern: &str) -> u64 {
        match self.try_query(handle, pattern).await {
            Ok(value) => value,
            Err(e) => {
                debug!("Stats query for {} failed: {}", pattern, e);
                0
            }
        }
    }

    pub async fn try_query(&self, handle: &EngineHandle, pattern: &str) -> Result<u64, StatsError> {
        let output = handle
            .engine
            .command()
            .arg("api")
            .arg("statsquery")
            .arg(format!("--server={}", handle.control))
            .arg("-pattern")
            .arg(pattern)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.query_timeout, output)
            .await
            .map_err(|_| StatsError::Timeout(self.query_timeout))??;

        if !output.status.success() {
            return Err(StatsError::Engine(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        parse_stats_response(&String::from_utf8_lossy(&output.stdout))
    }

    pub async fn session_snapshot(&self, handle: &EngineHandle) -> TrafficTotals {
        let (uplink, downlink) = tokio::join!(
            self.query(handle, UPLINK_PATTERN),
            self.query(handle, DOWNLINK_PATTERN)
        );
        TrafficTotals::new(uplink, downlink)
    }

    /// Add a finished session to the cumulative totals and persist them
    pub fn fold_into_cumulative(&self, session: TrafficTotals) -> TrafficTotals {
        let totals = {
            let mut cumulative = self.cumulative.lock().unwrap_or_else(PoisonError::into_inner);
            *cumulative = cumulative.saturating_add(session);
            *cumulative
        };

        match self.store.save(&totals) {
            Ok(()) => info!(
                "Session traffic up {} down {} (total up {} down {})",
                format_bytes(session.uplink),
                format_bytes(session.downlink),
                format_bytes(totals.uplink),
                format_bytes(totals.downlink)
            ),
            Err(e) => warn!(
                "Failed to save traffic record {}: {}",
                self.store.path().display(),
                e
            ),
        }

        totals
    }
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(default)]
    stat: Vec<StatEntry>,
}

#[derive(Debug, Deserialize)]
struct StatEntry {
    #[serde(default)]
    value: Option<StatValue>,
}

/// Engines print counters either as JSON numbers or as strings
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StatValue {
    Number(u64),
    Text(String),
}

/// Sum of every counter in a `statsquery` response
pub fn parse_stats_response(output: &str) -> Result<u64, StatsError> {
    if output.trim().is_empty() {
        return Ok(0);
    }

    let response: StatsResponse = serde_json::from_str(output)?;
    response.stat.iter().try_fold(0u64, |sum, entry| {
        let value = match &entry.value {
            None => 0,
            Some(StatValue::Number(n)) => *n,
            Some(StatValue::Text(text)) => text
                .trim()
                .parse()
                .map_err(|_| StatsError::Value(text.clone()))?,
        };
        Ok(sum.saturating_add(value))
    })
}

/// Human-readable byte count, 1024-based
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Stats errors. Never surfaced to callers of the manager.
#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Stats query timed out after {0:?}")]
    Timeout(Duration),

    #[error("Engine rejected stats query: {0}")]
    Engine(String),

    #[error("Invalid counter value: {0}")]
    Value(String),
}
