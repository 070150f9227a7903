//! Test fixtures: a shell-script engine and a recording host network.

use crate::descriptor::ConnectionDescriptor;
use crate::supervisor::EngineCommand;
use crate::system_proxy::{HostNetwork, NetworkConfigError};
use crate::transport::ProxyEndpoints;
use async_trait::async_trait;
use std::sync::Mutex;

pub(crate) const TLS_URI: &str =
    "vless://5f2a1c7e-9b1d-4c3e-8f00-1234567890ab@example.com:443?security=tls&type=tcp#Label";

/// Answers stats queries and reports itself started like a real engine
pub(crate) const READY_ENGINE: &str = r#"
if [ "$1" = "api" ]; then
  case "$*" in
    *uplink*) echo '{"stat":[{"name":"outbound>>>proxy>>>traffic>>>uplink","value":"1024"}]}' ;;
    *downlink*) echo '{"stat":[{"name":"outbound>>>proxy>>>traffic>>>downlink","value":4096}]}' ;;
  esac
  exit 0
fi
echo "Xray 1.8.24 (Xray, Penetrates Everything.)"
echo "[Warning] core: Xray 1.8.24 started"
exec sleep 30
"#;

/// Runs `script` through `/bin/sh` with the engine arguments as `$1..`
pub(crate) fn engine(script: &str) -> EngineCommand {
    EngineCommand::new("/bin/sh", ["-c", script, "engine"])
}

pub(crate) fn descriptor() -> ConnectionDescriptor {
    ConnectionDescriptor::parse(TLS_URI).unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NetworkCall {
    Enable(ProxyEndpoints),
    Disable(String),
}

/// Records every call instead of touching the host
#[derive(Debug, Default)]
pub(crate) struct RecordingNetwork {
    calls: Mutex<Vec<NetworkCall>>,
    fail_enable: bool,
}

impl RecordingNetwork {
    pub(crate) fn failing() -> Self {
        Self {
            fail_enable: true,
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<NetworkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn enables(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, NetworkCall::Enable(_)))
            .count()
    }
}

#[async_trait]
impl HostNetwork for RecordingNetwork {
    async fn enable(&self, endpoints: &ProxyEndpoints) -> Result<String, NetworkConfigError> {
        self.calls.lock().unwrap().push(NetworkCall::Enable(*endpoints));
        if self.fail_enable {
            return Err(NetworkConfigError::Command {
                command: "networksetup -setwebproxy".into(),
                reason: "permission denied".into(),
            });
        }
        Ok("Test Service".into())
    }

    async fn disable(&self, service: &str) {
        self.calls.lock().unwrap().push(NetworkCall::Disable(service.to_string()));
    }
}
