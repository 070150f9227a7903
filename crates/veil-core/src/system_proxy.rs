//! Host Network Integration
//!
//! Points the operating system's proxy settings at the engine's local
//! inbounds, and puts them back on teardown.
//!
//! # Flow
//!
//! ```text
//! default route ──▶ interface (en0) ──▶ network service ("Wi-Fi")
//!                                              │
//!                        apply: SOCKS, HTTP, HTTPS proxy ──▶ 127.0.0.1
//!                        revert: each setting switched off
//! ```
//!
//! Every host command is independent. A failing command is logged and the
//! sequence carries on, so a half-applied proxy still beats none at all.

use crate::transport::ProxyEndpoints;
use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Service name used when discovery comes up empty
pub const DEFAULT_FALLBACK_SERVICE: &str = "Wi-Fi";

/// Where the manager reconfigures the host network
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// Route user traffic through `endpoints`, returning the service that was
    /// modified so it can be handed back to [`HostNetwork::disable`].
    async fn enable(&self, endpoints: &ProxyEndpoints) -> Result<String, NetworkConfigError>;

    /// Undo every setting on `service`. Best effort.
    async fn disable(&self, service: &str);
}

/// Host operating system flavours with proxy support
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPlatform {
    /// `networksetup` per network service
    MacOs,
    /// GNOME `gsettings`
    Linux,
    Unsupported,
}

impl HostPlatform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            HostPlatform::MacOs
        } else if cfg!(target_os = "linux") {
            HostPlatform::Linux
        } else {
            HostPlatform::Unsupported
        }
    }

    /// Commands that point `service` at the local inbounds
    pub fn apply_commands(&self, service: &str, endpoints: &ProxyEndpoints) -> Vec<HostCommand> {
        let socks_host = endpoints.socks.ip().to_string();
        let socks_port = endpoints.socks.port().to_string();
        let http_host = endpoints.http.ip().to_string();
        let http_port = endpoints.http.port().to_string();

        match self {
            HostPlatform::MacOs => vec![
                HostCommand::new(
                    "networksetup",
                    ["-setsocksfirewallproxy", service, &socks_host, &socks_port],
                ),
                HostCommand::new("networksetup", ["-setwebproxy", service, &http_host, &http_port]),
                HostCommand::new(
                    "networksetup",
                    ["-setsecurewebproxy", service, &http_host, &http_port],
                ),
            ],
            HostPlatform::Linux => vec![
                gsettings("org.gnome.system.proxy.socks", "host", &socks_host),
                gsettings("org.gnome.system.proxy.socks", "port", &socks_port),
                gsettings("org.gnome.system.proxy.http", "host", &http_host),
                gsettings("org.gnome.system.proxy.http", "port", &http_port),
                gsettings("org.gnome.system.proxy.https", "host", &http_host),
                gsettings("org.gnome.system.proxy.https", "port", &http_port),
                gsettings("org.gnome.system.proxy", "mode", "manual"),
            ],
            HostPlatform::Unsupported => Vec::new(),
        }
    }

    /// Commands that switch the proxy settings on `service` back off
    pub fn revert_commands(&self, service: &str) -> Vec<HostCommand> {
        match self {
            HostPlatform::MacOs => vec![
                HostCommand::new("networksetup", ["-setsocksfirewallproxystate", service, "off"]),
                HostCommand::new("networksetup", ["-setwebproxystate", service, "off"]),
                HostCommand::new("networksetup", ["-setsecurewebproxystate", service, "off"]),
            ],
            HostPlatform::Linux => vec![gsettings("org.gnome.system.proxy", "mode", "none")],
            HostPlatform::Unsupported => Vec::new(),
        }
    }
}

fn gsettings(schema: &str, key: &str, value: &str) -> HostCommand {
    HostCommand::new("gsettings", ["set", schema, key, value])
}

/// One invocation of a host configuration tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl HostCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Run with a deadline and return stdout
    pub async fn run(&self, timeout: Duration) -> Result<String, NetworkConfigError> {
        debug!("Running {}", self);

        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(timeout, output)
            .await
            .map_err(|_| NetworkConfigError::Timeout {
                command: self.to_string(),
                timeout,
            })?
            .map_err(|e| NetworkConfigError::Command {
                command: self.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetworkConfigError::Command {
                command: self.to_string(),
                reason: format!("{} {}", output.status, stderr.trim()).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// OS proxy settings driven through the host's own command-line tools
#[derive(Debug, Clone)]
pub struct SystemProxy {
    platform: HostPlatform,
    fallback_service: String,
    command_timeout: Duration,
}

impl SystemProxy {
    pub fn new(fallback_service: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            platform: HostPlatform::current(),
            fallback_service: fallback_service.into(),
            command_timeout,
        }
    }

    pub fn with_platform(mut self, platform: HostPlatform) -> Self {
        self.platform = platform;
        self
    }

    /// Name of the network service carrying the default route
    pub async fn active_service(&self) -> String {
        let discovered = match self.platform {
            HostPlatform::MacOs => self.macos_service().await,
            HostPlatform::Linux => match tokio::fs::read_to_string("/proc/net/route").await {
                Ok(table) => parse_proc_route(&table),
                Err(e) => {
                    debug!("Failed to read routing table: {}", e);
                    None
                }
            },
            HostPlatform::Unsupported => None,
        };

        discovered.unwrap_or_else(|| {
            warn!(
                "Could not resolve the active network service, using {}",
                self.fallback_service
            );
            self.fallback_service.clone()
        })
    }

    async fn macos_service(&self) -> Option<String> {
        let route = HostCommand::new("route", ["-n", "get", "default"]);
        let interface = match route.run(self.command_timeout).await {
            Ok(out) => parse_route_interface(&out)?,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };

        let order = HostCommand::new("networksetup", ["-listnetworkserviceorder"]);
        match order.run(self.command_timeout).await {
            Ok(out) => parse_service_order(&out, &interface),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    /// Run every command, logging failures. Returns how many succeeded.
    async fn run_all(&self, commands: &[HostCommand]) -> usize {
        let mut applied = 0;
        for command in commands {
            match command.run(self.command_timeout).await {
                Ok(_) => applied += 1,
                Err(e) => warn!("{}", e),
            }
        }
        applied
    }

    /// Apply `commands` for `service`; failures are logged and never fatal
    async fn apply(
        &self,
        service: String,
        endpoints: &ProxyEndpoints,
        commands: &[HostCommand],
    ) -> String {
        let applied = self.run_all(commands).await;
        info!(
            "System proxy on {} -> socks {} http {} ({}/{} settings applied)",
            service,
            endpoints.socks,
            endpoints.http,
            applied,
            commands.len()
        );
        service
    }
}

impl Default for SystemProxy {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_SERVICE, Duration::from_secs(5))
    }
}

#[async_trait]
impl HostNetwork for SystemProxy {
    async fn enable(&self, endpoints: &ProxyEndpoints) -> Result<String, NetworkConfigError> {
        let service = self.active_service().await;

        if self.platform == HostPlatform::Unsupported {
            warn!("System proxy is not supported on this platform, configure it manually");
            return Ok(service);
        }

        let commands = self.platform.apply_commands(&service, endpoints);
        Ok(self.apply(service, endpoints, &commands).await)
    }

    async fn disable(&self, service: &str) {
        let commands = self.platform.revert_commands(service);
        if commands.is_empty() {
            return;
        }

        let reverted = self.run_all(&commands).await;
        info!(
            "System proxy disabled on {} ({}/{} settings reverted)",
            service,
            reverted,
            commands.len()
        );
    }
}

/// Interface name from `route -n get default`
pub fn parse_route_interface(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("interface:")
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    })
}

/// Service name bound to `interface` in `networksetup -listnetworkserviceorder`
///
/// ```text
/// (1) Wi-Fi
/// (Hardware Port: Wi-Fi, Device: en0)
/// ```
pub fn parse_service_order(output: &str, interface: &str) -> Option<String> {
    let device = format!("Device: {})", interface);
    let mut current: Option<&str> = None;

    for line in output.lines().map(str::trim) {
        if line.starts_with("(Hardware Port:") {
            if line.ends_with(&device) {
                return current.map(str::to_string);
            }
        } else if let Some(rest) = line.strip_prefix('(') {
            // "(1) Wi-Fi" or "(*) Disabled Service"
            current = rest
                .split_once(')')
                .map(|(_, name)| name.trim())
                .filter(|name| !name.is_empty());
        }
    }

    None
}

/// Interface carrying the default route in `/proc/net/route`
pub fn parse_proc_route(table: &str) -> Option<String> {
    table.lines().skip(1).find_map(|line| {
        let mut fields = line.split_whitespace();
        let iface = fields.next()?;
        let destination = fields.next()?;
        (destination == "00000000").then(|| iface.to_string())
    })
}

/// Host network errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkConfigError {
    #[error("Host command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Host command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalPorts;

    const SERVICE_ORDER: &str = "\
An asterisk (*) denotes that a network service is disabled.
(1) USB 10/100/1000 LAN
(Hardware Port: USB 10/100/1000 LAN, Device: en7)

(2) Wi-Fi
(Hardware Port: Wi-Fi, Device: en0)

(*) Thunderbolt Bridge
(Hardware Port: Thunderbolt Bridge, Device: bridge0)
";

    #[test]
    fn test_parse_route_interface() {
        let output = "   route to: default\ndestination: default\n       mask: default\n    gateway: 192.168.1.1\n  interface: en0\n      flags: <UP,GATEWAY,DONE,STATIC,PRCLONING>\n";
        assert_eq!(parse_route_interface(output).as_deref(), Some("en0"));
        assert_eq!(parse_route_interface("route: writing to routing socket: not in table"), None);
    }

    #[test]
    fn test_parse_service_order() {
        assert_eq!(parse_service_order(SERVICE_ORDER, "en0").as_deref(), Some("Wi-Fi"));
        assert_eq!(
            parse_service_order(SERVICE_ORDER, "en7").as_deref(),
            Some("USB 10/100/1000 LAN")
        );
        assert_eq!(
            parse_service_order(SERVICE_ORDER, "bridge0").as_deref(),
            Some("Thunderbolt Bridge")
        );
        // Unknown interface
        assert_eq!(parse_service_order(SERVICE_ORDER, "en1"), None);
    }

    #[test]
    fn test_parse_proc_route() {
        let table = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask
docker0\t000011AC\t00000000\t0001\t0\t0\t0\t0000FFFF
wlp2s0\t00000000\t0101A8C0\t0003\t0\t0\t600\t00000000
";
        assert_eq!(parse_proc_route(table).as_deref(), Some("wlp2s0"));
        assert_eq!(parse_proc_route("Iface\tDestination\n"), None);
    }

    #[test]
    fn test_macos_commands_pair_up() {
        let endpoints = LocalPorts::default().proxy_endpoints();
        let apply = HostPlatform::MacOs.apply_commands("Wi-Fi", &endpoints);
        let revert = HostPlatform::MacOs.revert_commands("Wi-Fi");

        assert_eq!(apply.len(), revert.len());
        assert_eq!(
            apply[0].to_string(),
            "networksetup -setsocksfirewallproxy Wi-Fi 127.0.0.1 10808"
        );
        assert_eq!(apply[1].to_string(), "networksetup -setwebproxy Wi-Fi 127.0.0.1 10809");
        assert_eq!(apply[2].args[0], "-setsecurewebproxy");
        assert_eq!(revert[0].args, vec!["-setsocksfirewallproxystate", "Wi-Fi", "off"]);
    }

    #[test]
    fn test_linux_commands() {
        let endpoints = LocalPorts::default().proxy_endpoints();
        let apply = HostPlatform::Linux.apply_commands("eth0", &endpoints);

        assert!(apply.iter().all(|c| c.program == "gsettings"));
        assert_eq!(
            apply.last().map(|c| c.to_string()).as_deref(),
            Some("gsettings set org.gnome.system.proxy mode manual")
        );
        assert!(apply.contains(&gsettings("org.gnome.system.proxy.socks", "port", "10808")));
        assert_eq!(
            HostPlatform::Linux.revert_commands("eth0"),
            vec![gsettings("org.gnome.system.proxy", "mode", "none")]
        );
    }

    #[tokio::test]
    async fn test_unsupported_platform_uses_fallback() {
        let proxy = SystemProxy::new("Ethernet", Duration::from_secs(1))
            .with_platform(HostPlatform::Unsupported);
        let endpoints = LocalPorts::default().proxy_endpoints();

        assert_eq!(proxy.enable(&endpoints).await.unwrap(), "Ethernet");
        proxy.disable("Ethernet").await;
    }

    #[tokio::test]
    async fn test_command_failures() {
        let missing = HostCommand::new("/nonexistent/veil-host-tool", ["--help"]);
        assert!(matches!(
            missing.run(Duration::from_secs(1)).await,
            Err(NetworkConfigError::Command { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failures_do_not_stop_the_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("ran.log");
        let step = |name: &str, code: i32| {
            let script = format!("echo {} >> '{}'; exit {}", name, log.display(), code);
            HostCommand::new("/bin/sh", ["-c".to_string(), script])
        };

        let proxy = SystemProxy::new("Fallback", Duration::from_secs(5));
        let commands = vec![
            step("first", 1),
            HostCommand::new("/nonexistent/veil-host-tool", ["-setwebproxy"]),
            step("second", 0),
            step("third", 2),
            step("fourth", 0),
        ];

        assert_eq!(proxy.run_all(&commands).await, 2);
        let ran = std::fs::read_to_string(&log).unwrap();
        assert_eq!(ran.lines().collect::<Vec<_>>(), ["first", "second", "third", "fourth"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_apply_succeeds_when_every_command_fails() {
        let proxy = SystemProxy::new("Fallback", Duration::from_millis(500));
        let endpoints = LocalPorts::default().proxy_endpoints();
        let commands = vec![
            HostCommand::new("/bin/sh", ["-c", "exit 1"]),
            HostCommand::new("/nonexistent/veil-host-tool", ["-setsocksfirewallproxy"]),
            HostCommand::new("/bin/sh", ["-c", "sleep 5"]),
        ];

        let service = proxy.apply("Fallback".into(), &endpoints, &commands).await;
        assert_eq!(service, "Fallback");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_timeout_and_status() {
        let slow = HostCommand::new("/bin/sh", ["-c", "sleep 5"]);
        assert!(matches!(
            slow.run(Duration::from_millis(100)).await,
            Err(NetworkConfigError::Timeout { .. })
        ));

        let failing = HostCommand::new("/bin/sh", ["-c", "echo nope >&2; exit 4"]);
        let err = failing.run(Duration::from_secs(5)).await.unwrap_err();
        assert!(err.to_string().contains("nope"));

        let ok = HostCommand::new("/bin/sh", ["-c", "echo interface: en0"]);
        let out = ok.run(Duration::from_secs(5)).await.unwrap();
        assert_eq!(parse_route_interface(&out).as_deref(), Some("en0"));
    }
}
