//! Transport Config Builder
//!
//! Expands a [`ConnectionDescriptor`] into the JSON document the proxy
//! engine is launched with.
//!
//! # Layout
//!
//! ```text
//! inbounds                     outbounds            routing
//! ┌──────────────────────┐     ┌────────────────┐   ┌─────────────────────────────┐
//! │ socks-in  :socks     │────▶│ proxy (vless)  │◀──│ default                     │
//! │ http-in   :http      │     │ direct         │◀──│ ip in private ranges        │
//! │ api       :control   │     │ block          │   │ inboundTag api -> api       │
//! └──────────────────────┘     └────────────────┘   └─────────────────────────────┘
//! ```
//!
//! All inbounds listen on loopback. Ports come from [`LocalPorts`], which the
//! connection manager owns; two managers with the same ports cannot run at
//! the same time.

use crate::descriptor::{ConnectionDescriptor, Security, Transport};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub const PROXY_TAG: &str = "proxy";
pub const DIRECT_TAG: &str = "direct";
pub const BLOCK_TAG: &str = "block";
pub const CONTROL_TAG: &str = "api";
pub const SOCKS_INBOUND_TAG: &str = "socks-in";
pub const HTTP_INBOUND_TAG: &str = "http-in";

/// Address ranges that never leave the host network
pub const PRIVATE_RANGES: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Local listening ports of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalPorts {
    /// SOCKS inbound
    pub socks: u16,
    /// HTTP inbound
    pub http: u16,
    /// Control (stats API) inbound
    pub control: u16,
}

impl Default for LocalPorts {
    fn default() -> Self {
        Self {
            socks: 10808,
            http: 10809,
            control: 10085,
        }
    }
}

impl LocalPorts {
    pub fn socks_addr(&self) -> SocketAddr {
        SocketAddr::new(LOOPBACK, self.socks)
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(LOOPBACK, self.http)
    }

    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(LOOPBACK, self.control)
    }

    /// Endpoints the host proxy settings should point at
    pub fn proxy_endpoints(&self) -> ProxyEndpoints {
        ProxyEndpoints {
            socks: self.socks_addr(),
            http: self.http_addr(),
        }
    }

    /// No port is zero and no two ports collide
    pub fn is_valid(&self) -> bool {
        let ports = [self.socks, self.http, self.control];
        !ports.contains(&0)
            && self.socks != self.http
            && self.socks != self.control
            && self.http != self.control
    }
}

/// Local proxy endpoints exposed by a running engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyEndpoints {
    pub socks: SocketAddr,
    pub http: SocketAddr,
}

/// Engine configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub log: LogSection,
    pub stats: StatsSection,
    pub api: ApiSection,
    pub policy: PolicySection,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub routing: Routing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    pub loglevel: String,
}

/// Enables the engine's traffic counters (empty object)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSection {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSection {
    pub tag: String,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySection {
    pub system: SystemPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPolicy {
    pub stats_outbound_uplink: bool,
    pub stats_outbound_downlink: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    pub tag: String,
    pub listen: String,
    pub port: u16,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    pub tag: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<Value>,
}

impl Outbound {
    /// `address:port` of the first remote server, if the outbound has one
    pub fn remote_endpoint(&self) -> Option<(String, u16)> {
        let server = self.settings.as_ref()?.get("vnext")?.get(0)?;
        let address = server.get("address")?.as_str()?.to_string();
        let port = u16::try_from(server.get("port")?.as_u64()?).ok()?;
        Some((address, port))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    pub domain_strategy: String,
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound_tag: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Vec<String>>,
    pub outbound_tag: String,
}

impl TransportConfig {
    pub fn inbound(&self, tag: &str) -> Option<&Inbound> {
        self.inbounds.iter().find(|i| i.tag == tag)
    }

    pub fn outbound(&self, tag: &str) -> Option<&Outbound> {
        self.outbounds.iter().find(|o| o.tag == tag)
    }

    /// Whether private ranges are routed straight to the direct outbound
    pub fn routes_private_direct(&self) -> bool {
        self.routing.rules.iter().any(|rule| {
            rule.outbound_tag == DIRECT_TAG
                && rule
                    .ip
                    .as_ref()
                    .is_some_and(|ips| PRIVATE_RANGES.iter().all(|r| ips.iter().any(|ip| ip == r)))
        })
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Builds [`TransportConfig`] documents for one set of local ports
#[derive(Debug, Clone)]
pub struct TransportConfigBuilder {
    ports: LocalPorts,
    log_level: String,
}

impl TransportConfigBuilder {
    pub fn new(ports: LocalPorts) -> Self {
        Self {
            ports,
            log_level: "warning".to_string(),
        }
    }

    /// Engine log level; the readiness marker is logged at `warning`
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn ports(&self) -> LocalPorts {
        self.ports
    }

    /// Build the full engine configuration for a descriptor
    pub fn build(&self, descriptor: &ConnectionDescriptor) -> TransportConfig {
        TransportConfig {
            log: LogSection {
                loglevel: self.log_level.clone(),
            },
            stats: StatsSection::default(),
            api: ApiSection {
                tag: CONTROL_TAG.to_string(),
                services: vec!["StatsService".to_string()],
            },
            policy: PolicySection {
                system: SystemPolicy {
                    stats_outbound_uplink: true,
                    stats_outbound_downlink: true,
                },
            },
            inbounds: self.inbounds(),
            outbounds: vec![
                proxy_outbound(descriptor),
                Outbound {
                    tag: DIRECT_TAG.to_string(),
                    protocol: "freedom".to_string(),
                    settings: None,
                    stream_settings: None,
                },
                Outbound {
                    tag: BLOCK_TAG.to_string(),
                    protocol: "blackhole".to_string(),
                    settings: None,
                    stream_settings: None,
                },
            ],
            routing: Routing {
                domain_strategy: "IPIfNonMatch".to_string(),
                rules: vec![
                    RoutingRule {
                        kind: "field".to_string(),
                        inbound_tag: Some(vec![CONTROL_TAG.to_string()]),
                        ip: None,
                        outbound_tag: CONTROL_TAG.to_string(),
                    },
                    RoutingRule {
                        kind: "field".to_string(),
                        inbound_tag: None,
                        ip: Some(PRIVATE_RANGES.iter().map(|r| r.to_string()).collect()),
                        outbound_tag: DIRECT_TAG.to_string(),
                    },
                ],
            },
        }
    }

    fn inbounds(&self) -> Vec<Inbound> {
        let listen = LOOPBACK.to_string();
        let sniffing = json!({
            "enabled": true,
            "destOverride": ["http", "tls"],
        });

        vec![
            Inbound {
                tag: SOCKS_INBOUND_TAG.to_string(),
                listen: listen.clone(),
                port: self.ports.socks,
                protocol: "socks".to_string(),
                settings: Some(json!({ "auth": "noauth", "udp": true })),
                sniffing: Some(sniffing.clone()),
            },
            Inbound {
                tag: HTTP_INBOUND_TAG.to_string(),
                listen: listen.clone(),
                port: self.ports.http,
                protocol: "http".to_string(),
                settings: None,
                sniffing: Some(sniffing),
            },
            Inbound {
                tag: CONTROL_TAG.to_string(),
                listen: listen.clone(),
                port: self.ports.control,
                protocol: "dokodemo-door".to_string(),
                settings: Some(json!({ "address": listen })),
                sniffing: None,
            },
        ]
    }
}

impl Default for TransportConfigBuilder {
    fn default() -> Self {
        Self::new(LocalPorts::default())
    }
}

fn proxy_outbound(descriptor: &ConnectionDescriptor) -> Outbound {
    let mut user = json!({
        "id": descriptor.user_id,
        "encryption": descriptor.encryption.as_deref().unwrap_or("none"),
    });
    // An empty flow string makes the engine refuse the config
    if let Some(flow) = descriptor.flow.as_deref().filter(|f| !f.is_empty()) {
        user["flow"] = json!(flow);
    }

    Outbound {
        tag: PROXY_TAG.to_string(),
        protocol: descriptor.scheme.as_str().to_string(),
        settings: Some(json!({
            "vnext": [{
                "address": descriptor.host,
                "port": descriptor.port,
                "users": [user],
            }]
        })),
        stream_settings: Some(stream_settings(descriptor)),
    }
}

fn stream_settings(descriptor: &ConnectionDescriptor) -> Value {
    let network = match &descriptor.transport {
        Transport::Tcp | Transport::Other { .. } => "tcp",
        Transport::WebSocket { .. } => "ws",
        Transport::Grpc { .. } => "grpc",
        Transport::Http { .. } => "http",
    };

    let mut stream = json!({
        "network": network,
        "security": descriptor.security.name(),
    });

    match &descriptor.security {
        Security::None => {}
        Security::Tls(tls) => {
            let mut settings = json!({
                "serverName": tls.server_name,
                "fingerprint": tls.fingerprint,
            });
            if !tls.alpn.is_empty() {
                settings["alpn"] = json!(tls.alpn);
            }
            stream["tlsSettings"] = settings;
        }
        Security::Reality(reality) => {
            stream["realitySettings"] = json!({
                "serverName": reality.server_name,
                "fingerprint": reality.fingerprint,
                "publicKey": reality.public_key,
                "shortId": reality.short_id,
                "spiderX": reality.spider_x,
            });
        }
    }

    match &descriptor.transport {
        Transport::WebSocket { path, host } => {
            let mut ws = json!({ "path": path });
            if let Some(host) = host {
                ws["headers"] = json!({ "Host": host });
            }
            stream["wsSettings"] = ws;
        }
        Transport::Grpc { service_name } => {
            stream["grpcSettings"] = json!({ "serviceName": service_name });
        }
        Transport::Http { path, host } => {
            let mut http = json!({ "path": path });
            if let Some(host) = host {
                http["host"] = json!([host]);
            }
            stream["httpSettings"] = http;
        }
        Transport::Tcp | Transport::Other { .. } => {}
    }

    stream
}
