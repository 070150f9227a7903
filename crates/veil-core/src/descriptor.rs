//! Connection Descriptor
//!
//! Parses shareable links into a validated [`ConnectionDescriptor`].
//!
//! # Format
//!
//! ```text
//! vless://<credential>@<host>:<port>?security=tls&type=ws&path=%2Fws#My%20Server
//!         └─ userinfo ─┘ └─ host ┘ └port┘ └──── query parameters ────┘ └ label ┘
//! ```
//!
//! Unknown security modes are rejected. Unknown transports are kept as
//! [`Transport::Other`] and built as a plain stream later on.

use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use url::{Host, Url};

/// Label used when the link carries no fragment
pub const DEFAULT_LABEL: &str = "Unnamed";

/// TLS client fingerprint used when `fp` is absent
pub const DEFAULT_TLS_FINGERPRINT: &str = "chrome";

/// Link scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Vless,
}

impl Scheme {
    /// Match a lowercase scheme name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "vless" => Some(Scheme::Vless),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Vless => "vless",
        }
    }

    /// Port assumed when the link omits one, if the scheme defines it
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Scheme::Vless => Some(443),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream framing between the engine and the remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Transport {
    /// Plain stream (`tcp` / `raw`)
    Tcp,
    /// WebSocket with optional `Host` header override
    #[serde(rename = "ws")]
    WebSocket { path: String, host: Option<String> },
    /// gRPC-style stream
    Grpc { service_name: String },
    /// HTTP-disguised stream (`http` / `h2`)
    Http { path: String, host: Option<String> },
    /// Anything else, passed through untouched
    Other { name: String },
}

impl Transport {
    /// Name as it appears in the `type` parameter
    pub fn name(&self) -> &str {
        match self {
            Transport::Tcp => "tcp",
            Transport::WebSocket { .. } => "ws",
            Transport::Grpc { .. } => "grpc",
            Transport::Http { .. } => "http",
            Transport::Other { name } => name,
        }
    }
}

/// TLS parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TlsParams {
    /// SNI, defaults to the descriptor host
    pub server_name: String,
    pub fingerprint: String,
    pub alpn: Vec<String>,
}

/// Reality (stealth) parameters
///
/// Missing fields are kept as empty strings; the engine decides whether
/// the resulting combination is usable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RealityParams {
    pub server_name: String,
    pub fingerprint: String,
    pub public_key: String,
    pub short_id: String,
    pub spider_x: String,
}

/// Security layer applied on top of the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Security {
    None,
    Tls(TlsParams),
    Reality(RealityParams),
}

impl Security {
    pub fn name(&self) -> &'static str {
        match self {
            Security::None => "none",
            Security::Tls(_) => "tls",
            Security::Reality(_) => "reality",
        }
    }
}

/// Parsed and validated shareable link
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionDescriptor {
    pub scheme: Scheme,
    /// Opaque credential (usually a UUID)
    pub user_id: String,
    /// Domain or IP address, without IPv6 brackets
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    pub security: Security,
    /// Flow control method, only when the link sets a non-empty one
    pub flow: Option<String>,
    pub encryption: Option<String>,
    /// Human-readable display name
    pub label: String,
}

impl ConnectionDescriptor {
    /// Parse a shareable link
    pub fn parse(uri: &str) -> Result<Self, ParseError> {
        let uri = uri.trim();

        let (scheme_name, _) = uri
            .split_once("://")
            .ok_or_else(|| ParseError::Malformed("missing scheme".into()))?;
        let scheme = Scheme::from_name(&scheme_name.to_ascii_lowercase())
            .ok_or_else(|| ParseError::UnsupportedScheme(scheme_name.to_string()))?;

        let url = Url::parse(uri).map_err(|e| match e {
            url::ParseError::InvalidPort => ParseError::InvalidPort,
            url::ParseError::EmptyHost => ParseError::MissingHost,
            other => ParseError::Malformed(other.to_string()),
        })?;

        if url.username().is_empty() {
            return Err(ParseError::MissingCredential);
        }
        if url.password().is_some() {
            return Err(ParseError::Malformed("unexpected password after credential".into()));
        }
        let user_id = decode(url.username(), "credential")?;

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(ParseError::MissingHost),
        };

        let port = match url.port() {
            Some(0) => return Err(ParseError::InvalidPort),
            Some(port) => port,
            None => scheme.default_port().ok_or(ParseError::MissingPort)?,
        };

        let params = query_params(url.query().unwrap_or(""))?;

        let label = match url.fragment() {
            Some(fragment) if !fragment.is_empty() => decode(fragment, "label")?,
            _ => DEFAULT_LABEL.to_string(),
        };

        let security = parse_security(&params, &host)?;
        let transport = parse_transport(&params);

        Ok(Self {
            scheme,
            user_id,
            host,
            port,
            transport,
            security,
            flow: non_empty(&params, "flow").map(String::from),
            encryption: non_empty(&params, "encryption").map(String::from),
            label,
        })
    }

    /// `host:port`, with IPv6 hosts bracketed
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} {}/{})",
            self.label,
            self.endpoint(),
            self.transport.name(),
            self.security.name()
        )
    }
}

fn parse_security(params: &HashMap<String, String>, host: &str) -> Result<Security, ParseError> {
    let text = |key: &str| params.get(key).cloned().unwrap_or_default();

    let security = params.get("security").map(|v| v.to_ascii_lowercase());
    match security.as_deref() {
        None | Some("") | Some("none") => Ok(Security::None),
        Some("tls") => Ok(Security::Tls(TlsParams {
            server_name: non_empty(params, "sni").unwrap_or(host).to_string(),
            fingerprint: non_empty(params, "fp")
                .unwrap_or(DEFAULT_TLS_FINGERPRINT)
                .to_string(),
            alpn: params
                .get("alpn")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|proto| !proto.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        })),
        Some("reality") => Ok(Security::Reality(RealityParams {
            server_name: text("sni"),
            fingerprint: text("fp"),
            public_key: text("pbk"),
            short_id: text("sid"),
            spider_x: text("spx"),
        })),
        Some(other) => Err(ParseError::UnsupportedSecurity(other.to_string())),
    }
}

fn parse_transport(params: &HashMap<String, String>) -> Transport {
    let path = || non_empty(params, "path").unwrap_or("/").to_string();
    let host = || non_empty(params, "host").map(String::from);

    let kind = params
        .get("type")
        .map(|v| v.to_ascii_lowercase())
        .unwrap_or_default();
    match kind.as_str() {
        "" | "tcp" | "raw" => Transport::Tcp,
        "ws" => Transport::WebSocket {
            path: path(),
            host: host(),
        },
        "grpc" => Transport::Grpc {
            service_name: params.get("serviceName").cloned().unwrap_or_default(),
        },
        "http" | "h2" => Transport::Http {
            path: path(),
            host: host(),
        },
        other => Transport::Other {
            name: other.to_string(),
        },
    }
}

/// Split a raw query into decoded pairs; later duplicates replace earlier ones
fn query_params(query: &str) -> Result<HashMap<String, String>, ParseError> {
    let mut params = HashMap::new();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(decode(key, "query")?, decode(value, "query")?);
    }
    Ok(params)
}

fn non_empty<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    params.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

/// Percent-decode, refusing malformed escapes instead of passing them through
fn decode(raw: &str, component: &'static str) -> Result<String, ParseError> {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let well_formed = bytes
                .get(i + 1..i + 3)
                .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
            if !well_formed {
                return Err(ParseError::InvalidEncoding(component));
            }
            i += 3;
        } else {
            i += 1;
        }
    }

    urlencoding::decode(raw)
        .map(Cow::into_owned)
        .map_err(|_| ParseError::InvalidEncoding(component))
}

/// Descriptor parse errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Malformed link: {0}")]
    Malformed(String),

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Missing credential")]
    MissingCredential,

    #[error("Missing host")]
    MissingHost,

    #[error("Missing port")]
    MissingPort,

    #[error("Invalid port")]
    InvalidPort,

    #[error("Unsupported security mode: {0}")]
    UnsupportedSecurity(String),

    #[error("Invalid percent-encoding in {0}")]
    InvalidEncoding(&'static str),
}
