//! The consolidated incoming-request representation.
//!
//! An [`IncomingRequest`] is built by the endpoint's pipeline from a
//! parsed protocol-level request plus the connection context recorded at
//! accept time. Parsing classifies the request target, derives host
//! information, and assigns a per-process request id; cookies are parsed
//! lazily on first access.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::error;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use http::header::{COOKIE, HOST};
use http::request::Parts;
use http::{HeaderMap, Method, Uri, Version};
use percent_encoding::percent_decode_str;

use crate::path::PathKey;
use crate::server::ConnectionContext;

/// A request the engine could not make sense of. Produces a
/// `400 Bad Request` meta response.
#[derive(Debug)]
pub struct MalformedRequest {
    message: &'static str,
}

impl MalformedRequest {
    fn new(message: &'static str) -> Self {
        Self { message }
    }
}

impl fmt::Display for MalformedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed request: {}", self.message)
    }
}

impl error::Error for MalformedRequest {}

/// The classification of a request's target.
#[derive(Debug, Clone)]
pub enum RequestTarget {
    /// A path on this server, e.g. `/a/b?q`. The only kind with a
    /// pathname.
    Origin {
        path: PathKey,
        /// The query string including its leading `?`, or empty.
        search: String,
    },
    /// A full URI, as sent to proxies.
    Absolute { uri: Uri },
    /// `host[:port]`, as sent in `CONNECT` requests.
    Authority { authority: http::uri::Authority },
    /// The literal `*`, as sent in server-wide `OPTIONS` requests.
    Asterisk,
    /// Anything else.
    Other { raw: String },
}

impl RequestTarget {
    pub fn pathname(&self) -> Option<&PathKey> {
        match self {
            Self::Origin { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// The host a request was directed at, from its target or `Host`
/// header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    name: String,
    port: Option<u16>,
}

impl HostInfo {
    /// The lowercased host name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The name as a path key of DNS labels, most significant first,
    /// suitable for wildcard host dispatch through a
    /// [`TreePathMap`](crate::path::TreePathMap).
    pub fn name_key(&self) -> PathKey {
        PathKey::new(self.name.split('.').rev(), false)
    }

    fn parse(authority: &str) -> Option<Self> {
        if authority.is_empty() {
            return None;
        }
        let (name, port_text) = if let Some(rest) = authority.strip_prefix('[') {
            // Bracketed IPv6 literal.
            let end = rest.find(']')?;
            let name = &authority[..end + 2];
            match &rest[end + 1..] {
                "" => (name, None),
                port => (name, Some(port.strip_prefix(':')?)),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((name, port)) if !name.is_empty() => (name, Some(port)),
                _ => (authority, None),
            }
        };

        let port = match port_text {
            None => None,
            Some(text) => Some(text.parse().ok()?),
        };
        Some(Self {
            name: name.to_ascii_lowercase(),
            port,
        })
    }
}

impl fmt::Display for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.name, port),
            None => f.write_str(&self.name),
        }
    }
}

/// Cookies parsed from the `cookie` header, frozen after parsing.
///
/// An unparseable header yields the empty instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookies {
    entries: BTreeMap<String, String>,
}

impl Cookies {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    fn parse(headers: &HeaderMap) -> Self {
        let mut entries = BTreeMap::new();
        for header in headers.get_all(COOKIE) {
            let Ok(text) = header.to_str() else {
                return Self::default();
            };
            for pair in text.split(';') {
                let pair = pair.trim();
                if pair.is_empty() {
                    continue;
                }
                let Some((name, value)) = pair.split_once('=') else {
                    return Self::default();
                };
                let value = value
                    .strip_prefix('"')
                    .and_then(|rest| rest.strip_suffix('"'))
                    .unwrap_or(value);
                if !is_cookie_token(name) || !is_cookie_value(value) {
                    return Self::default();
                }
                entries.insert(name.to_owned(), value.to_owned());
            }
        }
        Self { entries }
    }
}

fn is_cookie_token(text: &str) -> bool {
    !text.is_empty()
        && text.bytes().all(|byte| {
            byte.is_ascii_graphic() && !b"()<>@,;:\\\"/[]?={} ".contains(&byte)
        })
}

fn is_cookie_value(text: &str) -> bool {
    text.bytes()
        .all(|byte| byte.is_ascii_graphic() && !b"\",;\\".contains(&byte))
}

/// A parsed incoming request plus its connection context.
pub struct IncomingRequest {
    id: String,
    connection: Arc<ConnectionContext>,
    method: Method,
    version: Version,
    headers: HeaderMap,
    target: RequestTarget,
    raw_target: String,
    host: Option<HostInfo>,
    protocol: &'static str,
    cookies: OnceLock<Cookies>,
    body: OnceLock<Bytes>,
}

impl fmt::Debug for IncomingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingRequest")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("target", &self.raw_target)
            .field("connection", &self.connection.id())
            .finish()
    }
}

impl IncomingRequest {
    /// Parse the protocol-level request head.
    ///
    /// `protocol` is the scheme name requests on this endpoint carry,
    /// `"http"` or `"https"`.
    pub(crate) fn parse(
        connection: Arc<ConnectionContext>,
        parts: &Parts,
        protocol: &'static str,
    ) -> Result<Self, MalformedRequest> {
        let target = parse_target(&parts.uri)?;
        let host = derive_host(&target, &parts.headers);
        Ok(Self {
            id: next_request_id(),
            connection,
            method: parts.method.clone(),
            version: parts.version,
            headers: parts.headers.clone(),
            raw_target: parts.uri.to_string(),
            target,
            host,
            protocol,
            cookies: OnceLock::new(),
            body: OnceLock::new(),
        })
    }

    /// The per-process-unique request id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection(&self) -> &ConnectionContext {
        &self.connection
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn target(&self) -> &RequestTarget {
        &self.target
    }

    /// The path for origin-form targets; `None` for every other kind.
    pub fn pathname(&self) -> Option<&PathKey> {
        self.target.pathname()
    }

    /// The query string including its leading `?`, or empty.
    pub fn search(&self) -> &str {
        match &self.target {
            RequestTarget::Origin { search, .. } => search,
            _ => "",
        }
    }

    pub fn host_info(&self) -> Option<&HostInfo> {
        self.host.as_ref()
    }

    /// The scheme requests on this endpoint carry.
    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    /// Cookies, parsed on first access and then frozen.
    pub fn cookies(&self) -> &Cookies {
        self.cookies.get_or_init(|| Cookies::parse(&self.headers))
    }

    /// The fully-collected request body, once the pipeline has read it.
    pub fn body(&self) -> Option<Bytes> {
        self.body.get().cloned()
    }

    pub(crate) fn set_body(&self, body: Bytes) {
        let _ = self.body.set(body);
    }

    /// The request URL as written to logs and diagnostic responses.
    pub fn logged_url(&self) -> String {
        let mut url = String::from(self.protocol);
        url.push_str("://");
        match &self.host {
            Some(host) => url.push_str(&host.to_string()),
            None => url.push_str("<unknown-host>"),
        }
        if !self.raw_target.starts_with('/') {
            url.push('/');
        }
        url.push_str(&self.raw_target);
        url
    }
}

fn parse_target(uri: &Uri) -> Result<RequestTarget, MalformedRequest> {
    if uri.scheme().is_some() {
        return Ok(RequestTarget::Absolute { uri: uri.clone() });
    }
    if let Some(authority) = uri.authority() {
        return Ok(RequestTarget::Authority {
            authority: authority.clone(),
        });
    }

    let path = uri.path();
    if path == "*" {
        return Ok(RequestTarget::Asterisk);
    }
    if let Some(rest) = path.strip_prefix('/') {
        let mut components = Vec::new();
        for raw in rest.split('/') {
            let decoded = percent_decode_str(raw)
                .decode_utf8()
                .map_err(|_| MalformedRequest::new("invalid percent-encoding in path"))?;
            match decoded.as_ref() {
                "." | ".." => return Err(MalformedRequest::new("dot segment in path")),
                component if component.contains('\0') => {
                    return Err(MalformedRequest::new("NUL in path"))
                }
                component => components.push(component.to_owned()),
            }
        }
        return Ok(RequestTarget::Origin {
            path: PathKey::new(components, false),
            search: uri.query().map(|q| format!("?{q}")).unwrap_or_default(),
        });
    }
    Ok(RequestTarget::Other {
        raw: uri.to_string(),
    })
}

fn derive_host(target: &RequestTarget, headers: &HeaderMap) -> Option<HostInfo> {
    let from_target = match target {
        RequestTarget::Absolute { uri } => uri.authority().map(|a| a.as_str()),
        RequestTarget::Authority { authority } => Some(authority.as_str()),
        _ => None,
    };
    if let Some(authority) = from_target {
        return HostInfo::parse(authority);
    }
    headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .and_then(HostInfo::parse)
}

fn next_request_id() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    format!("req-{}", NEXT.fetch_add(1, Ordering::Relaxed))
}
