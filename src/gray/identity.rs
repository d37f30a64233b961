//! Client identity resolution.
//!
//! Derives the gray-key value and a stable client id from request signals,
//! and recovers the `(version, clientId)` pair a client presents back in the
//! sticky cookie.

use std::borrow::Cow;
use std::net::IpAddr;

use super::headers::HeaderBag;
use crate::config::GrayConfig;

/// Cookie carrying the previously assigned front-end version and client id.
pub const STICKY_COOKIE: &str = "x-pre-higress-tag";

/// Request header carrying the assigned version to the upstream.
pub const VERSION_HEADER: &str = "x-higress-tag";

/// Request signals as supplied by the host.
#[derive(Debug, Clone, Default)]
pub struct RequestSignals {
    /// Request target, query string included.
    pub path: String,
    pub headers: HeaderBag,
    /// Connection peer address, the last resort for the client id.
    pub peer_ip: Option<IpAddr>,
}

impl RequestSignals {
    pub fn new(path: impl Into<String>, headers: HeaderBag) -> Self {
        Self {
            path: path.into(),
            headers,
            peer_ip: None,
        }
    }

    pub fn with_peer_ip(mut self, ip: IpAddr) -> Self {
        self.peer_ip = Some(ip);
        self
    }

    pub fn cookie(&self) -> String {
        self.headers.joined("cookie", "; ")
    }

    pub fn fetch_mode(&self) -> &str {
        self.headers.get_or_default("sec-fetch-mode")
    }

    pub fn forwarded_for(&self) -> &str {
        self.headers.get_or_default("x-forwarded-for")
    }

    /// Whether the request framing announces a body. An unparseable
    /// `content-length` counts as one.
    pub fn has_body(&self) -> bool {
        if self.headers.contains("transfer-encoding") {
            return true;
        }
        self.headers
            .get_all("content-length")
            .iter()
            .any(|value| value.trim().parse::<u64>().map_or(true, |len| len > 0))
    }
}

/// Version and client id recovered from the sticky cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StickyAssignment {
    pub version: String,
    pub client_id: String,
}

impl StickyAssignment {
    /// Parses `version,clientId`. A value without a comma has no client id.
    pub fn parse(value: &str) -> Option<Self> {
        let (version, client_id) = match value.split_once(',') {
            Some((version, client_id)) => (version.trim(), client_id.trim()),
            None => (value.trim(), ""),
        };
        if version.is_empty() {
            return None;
        }
        Some(Self {
            version: version.to_string(),
            client_id: client_id.to_string(),
        })
    }

    /// `Set-Cookie` value recording this assignment.
    ///
    /// Both parts are percent-encoded; the client id comes from request
    /// data and must not add cookie attributes.
    pub fn to_set_cookie(&self, max_age: u64) -> String {
        format!(
            "{}={},{}; Max-Age={}; Path=/;",
            STICKY_COOKIE,
            urlencoding::encode(&self.version),
            urlencoding::encode(&self.client_id),
            max_age
        )
    }
}

/// Resolved identity of the requesting client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Value of the configured gray key, `""` when the client sent none.
    pub gray_value: String,
    /// Identity used for sticky hashing.
    pub client_id: String,
    /// Assignment carried over from the previous response.
    pub previous: Option<StickyAssignment>,
}

impl ClientIdentity {
    pub fn resolve(config: &GrayConfig, signals: &RequestSignals) -> Self {
        let cookies = signals.cookie();

        let by_cookie = if config.gray_key.is_empty() {
            None
        } else {
            cookie_value(&cookies, &config.gray_key)
        };
        let by_header = if config.gray_key.is_empty() {
            ""
        } else {
            signals.headers.get_or_default(&config.gray_key)
        };
        let gray_value = gray_key_value(by_cookie.as_deref(), by_header, &config.gray_sub_key);

        let client_id = if !gray_value.is_empty() {
            gray_value.clone()
        } else {
            let forwarded = leftmost_forwarded(signals.forwarded_for());
            if !forwarded.is_empty() {
                forwarded.to_string()
            } else {
                signals
                    .peer_ip
                    .map(|ip| ip.to_string())
                    .unwrap_or_default()
            }
        };

        let previous = cookie_value(&cookies, STICKY_COOKIE)
            .as_deref()
            .and_then(StickyAssignment::parse);

        Self {
            gray_value,
            client_id,
            previous,
        }
    }
}

/// Value of cookie `name` in a `cookie` header, percent-decoded when valid.
pub fn cookie_value(cookies: &str, name: &str) -> Option<String> {
    cookies
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| {
            let value = value.trim().trim_matches('"');
            match urlencoding::decode(value) {
                Ok(decoded) => decoded.into_owned(),
                Err(_) => value.to_string(),
            }
        })
}

/// Picks the gray-key value: cookie first, then header.
///
/// With a sub-key, each source is read as a JSON object and the sub-key's
/// field is used; a source that yields nothing falls through.
pub fn gray_key_value(by_cookie: Option<&str>, by_header: &str, sub_key: &str) -> String {
    [by_cookie.unwrap_or(""), by_header]
        .into_iter()
        .filter(|raw| !raw.is_empty())
        .find_map(|raw| extract_sub_key(raw, sub_key))
        .map(Cow::into_owned)
        .unwrap_or_default()
}

fn extract_sub_key<'a>(raw: &'a str, sub_key: &str) -> Option<Cow<'a, str>> {
    if sub_key.is_empty() {
        return Some(Cow::Borrowed(raw));
    }
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    match value.get(sub_key)? {
        serde_json::Value::String(s) if !s.is_empty() => Some(Cow::Owned(s.clone())),
        serde_json::Value::Number(n) => Some(Cow::Owned(n.to_string())),
        serde_json::Value::Bool(b) => Some(Cow::Owned(b.to_string())),
        _ => None,
    }
}

/// Leftmost `X-Forwarded-For` token with surrounding whitespace trimmed.
pub fn leftmost_forwarded(forwarded_for: &str) -> &str {
    forwarded_for.split(',').next().unwrap_or("").trim()
}
