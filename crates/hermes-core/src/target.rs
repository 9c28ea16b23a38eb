//! Absolute `http`/`https` target URLs.

use std::fmt;

use url::{Host, Url};

use crate::error::{CoreError, Result};

/// URL scheme of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    /// Parses a scheme name, ignoring case and a trailing `:`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim_end_matches(':');
        if value.eq_ignore_ascii_case("http") {
            Some(Self::Http)
        } else if value.eq_ignore_ascii_case("https") {
            Some(Self::Https)
        } else {
            None
        }
    }

    /// Scheme name without a colon.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    /// Default port for the scheme.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed absolute target URL.
///
/// Thin view over [`url::Url`] that keeps the pieces an entry records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUrl {
    /// `http` or `https`.
    pub scheme: Scheme,
    /// Host name or IP literal, without IPv6 brackets.
    pub host: String,
    /// Explicit port, if one was given and differs from the default.
    pub port: Option<u16>,
    /// Path starting with `/`.
    pub path: String,
    /// Query without the leading `?`.
    pub query: Option<String>,
}

impl TargetUrl {
    /// Parses an absolute `http`/`https` URL. Fragments and userinfo are dropped.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let url = Url::parse(input)
            .map_err(|e| CoreError::InvalidUrl(format!("{}: {}", input, e)))?;
        Self::from_url(&url).ok_or_else(|| CoreError::InvalidUrl(input.to_string()))
    }

    /// Converts a parsed URL; `None` unless it is `http`/`https` with a host.
    pub fn from_url(url: &Url) -> Option<Self> {
        let scheme = Scheme::parse(url.scheme())?;
        let host = match url.host()? {
            Host::Domain(domain) => domain.to_string(),
            Host::Ipv4(addr) => addr.to_string(),
            Host::Ipv6(addr) => addr.to_string(),
        };
        Some(Self {
            scheme,
            host,
            // `Url` already reports the scheme's default port as `None`
            port: url.port(),
            path: url.path().to_string(),
            query: url.query().filter(|q| !q.is_empty()).map(str::to_string),
        })
    }

    /// Builds a URL from a scheme, an authority (`host[:port]`) and a
    /// request target (`/path?query`).
    pub fn from_parts(scheme: Scheme, authority: &str, path_and_query: &str) -> Result<Self> {
        let target = if path_and_query.starts_with('/') {
            path_and_query.to_string()
        } else {
            format!("/{}", path_and_query)
        };
        Self::parse(&format!("{}://{}{}", scheme, authority, target))
    }

    /// Port that will actually be dialed.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or_else(|| self.scheme.default_port())
    }

    /// Host as it appears in an authority (IPv6 literals bracketed).
    pub fn host_for_authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// `host[:port]` with the default port elided.
    pub fn authority(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host_for_authority(), port),
            None => self.host_for_authority(),
        }
    }

    /// Request target sent on the wire: path plus `?query`.
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

impl fmt::Display for TargetUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority(), self.path_and_query())
    }
}
