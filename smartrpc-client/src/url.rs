//! Smart server URLs.

use crate::error::ClientError;
use smartrpc_protocol::DEFAULT_PORT;
use std::fmt;
use std::str::FromStr;

/// A parsed `scheme://[user@]host[:port]/path` URL.
///
/// The path is kept in its escaped form; [`SmartUrl::relative_url`] and
/// [`unescape`] produce the decoded paths sent to servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartUrl {
    scheme: String,
    user: Option<String>,
    host: String,
    port: Option<u16>,
    path: String,
}

impl SmartUrl {
    pub fn parse(input: &str) -> Result<Self, ClientError> {
        let invalid = |reason: &str| ClientError::InvalidUrl {
            url: input.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(invalid("bad scheme"));
        }

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        let (user, hostport) = match authority.rsplit_once('@') {
            Some((userinfo, hostport)) => {
                // A password is accepted but never kept.
                let user = userinfo.split(':').next().unwrap_or(userinfo);
                (Some(unescape(user)), hostport)
            }
            None => (None, authority),
        };

        let (host, port) = if let Some(bracketed) = hostport.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 address"))?;
            let port = match after.strip_prefix(':') {
                Some(port) => Some(port),
                None if after.is_empty() => None,
                None => return Err(invalid("garbage after IPv6 address")),
            };
            (host, port)
        } else {
            match hostport.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (hostport, None),
            }
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            Some(port) => Some(port.parse().map_err(|_| invalid("bad port"))?),
            None => None,
        };

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            user,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The escaped path, always starting with `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The scheme with any `bzr+` prefix removed.
    pub fn transport_scheme(&self) -> &str {
        self.scheme.strip_prefix("bzr+").unwrap_or(&self.scheme)
    }

    /// The port, or the well-known port for the scheme.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(match self.transport_scheme() {
            "http" => 80,
            "https" => 443,
            "ssh" => 22,
            _ => DEFAULT_PORT,
        })
    }

    /// This URL with any `bzr+` prefix removed from the scheme.
    pub fn without_bzr_prefix(&self) -> SmartUrl {
        let mut url = self.clone();
        url.scheme = self.transport_scheme().to_string();
        url
    }

    /// This URL with its path replaced.
    pub fn with_path(&self, path: &str) -> SmartUrl {
        let mut url = self.clone();
        url.path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        url
    }

    /// Appends a relative path to this URL's path.
    pub fn join(&self, relpath: &str) -> SmartUrl {
        let base = self.path.trim_end_matches('/');
        self.with_path(&format!("{}/{}", base, relpath.trim_start_matches('/')))
    }

    fn prefix(&self) -> String {
        let mut out = format!("{}://", self.scheme);
        if let Some(user) = &self.user {
            out.push_str(user);
            out.push('@');
        }
        if self.host.contains(':') {
            out.push('[');
            out.push_str(&self.host);
            out.push(']');
        } else {
            out.push_str(&self.host);
        }
        if let Some(port) = self.port {
            out.push_str(&format!(":{}", port));
        }
        out
    }

    /// Returns an escaped relative path from this URL to `other`.
    ///
    /// URLs on different schemes or hosts are unrelated, and `other` is
    /// returned whole. Identical URLs give `"."`.
    pub fn relative_url(&self, other: &SmartUrl) -> String {
        if self.prefix() != other.prefix() {
            return other.to_string();
        }
        let base_path = self.path[1..].strip_suffix('/').unwrap_or(&self.path[1..]);
        let other_path = &other.path[1..];
        let sections = |path: &str| -> Vec<String> {
            if path.is_empty() {
                Vec::new()
            } else {
                path.split('/').map(str::to_string).collect()
            }
        };
        let base_sections = sections(base_path);
        let other_sections = sections(other_path);

        let common = base_sections
            .iter()
            .zip(&other_sections)
            .take_while(|(b, o)| b == o)
            .count();
        let mut output: Vec<String> = vec!["..".to_string(); base_sections.len() - common];
        output.extend(other_sections[common..].iter().cloned());
        let joined = output.join("/");
        if joined.is_empty() {
            ".".to_string()
        } else {
            joined
        }
    }
}

impl fmt::Display for SmartUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix(), self.path)
    }
}

impl FromStr for SmartUrl {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SmartUrl::parse(s)
    }
}

/// Decodes `%XX` escapes. Malformed escapes are kept literally.
pub fn unescape(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(high), Some(low)) = (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                out.push(high << 4 | low);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}
