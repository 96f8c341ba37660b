//! Protocol generations and remote release versions.

use std::fmt;

/// Marker prefixed to every protocol version two request.
pub const REQUEST_VERSION_TWO: &[u8] = b"bzr request 2\n";

/// Marker prefixed to every protocol version two response.
pub const RESPONSE_VERSION_TWO: &[u8] = b"bzr response 2\n";

/// Marker prefixed to every protocol version three message, in both directions.
pub const MESSAGE_VERSION_THREE: &[u8] = b"bzr message 3 (bzr 1.6)\n";

/// A smart protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    One,
    Two,
    Three,
}

impl ProtocolVersion {
    /// Order in which versions are attempted against a peer of unknown age.
    pub const NEGOTIATION_ORDER: [ProtocolVersion; 3] = [
        ProtocolVersion::Three,
        ProtocolVersion::Two,
        ProtocolVersion::One,
    ];

    pub fn number(&self) -> u8 {
        match self {
            ProtocolVersion::One => 1,
            ProtocolVersion::Two => 2,
            ProtocolVersion::Three => 3,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(ProtocolVersion::One),
            2 => Some(ProtocolVersion::Two),
            3 => Some(ProtocolVersion::Three),
            _ => None,
        }
    }

    /// Marker that opens a request in this version (empty for version one).
    pub fn request_marker(&self) -> &'static [u8] {
        match self {
            ProtocolVersion::One => b"",
            ProtocolVersion::Two => REQUEST_VERSION_TWO,
            ProtocolVersion::Three => MESSAGE_VERSION_THREE,
        }
    }

    /// Marker that opens a response in this version (empty for version one).
    pub fn response_marker(&self) -> &'static [u8] {
        match self {
            ProtocolVersion::One => b"",
            ProtocolVersion::Two => RESPONSE_VERSION_TWO,
            ProtocolVersion::Three => MESSAGE_VERSION_THREE,
        }
    }

    /// First remote release that understands this version.
    pub fn introduced_in(&self) -> RemoteVersion {
        match self {
            ProtocolVersion::One => RemoteVersion::new(0, 0),
            ProtocolVersion::Two => RemoteVersion::new(0, 16),
            ProtocolVersion::Three => RemoteVersion::new(1, 6),
        }
    }

    /// Whether request bodies may be streamed in chunks.
    pub fn supports_request_streams(&self) -> bool {
        matches!(self, ProtocolVersion::Three)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.number())
    }
}

/// A remote bzr release, used to record "the remote is older than X".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RemoteVersion {
    pub major: u16,
    pub minor: u16,
}

impl RemoteVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for RemoteVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiation_order_prefers_newest() {
        assert_eq!(ProtocolVersion::NEGOTIATION_ORDER[0], ProtocolVersion::Three);
        assert!(ProtocolVersion::NEGOTIATION_ORDER
            .windows(2)
            .all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_markers() {
        assert!(ProtocolVersion::One.request_marker().is_empty());
        assert_eq!(ProtocolVersion::Two.request_marker(), b"bzr request 2\n");
        assert_eq!(ProtocolVersion::Two.response_marker(), b"bzr response 2\n");
        assert_eq!(
            ProtocolVersion::Three.response_marker(),
            ProtocolVersion::Three.request_marker()
        );
    }

    #[test]
    fn test_remote_version_ordering() {
        assert!(RemoteVersion::new(1, 6) < RemoteVersion::new(1, 9));
        assert!(RemoteVersion::new(0, 16) < RemoteVersion::new(1, 6));
        assert_eq!(RemoteVersion::new(1, 6).to_string(), "1.6");
        assert_eq!(ProtocolVersion::Three.introduced_in(), RemoteVersion::new(1, 6));
    }

    #[test]
    fn test_version_numbers() {
        for v in ProtocolVersion::NEGOTIATION_ORDER {
            assert_eq!(ProtocolVersion::from_number(v.number()), Some(v));
        }
        assert_eq!(ProtocolVersion::from_number(4), None);
        assert_eq!(ProtocolVersion::Two.to_string(), "v2");
    }
}
