//! Native protocol versions the control connection can negotiate.

use std::fmt;

/// Version of the CQL native protocol.
///
/// Versions are ordered, so `V3 < V4 < V5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V3,
    V4,
    V5,
}

impl ProtocolVersion {
    /// Highest version this crate knows how to speak.
    pub const MAX_SUPPORTED: ProtocolVersion = ProtocolVersion::V5;

    /// Lowest version this crate knows how to speak.
    pub const MIN_SUPPORTED: ProtocolVersion = ProtocolVersion::V3;

    pub fn from_u8(version: u8) -> Option<Self> {
        match version {
            3 => Some(Self::V3),
            4 => Some(Self::V4),
            5 => Some(Self::V5),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::V3 => 3,
            Self::V4 => 4,
            Self::V5 => 5,
        }
    }

    /// The next lower version, or `None` when already at the lowest one.
    pub fn downgrade(self) -> Option<Self> {
        match self {
            Self::V5 => Some(Self::V4),
            Self::V4 => Some(Self::V3),
            Self::V3 => None,
        }
    }

    /// Picks the version to retry with after the server rejected `self`.
    ///
    /// A version suggested by the server wins if it is supported and lower
    /// than the rejected one, otherwise the next lower version is used.
    pub fn negotiate_after_rejection(self, server_suggested: Option<u8>) -> Option<Self> {
        match server_suggested.and_then(Self::from_u8) {
            Some(suggested) if suggested < self => Some(suggested),
            _ => self.downgrade(),
        }
    }

    /// `system.peers_v2` exists only on servers speaking protocol v4 or later.
    pub fn supports_peers_v2(self) -> bool {
        self >= Self::V4
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::V4
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::ProtocolVersion;

    #[test]
    fn negotiation_prefers_server_suggestion() {
        assert_eq!(
            ProtocolVersion::V5.negotiate_after_rejection(Some(3)),
            Some(ProtocolVersion::V3)
        );
        // Unknown or non-lower suggestions fall back to a single step down.
        assert_eq!(
            ProtocolVersion::V5.negotiate_after_rejection(Some(9)),
            Some(ProtocolVersion::V4)
        );
        assert_eq!(
            ProtocolVersion::V4.negotiate_after_rejection(Some(4)),
            Some(ProtocolVersion::V3)
        );
        assert_eq!(ProtocolVersion::V3.negotiate_after_rejection(None), None);
    }

    #[test]
    fn ordering_and_display() {
        assert!(ProtocolVersion::V3 < ProtocolVersion::V5);
        assert_eq!(ProtocolVersion::V4.to_string(), "v4");
        assert_eq!(ProtocolVersion::from_u8(2), None);
    }
}
