//! Client configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::params;

/// Subtests that can be requested at login, combined as a bitmask.
///
/// The server grants a suite of test ids drawn from these same values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NettestFlags(pub u8);

impl NettestFlags {
    /// Middlebox detection subtest.
    pub const MIDDLEBOX: NettestFlags = NettestFlags(1 << 0);
    /// Upload (C2S) throughput subtest.
    pub const UPLOAD: NettestFlags = NettestFlags(1 << 1);
    /// Download (S2C) throughput subtest.
    pub const DOWNLOAD: NettestFlags = NettestFlags(1 << 2);
    /// Simple firewall subtest.
    pub const SIMPLE_FIREWALL: NettestFlags = NettestFlags(1 << 3);
    /// Status flag; always ORed into the login message.
    pub const STATUS: NettestFlags = NettestFlags(1 << 4);
    /// Metadata subtest.
    pub const META: NettestFlags = NettestFlags(1 << 5);
    /// Multi-stream upload subtest.
    pub const UPLOAD_EXT: NettestFlags = NettestFlags(1 << 6);
    /// Multi-stream download subtest.
    pub const DOWNLOAD_EXT: NettestFlags = NettestFlags(1 << 7);

    /// The raw bitmask value.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether every flag in `other` is also set in `self`.
    pub fn contains(self, other: NettestFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Human-readable name of the subtest this flag identifies.
    pub fn name(self) -> &'static str {
        match self {
            NettestFlags::MIDDLEBOX => "middlebox",
            NettestFlags::UPLOAD | NettestFlags::UPLOAD_EXT => "upload",
            NettestFlags::DOWNLOAD | NettestFlags::DOWNLOAD_EXT => "download",
            NettestFlags::SIMPLE_FIREWALL => "simple_firewall",
            NettestFlags::STATUS => "status",
            NettestFlags::META => "meta",
            _ => "unknown",
        }
    }
}

impl std::ops::BitOr for NettestFlags {
    type Output = NettestFlags;

    fn bitor(self, rhs: NettestFlags) -> NettestFlags {
        NettestFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for NettestFlags {
    fn bitor_assign(&mut self, rhs: NettestFlags) {
        self.0 |= rhs.0;
    }
}

/// Wire options for the control and measurement channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtocolFlags(pub u8);

impl ProtocolFlags {
    /// Exchange JSON message bodies instead of raw strings.
    pub const JSON: ProtocolFlags = ProtocolFlags(1 << 0);
    /// Run every connection over TLS.
    pub const TLS: ProtocolFlags = ProtocolFlags(1 << 1);
    /// Wrap every message in WebSocket framing. Implies JSON bodies.
    pub const WEBSOCKET: ProtocolFlags = ProtocolFlags(1 << 2);

    /// Whether every flag in `other` is also set in `self`.
    pub fn contains(self, other: ProtocolFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ProtocolFlags {
    type Output = ProtocolFlags;

    fn bitor(self, rhs: ProtocolFlags) -> ProtocolFlags {
        ProtocolFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for ProtocolFlags {
    fn bitor_assign(&mut self, rhs: ProtocolFlags) {
        self.0 |= rhs.0;
    }
}

/// Server-selection policy passed to mlab-ns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MlabnsPolicy {
    /// Request the closest server only.
    Closest,
    /// Request a random server.
    Random,
    /// Request a list of nearby servers; the most robust to outages.
    #[default]
    GeoOptions,
}

impl MlabnsPolicy {
    /// The value of the `policy` query parameter.
    pub fn as_query(self) -> &'static str {
        match self {
            MlabnsPolicy::Closest => "closest",
            MlabnsPolicy::Random => "random",
            MlabnsPolicy::GeoOptions => "geo_options",
        }
    }
}

/// How chatty the client is through the observer callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    /// Emit nothing.
    #[default]
    Quiet,
    /// Emit warnings only.
    Warning,
    /// Emit warnings and informational messages.
    Info,
    /// Emit everything.
    Debug,
}

/// Immutable per-run configuration.
///
/// The defaults run a single download subtest against a server discovered
/// through mlab-ns, using the plain NDT protocol.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base URL of the mlab-ns service, without a trailing slash.
    pub mlabns_base_url: String,
    /// Server-selection policy for mlab-ns queries.
    pub mlabns_policy: MlabnsPolicy,
    /// NDT server hostname. When empty, mlab-ns discovers candidates.
    pub hostname: String,
    /// NDT control port. When empty, a protocol-appropriate default is used.
    pub port: String,
    /// The subtests to request at login.
    pub nettest_flags: NettestFlags,
    /// Wire options: JSON bodies, TLS, WebSocket framing.
    pub protocol_flags: ProtocolFlags,
    /// Deadline applied to every single I/O operation.
    pub timeout: Duration,
    /// Hard cap on the runtime of each throughput subtest.
    pub max_runtime: Duration,
    /// Local SOCKS5h proxy port; when non-empty all traffic tunnels through it.
    pub socks5h_port: String,
    /// CA bundle used to verify TLS peers. Empty selects the built-in roots.
    pub ca_bundle_path: String,
    /// Whether to verify the TLS peer certificate and hostname.
    pub tls_verify_peer: bool,
    /// Key/value pairs sent to the server by the META subtest.
    pub metadata: BTreeMap<String, String>,
    /// How chatty the client is.
    pub verbosity: Verbosity,
}

impl Default for Settings {
    fn default() -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("client.application".to_owned(), env!("CARGO_PKG_NAME").to_owned());
        metadata.insert("client.version".to_owned(), params::NDT_VERSION_COMPAT.to_owned());
        Settings {
            mlabns_base_url: "https://mlab-ns.appspot.com".to_owned(),
            mlabns_policy: MlabnsPolicy::default(),
            hostname: String::new(),
            port: String::new(),
            nettest_flags: NettestFlags::DOWNLOAD,
            protocol_flags: ProtocolFlags::default(),
            timeout: Duration::from_secs(7),
            max_runtime: Duration::from_secs(14),
            socks5h_port: String::new(),
            ca_bundle_path: String::new(),
            tls_verify_peer: true,
            metadata,
            verbosity: Verbosity::default(),
        }
    }
}

impl Settings {
    /// Check invariants that must hold before any socket is opened.
    ///
    /// WebSocket framing requires JSON bodies, and a configured CA bundle
    /// must be readable when peer verification is on.
    pub fn validate(&self) -> Result<()> {
        if self.protocol_flags.contains(ProtocolFlags::WEBSOCKET)
            && !self.protocol_flags.contains(ProtocolFlags::JSON)
        {
            return Err(Error::InvalidArgument);
        }
        if self.protocol_flags.contains(ProtocolFlags::TLS)
            && self.tls_verify_peer
            && !self.ca_bundle_path.is_empty()
            && std::fs::File::open(&self.ca_bundle_path).is_err()
        {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// The control port to dial when none was configured.
    pub fn default_port(&self) -> &'static str {
        if self.protocol_flags.contains(ProtocolFlags::TLS) {
            params::DEFAULT_TLS_PORT
        } else {
            params::DEFAULT_PORT
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_requires_json() {
        let mut settings = Settings::default();
        settings.protocol_flags = ProtocolFlags::WEBSOCKET;
        assert_eq!(settings.validate(), Err(Error::InvalidArgument));

        settings.protocol_flags = ProtocolFlags::WEBSOCKET | ProtocolFlags::JSON;
        assert_eq!(settings.validate(), Ok(()));
    }

    #[test]
    fn missing_ca_bundle_is_rejected() {
        let mut settings = Settings::default();
        settings.protocol_flags = ProtocolFlags::TLS;
        settings.ca_bundle_path = "/nonexistent/ca-bundle.pem".to_owned();
        assert_eq!(settings.validate(), Err(Error::InvalidArgument));

        // Verification off: the bundle is never opened.
        settings.tls_verify_peer = false;
        assert_eq!(settings.validate(), Ok(()));
    }

    #[test]
    fn default_port_tracks_tls() {
        let mut settings = Settings::default();
        assert_eq!(settings.default_port(), "3001");
        settings.protocol_flags = ProtocolFlags::TLS;
        assert_eq!(settings.default_port(), "3010");
    }

    #[test]
    fn flags_compose() {
        let flags = NettestFlags::DOWNLOAD | NettestFlags::UPLOAD | NettestFlags::STATUS;
        assert_eq!(flags.bits(), 2 | 4 | 16);
        assert!(flags.contains(NettestFlags::UPLOAD));
        assert!(!flags.contains(NettestFlags::META));
    }
}
