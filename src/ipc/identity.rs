//! Connection identity table
//!
//! Maps the opaque connection id assigned by a ROUTER socket to the logical
//! identifier a worker announced in its handshake. Entries are never evicted
//! during a run.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;

/// Label used in logs for senders that have not completed a handshake
pub const UNREGISTERED: &str = "Unregistered";

/// Connection id → logical identifier
#[derive(Debug, Default)]
pub struct IdentityTable {
    entries: RwLock<HashMap<Bytes, String>>,
}

impl IdentityTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or replace) the identifier of a connection
    pub fn register(&self, connection: &Bytes, identifier: impl Into<String>) {
        self.entries
            .write()
            .insert(connection.clone(), identifier.into());
    }

    /// Identifier of a connection, if it completed a handshake
    pub fn lookup(&self, connection: &[u8]) -> Option<String> {
        self.entries.read().get(connection).cloned()
    }

    /// Resolve a connection into a log-friendly peer description
    pub fn resolve(&self, connection: &[u8]) -> Peer {
        Peer {
            uid: hex::encode_upper(connection),
            identifier: self.lookup(connection),
        }
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when no connection has completed a handshake
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// A resolved sender
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    /// Upper-case hex of the connection id
    pub uid: String,
    /// Logical identifier, if registered
    pub identifier: Option<String>,
}

impl Peer {
    /// Logical identifier, or [`UNREGISTERED`]
    pub fn identifier_or_unregistered(&self) -> &str {
        self.identifier.as_deref().unwrap_or(UNREGISTERED)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identifier {
            Some(identifier) => write!(f, "{} ({})", self.uid, identifier),
            None => f.write_str(&self.uid),
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_peer_has_hex_uid_only() {
        let table = IdentityTable::new();
        let peer = table.resolve(&[0x00, 0xab, 0x10]);
        assert_eq!(peer.uid, "00AB10");
        assert_eq!(peer.identifier_or_unregistered(), UNREGISTERED);
        assert_eq!(peer.to_string(), "00AB10");
    }

    #[test]
    fn registered_peer_shows_identifier() {
        let table = IdentityTable::new();
        let conn = Bytes::from_static(&[1, 2]);
        table.register(&conn, "42_page1");

        let peer = table.resolve(&conn);
        assert_eq!(peer.identifier.as_deref(), Some("42_page1"));
        assert_eq!(peer.to_string(), "0102 (42_page1)");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn re_registration_replaces_identifier() {
        let table = IdentityTable::new();
        let conn = Bytes::from_static(b"c");
        table.register(&conn, "first");
        table.register(&conn, "second");
        assert_eq!(table.lookup(&conn).as_deref(), Some("second"));
        assert_eq!(table.len(), 1);
    }
}
