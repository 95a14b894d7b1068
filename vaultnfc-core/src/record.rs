use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single password entry.
///
/// `id` is assigned by the persistence layer and stays empty until the
/// record has been saved.  `encrypted_password` and `iv` are produced by a
/// [`Cipher`](crate::vault::Cipher) and are opaque to everything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    #[serde(default)]
    pub id: String,
    pub title: String,
    pub username: String,
    pub encrypted_password: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub iv: String,
}

impl CredentialRecord {
    /// Creates an unsaved record stamped with the current time.
    pub fn new(
        title: impl Into<String>,
        username: impl Into<String>,
        encrypted_password: impl Into<String>,
        iv: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            title: title.into(),
            username: username.into(),
            encrypted_password: encrypted_password.into(),
            uri: String::new(),
            notes: String::new(),
            created_at: now,
            modified_at: now,
            iv: iv.into(),
        }
    }

    #[must_use]
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    /// Whether the record has been assigned an id by a store.
    pub fn is_persisted(&self) -> bool {
        !self.id.is_empty()
    }

    /// Marks the record as edited now.
    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}

/// A discoverable remote device.
///
/// `address` identifies the device (Bluetooth MAC or network address) and is
/// the de-duplication key during discovery.  `endpoint` is whatever the
/// matching [`Connector`](crate::transport::Connector) needs to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub name: Option<String>,
    pub address: String,
    pub endpoint: String,
}

impl PeerDescriptor {
    /// Name to show in a peer list, falling back to the address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Given a new record, when created, then it has no id and equal timestamps.
    #[test]
    fn given_new_record_when_created_then_unsaved_with_equal_timestamps() {
        let record = CredentialRecord::new("Mail", "alice", "c2VjcmV0", "iv-1");
        assert!(!record.is_persisted());
        assert_eq!(record.created_at, record.modified_at);
    }

    /// Given a record, when touched, then only the modification time moves.
    #[test]
    fn given_record_when_touched_then_modified_at_moves_forward() {
        let mut record = CredentialRecord::new("Mail", "alice", "c2VjcmV0", "iv-1");
        let created = record.created_at;
        record.touch();
        assert!(record.modified_at >= created);
        assert_eq!(record.created_at, created);
    }

    /// Given a peer without a name, when displayed, then its address is shown.
    #[test]
    fn given_unnamed_peer_when_displayed_then_falls_back_to_address() {
        let peer = PeerDescriptor {
            name: None,
            address: "AA:BB:CC:DD:EE:FF".into(),
            endpoint: "AA:BB:CC:DD:EE:FF".into(),
        };
        assert_eq!(peer.display_name(), "AA:BB:CC:DD:EE:FF");
    }
}
