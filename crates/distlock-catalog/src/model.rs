//! Lock catalog data model
//!
//! Documents are stored with the field names of the existing `config.locks`
//! and `config.lockpings` collections, so they stay readable by other
//! processes sharing the same store.

use bson::oid::ObjectId;
use bson::{DateTime, Document};
use serde::{Deserialize, Serialize};

use distlock_common::CatalogError;

use crate::schema::locks;

/// Lock state, stored as an int32. Int64 values are accepted on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i32")]
pub enum LockState {
    /// Lock is available
    #[default]
    Unlocked,
    /// Legacy intermediate state of the two-phase protocol; read-only here
    LockPrep,
    /// Lock is held by an owner
    Locked,
}

impl From<LockState> for i32 {
    fn from(state: LockState) -> Self {
        match state {
            LockState::Unlocked => 0,
            LockState::LockPrep => 1,
            LockState::Locked => 2,
        }
    }
}

impl TryFrom<i64> for LockState {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LockState::Unlocked),
            1 => Ok(LockState::LockPrep),
            2 => Ok(LockState::Locked),
            other => Err(format!("invalid lock state: {}", other)),
        }
    }
}

/// Ownership record of one named lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockDocument {
    /// Name of the protected resource
    #[serde(rename = "_id")]
    pub name: String,
    /// Current lock state
    pub state: LockState,
    /// Fencing token of the current acquisition
    #[serde(rename = "ts", default, skip_serializing_if = "Option::is_none")]
    pub fencing_token: Option<ObjectId>,
    /// Process holding the lock
    #[serde(rename = "process", default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    /// Logical owner
    #[serde(rename = "who", default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Acquisition or takeover time
    #[serde(rename = "when", default, skip_serializing_if = "Option::is_none")]
    pub acquired_at: Option<DateTime>,
    /// Free-text justification, diagnostic only
    #[serde(rename = "why", default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl LockDocument {
    /// Decode and validate a document returned by the store.
    pub fn from_document(doc: Document) -> Result<Self, CatalogError> {
        let lock: LockDocument = bson::from_document(doc)
            .map_err(|e| CatalogError::FailedToParse(format!("lock document: {}", e)))?;
        lock.validate()?;
        Ok(lock)
    }

    /// A held lock must identify its acquisition completely.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.state != LockState::Locked {
            return Ok(());
        }

        let missing = [
            ("ts", self.fencing_token.is_none()),
            ("process", self.process_id.is_none()),
            ("who", self.owner.is_none()),
            ("when", self.acquired_at.is_none()),
        ]
        .into_iter()
        .find_map(|(field, absent)| absent.then_some(field));

        match missing {
            Some(field) => Err(CatalogError::FailedToParse(format!(
                "locked document for '{}' is missing field '{}'",
                self.name, field
            ))),
            None => Ok(()),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state == LockState::Locked
    }

    /// Whether this document records the acquisition identified by `token`.
    pub fn is_held_with(&self, token: &ObjectId) -> bool {
        self.is_locked() && self.fencing_token.as_ref() == Some(token)
    }
}

/// Ownership details written by an acquisition or a takeover.
#[derive(Debug, Clone, PartialEq)]
pub struct LockAcquireRequest {
    /// Name of the lock to acquire
    pub name: String,
    /// Fresh fencing token minted by the caller for this acquisition
    pub fencing_token: ObjectId,
    /// Logical owner
    pub owner: String,
    /// Process acquiring the lock
    pub process_id: String,
    /// Acquisition time recorded in the document
    pub time: DateTime,
    /// Free-text justification
    pub reason: String,
}

impl LockAcquireRequest {
    pub fn new(
        name: impl Into<String>,
        fencing_token: ObjectId,
        owner: impl Into<String>,
        process_id: impl Into<String>,
        time: DateTime,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            fencing_token,
            owner: owner.into(),
            process_id: process_id.into(),
            time,
            reason: reason.into(),
        }
    }

    /// `$set` payload turning a lock document into this acquisition.
    pub fn lock_details(&self) -> Document {
        let mut details = Document::new();
        details.insert(locks::FENCING_TOKEN, self.fencing_token);
        details.insert(locks::STATE, i32::from(LockState::Locked));
        details.insert(locks::WHO, self.owner.as_str());
        details.insert(locks::PROCESS, self.process_id.as_str());
        details.insert(locks::WHEN, self.time);
        details.insert(locks::WHY, self.reason.as_str());
        details
    }
}

/// Heartbeat of one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockPingDocument {
    #[serde(rename = "_id")]
    pub process_id: String,
    /// Last time the process refreshed its heartbeat
    pub ping: DateTime,
}

impl LockPingDocument {
    pub fn from_document(doc: Document) -> Result<Self, CatalogError> {
        bson::from_document(doc)
            .map_err(|e| CatalogError::FailedToParse(format!("lock ping document: {}", e)))
    }
}

/// Snapshot of the targeted node's clock and election epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfo {
    pub server_time: DateTime,
    /// Changes every time a new primary is elected
    pub election_id: ObjectId,
}

impl ServerInfo {
    pub fn new(server_time: DateTime, election_id: ObjectId) -> Self {
        Self {
            server_time,
            election_id,
        }
    }

    /// Whether a leadership change happened between the two observations.
    pub fn same_epoch(&self, other: &ServerInfo) -> bool {
        self.election_id == other.election_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn locked_doc(token: ObjectId) -> Document {
        doc! {
            "_id": "balancer",
            "state": 2,
            "ts": token,
            "process": "host1:27017:1440000000:123",
            "who": "host1:27017:Balancer",
            "when": DateTime::from_millis(1_440_000_000_000),
            "why": "doing balance round",
        }
    }

    #[test]
    fn test_lock_state_wire_values() {
        assert_eq!(i32::from(LockState::Unlocked), 0);
        assert_eq!(i32::from(LockState::LockPrep), 1);
        assert_eq!(i32::from(LockState::Locked), 2);
        assert_eq!(LockState::try_from(2i64), Ok(LockState::Locked));
        assert!(LockState::try_from(3i64).is_err());
        assert_eq!(LockState::default(), LockState::Unlocked);
    }

    #[test]
    fn test_parse_locked_document() {
        let token = ObjectId::new();
        let lock = LockDocument::from_document(locked_doc(token)).unwrap();

        assert_eq!(lock.name, "balancer");
        assert_eq!(lock.state, LockState::Locked);
        assert_eq!(lock.fencing_token, Some(token));
        assert_eq!(lock.owner.as_deref(), Some("host1:27017:Balancer"));
        assert_eq!(lock.reason.as_deref(), Some("doing balance round"));
        assert!(lock.is_held_with(&token));
        assert!(!lock.is_held_with(&ObjectId::new()));
    }

    #[test]
    fn test_parse_unlocked_document_without_details() {
        let lock = LockDocument::from_document(doc! { "_id": "balancer", "state": 0 }).unwrap();
        assert!(!lock.is_locked());
        assert!(lock.fencing_token.is_none());
    }

    #[test]
    fn test_locked_document_missing_token_fails() {
        let mut doc = locked_doc(ObjectId::new());
        doc.remove("ts");

        let err = LockDocument::from_document(doc).unwrap_err();
        assert!(matches!(err, CatalogError::FailedToParse(ref msg) if msg.contains("'ts'")));
    }

    #[test]
    fn test_invalid_state_fails() {
        let err = LockDocument::from_document(doc! { "_id": "balancer", "state": 7 }).unwrap_err();
        assert!(matches!(err, CatalogError::FailedToParse(_)));

        let err =
            LockDocument::from_document(doc! { "_id": "balancer", "state": "locked" }).unwrap_err();
        assert!(matches!(err, CatalogError::FailedToParse(_)));
    }

    #[test]
    fn test_serialize_uses_wire_names() {
        let token = ObjectId::new();
        let lock = LockDocument::from_document(locked_doc(token)).unwrap();
        let doc = bson::to_document(&lock).unwrap();

        assert_eq!(doc.get_i32("state").unwrap(), 2);
        assert_eq!(doc.get_object_id("ts").unwrap(), token);
        assert_eq!(doc.get_str("_id").unwrap(), "balancer");
    }

    #[test]
    fn test_lock_details_field_order() {
        let token = ObjectId::new();
        let request = LockAcquireRequest::new(
            "balancer",
            token,
            "host1:27017:Balancer",
            "host1:27017:1440000000:123",
            DateTime::from_millis(5),
            "doing balance round",
        );

        let details = request.lock_details();
        let keys: Vec<&str> = details.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["ts", "state", "who", "process", "when", "why"]);
        assert_eq!(details.get_object_id("ts").unwrap(), token);
        assert_eq!(details.get_i32("state").unwrap(), 2);
    }

    #[test]
    fn test_parse_ping_document() {
        let ping = LockPingDocument::from_document(doc! {
            "_id": "host1:27017:1440000000:123",
            "ping": DateTime::from_millis(1_000),
        })
        .unwrap();
        assert_eq!(ping.process_id, "host1:27017:1440000000:123");
        assert_eq!(ping.ping.timestamp_millis(), 1_000);

        let err = LockPingDocument::from_document(doc! { "_id": "p1" }).unwrap_err();
        assert!(matches!(err, CatalogError::FailedToParse(_)));
    }

    #[test]
    fn test_server_info_epoch() {
        let election = ObjectId::new();
        let a = ServerInfo::new(DateTime::from_millis(1), election);
        let b = ServerInfo::new(DateTime::from_millis(2), election);
        let c = ServerInfo::new(DateTime::from_millis(3), ObjectId::new());

        assert!(a.same_epoch(&b));
        assert!(!a.same_epoch(&c));
    }
}
