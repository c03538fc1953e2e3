//! Collection namespaces and field names of the lock catalog.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Database holding the lock and lock ping collections.
pub const CONFIG_DB: &str = "config";

/// Database receiving server status probes.
pub const ADMIN_DB: &str = "admin";

pub const LOCKS_COLL: &str = "locks";
pub const LOCK_PINGS_COLL: &str = "lockpings";

pub const LOCKS_NAMESPACE: &str = "config.locks";
pub const LOCK_PINGS_NAMESPACE: &str = "config.lockpings";

/// Field names of documents in `config.locks`.
pub mod locks {
    pub const NAME: &str = "_id";
    pub const STATE: &str = "state";
    pub const PROCESS: &str = "process";
    pub const FENCING_TOKEN: &str = "ts";
    pub const WHO: &str = "who";
    pub const WHEN: &str = "when";
    pub const WHY: &str = "why";
}

/// Field names of documents in `config.lockpings`.
pub mod lock_pings {
    pub const PROCESS: &str = "_id";
    pub const PING: &str = "ping";
}

/// Fields read from command replies.
pub mod reply {
    pub const OK: &str = "ok";
    pub const CODE: &str = "code";
    pub const CODE_NAME: &str = "codeName";
    pub const ERRMSG: &str = "errmsg";
    pub const WRITE_CONCERN_ERROR: &str = "writeConcernError";
    pub const VALUE: &str = "value";
    pub const LOCAL_TIME: &str = "localTime";
    pub const GLE_STATS: &str = "$gleStats";
    pub const ELECTION_ID: &str = "electionId";
    pub const CURSOR: &str = "cursor";
    pub const FIRST_BATCH: &str = "firstBatch";
}

/// A `db.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Parse `db.collection`; the collection part may itself contain dots.
    pub fn parse(ns: &str) -> Result<Self, String> {
        match ns.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(format!("invalid namespace '{}', expected 'db.collection'", ns)),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl std::str::FromStr for Namespace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Namespace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Namespace {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Namespace::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_parse() {
        let ns = Namespace::parse(LOCKS_NAMESPACE).unwrap();
        assert_eq!(ns.db, "config");
        assert_eq!(ns.coll, "locks");
        assert_eq!(ns.to_string(), "config.locks");

        let ns: Namespace = "config.system.locks".parse().unwrap();
        assert_eq!(ns.db, "config");
        assert_eq!(ns.coll, "system.locks");
    }

    #[test]
    fn test_namespace_constants_agree() {
        assert_eq!(Namespace::new(CONFIG_DB, LOCKS_COLL).to_string(), LOCKS_NAMESPACE);
        assert_eq!(
            Namespace::new(CONFIG_DB, LOCK_PINGS_COLL).to_string(),
            LOCK_PINGS_NAMESPACE
        );
    }

    #[test]
    fn test_namespace_parse_invalid() {
        assert!(Namespace::parse("locks").is_err());
        assert!(Namespace::parse(".locks").is_err());
        assert!(Namespace::parse("config.").is_err());
    }
}
