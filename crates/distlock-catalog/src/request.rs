// Command builders for the lock catalog
// Every catalog mutation is a single findAndModify; reads are a single find

use std::time::Duration;

use bson::{Bson, Document, doc};

use crate::schema::Namespace;

/// Ordered list of `field == value` clauses, all of which must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conjunction {
    clauses: Vec<(String, Bson)>,
}

impl Conjunction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(mut self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    pub fn clauses(&self) -> &[(String, Bson)] {
        &self.clauses
    }

    pub fn to_document(&self) -> Document {
        self.clauses
            .iter()
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect()
    }
}

/// Match predicate of a conditional command.
///
/// Takeover correctness depends on the exact Boolean structure, so the
/// disjunction is represented explicitly instead of being assembled as a
/// raw query document.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// All clauses of a single conjunction
    All(Conjunction),
    /// At least one of the conjunctions (`$or`)
    Any(Vec<Conjunction>),
}

impl Predicate {
    pub fn to_document(&self) -> Document {
        match self {
            Predicate::All(conjunction) => conjunction.to_document(),
            Predicate::Any(branches) => {
                let branches: Vec<Bson> = branches
                    .iter()
                    .map(|branch| Bson::Document(branch.to_document()))
                    .collect();
                doc! { "$or": branches }
            }
        }
    }
}

impl From<Conjunction> for Predicate {
    fn from(conjunction: Conjunction) -> Self {
        Predicate::All(conjunction)
    }
}

/// Mutation applied to the matched document.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// `$set` of the given fields
    Set(Document),
}

impl Update {
    pub fn to_document(&self) -> Document {
        match self {
            Update::Set(fields) => doc! { "$set": fields.clone() },
        }
    }
}

/// Majority, journaled acknowledgement with a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteConcern {
    pub journal: bool,
    pub timeout: Duration,
}

impl WriteConcern {
    pub fn majority(timeout: Duration) -> Self {
        Self {
            journal: true,
            timeout,
        }
    }

    pub fn to_document(&self) -> Document {
        let timeout_ms = i32::try_from(self.timeout.as_millis()).unwrap_or(i32::MAX);
        let mut doc = doc! { "w": "majority" };
        if self.journal {
            doc.insert("j", true);
        }
        doc.insert("wtimeout", timeout_ms);
        doc
    }
}

/// A findAndModify update command.
#[derive(Debug, Clone, PartialEq)]
pub struct FindAndModifyRequest {
    pub namespace: Namespace,
    pub query: Predicate,
    pub update: Update,
    pub upsert: Option<bool>,
    pub should_return_new: Option<bool>,
    pub write_concern: Option<WriteConcern>,
}

impl FindAndModifyRequest {
    pub fn make_update(namespace: Namespace, query: impl Into<Predicate>, update: Update) -> Self {
        Self {
            namespace,
            query: query.into(),
            update,
            upsert: None,
            should_return_new: None,
            write_concern: None,
        }
    }

    pub fn with_upsert(mut self, upsert: bool) -> Self {
        self.upsert = Some(upsert);
        self
    }

    /// Ask for the post-image instead of the pre-image.
    pub fn with_return_new(mut self, return_new: bool) -> Self {
        self.should_return_new = Some(return_new);
        self
    }

    pub fn with_write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = Some(write_concern);
        self
    }

    /// Command document. Optional flags are only emitted when set.
    pub fn to_document(&self) -> Document {
        let mut cmd = doc! {
            "findAndModify": self.namespace.coll.as_str(),
            "query": self.query.to_document(),
            "update": self.update.to_document(),
        };
        if let Some(upsert) = self.upsert {
            cmd.insert("upsert", upsert);
        }
        if let Some(return_new) = self.should_return_new {
            cmd.insert("new", return_new);
        }
        if let Some(write_concern) = &self.write_concern {
            cmd.insert("writeConcern", write_concern.to_document());
        }
        cmd
    }
}

/// A single-batch find command.
#[derive(Debug, Clone, PartialEq)]
pub struct FindRequest {
    pub namespace: Namespace,
    pub filter: Predicate,
    pub limit: i64,
    pub majority_read: bool,
}

impl FindRequest {
    pub fn new(namespace: Namespace, filter: impl Into<Predicate>) -> Self {
        Self {
            namespace,
            filter: filter.into(),
            limit: 1,
            majority_read: true,
        }
    }

    pub fn to_document(&self) -> Document {
        let mut cmd = doc! {
            "find": self.namespace.coll.as_str(),
            "filter": self.filter.to_document(),
            "limit": self.limit,
            "singleBatch": true,
        };
        if self.majority_read {
            cmd.insert("readConcern", doc! { "level": "majority" });
        }
        cmd
    }
}
