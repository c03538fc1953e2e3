//! In-memory config server
//!
//! A [`RemoteCommandRunner`] that executes the commands issued by the lock
//! catalog against collections held in process memory. Every findAndModify
//! runs under the collection's exclusive guard, so concurrent callers observe
//! the same single-document atomicity the real store provides.
//!
//! Faults can be queued to exercise the error paths: transport failures,
//! command failures, and writes that apply but miss their write concern.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{Bson, DateTime, Document, doc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use distlock_common::error::{
    DUPLICATE_KEY, ErrorCode, FAILED_TO_PARSE, UNKNOWN_ERROR, WRITE_CONCERN_FAILED,
};
use distlock_common::{CatalogError, Result};

use crate::remote::{RemoteCommandRequest, RemoteCommandResponse, RemoteCommandRunner};
use crate::schema::{ADMIN_DB, reply};

const COMMAND_NOT_FOUND: ErrorCode<'static> = ErrorCode {
    code: 59,
    message: "command not found",
};

const UNAUTHORIZED: ErrorCode<'static> = ErrorCode {
    code: 13,
    message: "unauthorized",
};

/// Failure to apply to the next command received.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// The round trip fails; nothing is executed.
    Transport(String),
    /// The command is rejected with `ok: 0`; nothing is executed.
    CommandFailed { code: i32, message: String },
    /// The command is executed but the reply carries a `writeConcernError`.
    WriteConcern(String),
}

/// Counters of executed commands.
#[derive(Debug, Default)]
struct ServerStats {
    commands: AtomicU64,
    writes: AtomicU64,
    upserts: AtomicU64,
    duplicate_keys: AtomicU64,
}

/// Replica set primary emulated in memory.
pub struct InMemoryConfigServer {
    /// Documents per namespace (`db.coll`), in insertion order
    collections: DashMap<String, Vec<Document>>,
    election_id: Mutex<ObjectId>,
    faults: Mutex<VecDeque<Fault>>,
    received: Mutex<Vec<RemoteCommandRequest>>,
    stats: ServerStats,
}

impl InMemoryConfigServer {
    pub fn new() -> Self {
        Self {
            collections: DashMap::new(),
            election_id: Mutex::new(ObjectId::new()),
            faults: Mutex::new(VecDeque::new()),
            received: Mutex::new(Vec::new()),
            stats: ServerStats::default(),
        }
    }

    /// Store a document as is, bypassing every command.
    pub fn insert(&self, namespace: &str, document: Document) {
        self.collections
            .entry(namespace.to_string())
            .or_default()
            .push(document);
    }

    pub fn documents(&self, namespace: &str) -> Vec<Document> {
        self.collections
            .get(namespace)
            .map(|coll| coll.value().clone())
            .unwrap_or_default()
    }

    /// Look up a document by `_id`.
    pub fn find_by_id(&self, namespace: &str, id: impl Into<Bson>) -> Option<Document> {
        let id = id.into();
        self.collections.get(namespace).and_then(|coll| {
            coll.iter()
                .find(|d| d.get("_id").is_some_and(|v| values_equal(v, &id)))
                .cloned()
        })
    }

    pub fn election_id(&self) -> ObjectId {
        *self.election_id.lock()
    }

    /// Simulate an election: the node reports a new election id from now on.
    pub fn step_down(&self) -> ObjectId {
        let election_id = ObjectId::new();
        *self.election_id.lock() = election_id;
        debug!(election_id = %election_id, "new primary elected");
        election_id
    }

    /// Queue a fault for the next command received.
    pub fn inject_fault(&self, fault: Fault) {
        self.faults.lock().push_back(fault);
    }

    /// Every request received so far, in arrival order.
    pub fn received_commands(&self) -> Vec<RemoteCommandRequest> {
        self.received.lock().clone()
    }

    pub fn command_count(&self) -> u64 {
        self.stats.commands.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.stats.writes.load(Ordering::Relaxed)
    }

    pub fn upsert_count(&self) -> u64 {
        self.stats.upserts.load(Ordering::Relaxed)
    }

    pub fn duplicate_key_count(&self) -> u64 {
        self.stats.duplicate_keys.load(Ordering::Relaxed)
    }

    fn execute(&self, request: &RemoteCommandRequest, wc_fault: Option<String>) -> Document {
        let Some(name) = request.cmd.keys().next().map(String::as_str) else {
            return error_reply(FAILED_TO_PARSE.code, "empty command document");
        };

        let mut response = match name {
            "findAndModify" => self.find_and_modify(&request.db_name, &request.cmd),
            "find" => self.find(&request.db_name, &request.cmd),
            "serverStatus" => self.server_status(request),
            other => error_reply(
                COMMAND_NOT_FOUND.code,
                &format!("no such command: '{}'", other),
            ),
        };

        if let Some(errmsg) = wc_fault {
            response.insert(
                reply::WRITE_CONCERN_ERROR,
                doc! {
                    "code": WRITE_CONCERN_FAILED.code,
                    "codeName": "WriteConcernFailed",
                    "errmsg": errmsg,
                    "errInfo": { "wtimeout": true },
                },
            );
        }
        response
    }

    fn find_and_modify(&self, db_name: &str, cmd: &Document) -> Document {
        let (coll_name, query, set) = match parse_find_and_modify(cmd) {
            Ok(parts) => parts,
            Err(msg) => return error_reply(FAILED_TO_PARSE.code, &msg),
        };
        let upsert = cmd.get_bool("upsert").unwrap_or(false);
        let return_new = cmd.get_bool("new").unwrap_or(false);
        let namespace = format!("{}.{}", db_name, coll_name);

        let mut coll = self.collections.entry(namespace.clone()).or_default();

        if let Some(existing) = coll.iter_mut().find(|d| matches_query(d, query)) {
            let pre_image = existing.clone();
            for (field, value) in set {
                existing.insert(field.clone(), value.clone());
            }
            self.stats.writes.fetch_add(1, Ordering::Relaxed);

            let value = if return_new {
                existing.clone()
            } else {
                pre_image
            };
            return doc! {
                "lastErrorObject": { "n": 1, "updatedExisting": true },
                "value": value,
                "ok": 1,
            };
        }

        if !upsert {
            return doc! {
                "lastErrorObject": { "n": 0, "updatedExisting": false },
                "value": Bson::Null,
                "ok": 1,
            };
        }

        let mut inserted = Document::new();
        for (field, value) in query {
            if !field.starts_with('$') {
                inserted.insert(field.clone(), value.clone());
            }
        }
        for (field, value) in set {
            inserted.insert(field.clone(), value.clone());
        }
        let id = match inserted.get("_id") {
            Some(id) => id.clone(),
            None => {
                let id = Bson::ObjectId(ObjectId::new());
                inserted.insert("_id", id.clone());
                id
            }
        };

        if coll
            .iter()
            .any(|d| d.get("_id").is_some_and(|v| values_equal(v, &id)))
        {
            self.stats.duplicate_keys.fetch_add(1, Ordering::Relaxed);
            debug!(ns = %namespace, id = %id, "upsert collided with existing document");
            let mut response = error_reply(
                DUPLICATE_KEY.code,
                &format!(
                    "E11000 duplicate key error collection: {} index: _id_ dup key: {{ _id: {} }}",
                    namespace, id
                ),
            );
            response.insert(reply::CODE_NAME, "DuplicateKey");
            return response;
        }

        coll.push(inserted.clone());
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats.upserts.fetch_add(1, Ordering::Relaxed);

        let value = if return_new {
            Bson::Document(inserted)
        } else {
            Bson::Null
        };
        doc! {
            "lastErrorObject": { "n": 1, "updatedExisting": false, "upserted": id },
            "value": value,
            "ok": 1,
        }
    }

    fn find(&self, db_name: &str, cmd: &Document) -> Document {
        let coll_name = match cmd.get_str("find") {
            Ok(name) => name,
            Err(_) => {
                return error_reply(FAILED_TO_PARSE.code, "collection name must be a string");
            }
        };
        let empty = Document::new();
        let filter = cmd.get_document("filter").unwrap_or(&empty);
        let limit = match cmd.get("limit") {
            Some(Bson::Int64(n)) => *n,
            Some(Bson::Int32(n)) => i64::from(*n),
            _ => 0,
        };
        let namespace = format!("{}.{}", db_name, coll_name);

        let batch: Vec<Bson> = self
            .collections
            .get(&namespace)
            .map(|coll| {
                coll.iter()
                    .filter(|d| matches_query(d, filter))
                    .take(if limit > 0 { limit as usize } else { usize::MAX })
                    .cloned()
                    .map(Bson::Document)
                    .collect()
            })
            .unwrap_or_default();

        doc! {
            "cursor": { "firstBatch": batch, "id": 0i64, "ns": namespace },
            "ok": 1,
        }
    }

    fn server_status(&self, request: &RemoteCommandRequest) -> Document {
        if request.db_name != ADMIN_DB {
            return error_reply(
                UNAUTHORIZED.code,
                "serverStatus may only be run against the admin database",
            );
        }

        doc! {
            "host": request.target.to_string(),
            "localTime": DateTime::now(),
            "$gleStats": {
                "lastOpTime": bson::Timestamp { time: 0, increment: 0 },
                "electionId": self.election_id(),
            },
            "ok": 1,
        }
    }
}

impl Default for InMemoryConfigServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteCommandRunner for InMemoryConfigServer {
    async fn run_command(&self, request: RemoteCommandRequest) -> Result<RemoteCommandResponse> {
        self.received.lock().push(request.clone());
        self.stats.commands.fetch_add(1, Ordering::Relaxed);

        let fault = self.faults.lock().pop_front();
        let wc_fault = match fault {
            Some(Fault::Transport(msg)) => {
                warn!(target_host = %request.target, "injected transport failure");
                return Err(CatalogError::Transport(msg));
            }
            Some(Fault::CommandFailed { code, message }) => {
                return Ok(RemoteCommandResponse::new(error_reply(code, &message)));
            }
            Some(Fault::WriteConcern(msg)) => Some(msg),
            None => None,
        };

        Ok(RemoteCommandResponse::new(self.execute(&request, wc_fault)))
    }
}

fn error_reply(code: i32, message: &str) -> Document {
    let code = if code == 0 { UNKNOWN_ERROR.code } else { code };
    doc! { "ok": 0, "code": code, "errmsg": message }
}

fn parse_find_and_modify(
    cmd: &Document,
) -> std::result::Result<(&str, &Document, &Document), String> {
    let coll_name = cmd
        .get_str("findAndModify")
        .map_err(|_| "collection name must be a string".to_string())?;
    let query = cmd
        .get_document("query")
        .map_err(|_| "'query' must be an object".to_string())?;
    let update = cmd
        .get_document("update")
        .map_err(|_| "'update' must be an object".to_string())?;

    match update.keys().next().map(String::as_str) {
        Some("$set") if update.len() == 1 => {}
        _ => return Err("only a single '$set' update is supported".to_string()),
    }
    let set = update
        .get_document("$set")
        .map_err(|_| "'$set' must be an object".to_string())?;

    Ok((coll_name, query, set))
}

/// Equality and `$or` matching, the subset of the query language the
/// catalog emits.
fn matches_query(document: &Document, query: &Document) -> bool {
    query.iter().all(|(field, expected)| match field.as_str() {
        "$or" => match expected {
            Bson::Array(branches) => branches.iter().any(|branch| match branch {
                Bson::Document(branch) => matches_query(document, branch),
                _ => false,
            }),
            _ => false,
        },
        _ => document
            .get(field)
            .is_some_and(|actual| values_equal(actual, expected)),
    })
}

/// Numbers compare by value regardless of their BSON width.
fn values_equal(a: &Bson, b: &Bson) -> bool {
    fn as_f64(value: &Bson) -> Option<f64> {
        match value {
            Bson::Int32(n) => Some(f64::from(*n)),
            Bson::Int64(n) => Some(*n as f64),
            Bson::Double(n) => Some(*n),
            _ => None,
        }
    }

    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}
