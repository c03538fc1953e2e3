//! Lock catalog protocol
//!
//! Each operation is one round trip: resolve the primary, send a single
//! findAndModify (or find), classify the reply. Mutual exclusion and fencing
//! are carried entirely by the match predicates; nothing is retried here.

use std::sync::Arc;

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{Bson, DateTime, Document, doc};
use tracing::{debug, warn};

use distlock_common::{CatalogError, Result};

use crate::config::DistLockCatalogConfig;
use crate::model::{LockAcquireRequest, LockDocument, LockPingDocument, LockState, ServerInfo};
use crate::remote::{
    ReadPreferenceSetting, RemoteCommandRequest, RemoteCommandRunner, RemoteCommandTargeter,
};
use crate::request::{
    Conjunction, FindAndModifyRequest, FindRequest, Predicate, Update, WriteConcern,
};
use crate::response;
use crate::schema::{ADMIN_DB, Namespace, lock_pings, locks};

/// Primitives of the distributed lock protocol.
#[async_trait]
pub trait DistLockCatalog: Send + Sync {
    /// Read back the heartbeat of `process_id`.
    async fn get_ping(&self, process_id: &str) -> Result<LockPingDocument>;

    /// Record a heartbeat for `process_id`, creating it if needed.
    async fn ping(&self, process_id: &str, ping: DateTime) -> Result<()>;

    /// Acquire an unlocked or not yet existing lock.
    ///
    /// `Ok(None)` means the lock is held by someone else.
    async fn grab_lock(&self, request: &LockAcquireRequest) -> Result<Option<LockDocument>>;

    /// Take over a lock that is unlocked or still held with `current_holder`.
    ///
    /// `Ok(None)` means another process changed the lock first.
    async fn overtake_lock(
        &self,
        request: &LockAcquireRequest,
        current_holder: ObjectId,
    ) -> Result<Option<LockDocument>>;

    /// Release the acquisition identified by `fencing_token`. Releasing an
    /// acquisition that no longer holds the lock is a no-op.
    async fn unlock(&self, fencing_token: ObjectId) -> Result<()>;

    /// Clock and election id of the current primary.
    async fn get_server_info(&self) -> Result<ServerInfo>;

    /// Look up the lock document recording the acquisition `fencing_token`.
    async fn get_lock_by_ts(&self, fencing_token: ObjectId) -> Result<LockDocument>;
}

/// Lock catalog backed by the config servers of a replica set.
pub struct ReplSetDistLockCatalog {
    targeter: Arc<dyn RemoteCommandTargeter>,
    runner: Arc<dyn RemoteCommandRunner>,
    read_pref: ReadPreferenceSetting,
    write_concern: WriteConcern,
    locks_ns: Namespace,
    lock_pings_ns: Namespace,
}

impl ReplSetDistLockCatalog {
    pub fn new(
        targeter: Arc<dyn RemoteCommandTargeter>,
        runner: Arc<dyn RemoteCommandRunner>,
        config: &DistLockCatalogConfig,
    ) -> Self {
        Self {
            targeter,
            runner,
            read_pref: ReadPreferenceSetting::primary_only(),
            write_concern: WriteConcern::majority(config.write_concern_timeout()),
            locks_ns: config.locks_namespace.clone(),
            lock_pings_ns: config.lock_pings_namespace.clone(),
        }
    }

    async fn run(&self, db_name: &str, cmd: Document) -> Result<Document> {
        let target = self.targeter.find_host(&self.read_pref).await?;
        debug!(host = %target, db = db_name, "running catalog command");

        let response = self
            .runner
            .run_command(RemoteCommandRequest::new(target, db_name, cmd))
            .await?;
        Ok(response.data)
    }

    async fn find_and_modify(
        &self,
        op: &'static str,
        request: FindAndModifyRequest,
    ) -> Result<Option<Document>> {
        let data = self
            .run(&request.namespace.db, request.to_document())
            .await?;

        let result = response::extract_find_and_modify_new_obj(&data);
        if let Err(CatalogError::WriteConcernFailed(msg)) = &result {
            warn!(op, ns = %request.namespace, "write concern not satisfied: {}", msg);
        }
        result
    }

    async fn find_one(&self, request: FindRequest) -> Result<Option<Document>> {
        let data = self
            .run(&request.namespace.db, request.to_document())
            .await?;
        Ok(response::extract_first_batch(&data)?.into_iter().next())
    }

    fn lock_update(
        &self,
        query: impl Into<Predicate>,
        request: &LockAcquireRequest,
    ) -> FindAndModifyRequest {
        FindAndModifyRequest::make_update(
            self.locks_ns.clone(),
            query,
            Update::Set(request.lock_details()),
        )
        .with_return_new(true)
        .with_write_concern(self.write_concern)
    }
}

fn unlocked(name: &str) -> Conjunction {
    Conjunction::new()
        .equals(locks::NAME, name)
        .equals(locks::STATE, i32::from(LockState::Unlocked))
}

fn set_field(field: &str, value: impl Into<Bson>) -> Document {
    let mut fields = Document::new();
    fields.insert(field, value);
    fields
}

fn parse_lock(new_doc: Option<Document>) -> Result<Option<LockDocument>> {
    new_doc.map(LockDocument::from_document).transpose()
}

#[async_trait]
impl DistLockCatalog for ReplSetDistLockCatalog {
    async fn get_ping(&self, process_id: &str) -> Result<LockPingDocument> {
        let request = FindRequest::new(
            self.lock_pings_ns.clone(),
            Conjunction::new().equals(lock_pings::PROCESS, process_id),
        );

        match self.find_one(request).await? {
            Some(doc) => LockPingDocument::from_document(doc),
            None => Err(CatalogError::NoMatchingDocument(format!(
                "ping entry for {} not found",
                process_id
            ))),
        }
    }

    async fn ping(&self, process_id: &str, ping: DateTime) -> Result<()> {
        let request = FindAndModifyRequest::make_update(
            self.lock_pings_ns.clone(),
            Conjunction::new().equals(lock_pings::PROCESS, process_id),
            Update::Set(set_field(lock_pings::PING, ping)),
        )
        .with_upsert(true)
        .with_write_concern(self.write_concern);

        self.find_and_modify("ping", request).await.map(|_| ())
    }

    async fn grab_lock(&self, request: &LockAcquireRequest) -> Result<Option<LockDocument>> {
        let update = self
            .lock_update(unlocked(&request.name), request)
            .with_upsert(true);

        match self.find_and_modify("grab_lock", update).await {
            Ok(new_doc) => parse_lock(new_doc),
            // The upsert collided with an existing document that is not
            // unlocked: somebody else holds the lock.
            Err(err) if err.is_duplicate_key() => {
                debug!(lock = %request.name, "lock busy: {}", err);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn overtake_lock(
        &self,
        request: &LockAcquireRequest,
        current_holder: ObjectId,
    ) -> Result<Option<LockDocument>> {
        let query = Predicate::Any(vec![
            unlocked(&request.name),
            Conjunction::new()
                .equals(locks::NAME, request.name.as_str())
                .equals(locks::FENCING_TOKEN, current_holder),
        ]);

        let new_doc = self
            .find_and_modify("overtake_lock", self.lock_update(query, request))
            .await?;
        if new_doc.is_none() {
            debug!(lock = %request.name, holder = %current_holder, "lock changed hands before takeover");
        }
        parse_lock(new_doc)
    }

    async fn unlock(&self, fencing_token: ObjectId) -> Result<()> {
        let request = FindAndModifyRequest::make_update(
            self.locks_ns.clone(),
            Conjunction::new().equals(locks::FENCING_TOKEN, fencing_token),
            Update::Set(set_field(locks::STATE, i32::from(LockState::Unlocked))),
        )
        .with_write_concern(self.write_concern);

        self.find_and_modify("unlock", request).await.map(|_| ())
    }

    async fn get_server_info(&self) -> Result<ServerInfo> {
        let data = self.run(ADMIN_DB, doc! { "serverStatus": 1 }).await?;
        response::extract_server_info(&data)
    }

    async fn get_lock_by_ts(&self, fencing_token: ObjectId) -> Result<LockDocument> {
        let request = FindRequest::new(
            self.locks_ns.clone(),
            Conjunction::new().equals(locks::FENCING_TOKEN, fencing_token),
        );

        match self.find_one(request).await? {
            Some(doc) => LockDocument::from_document(doc),
            None => Err(CatalogError::LockNotFound(format!(
                "lock with ts {} not found",
                fencing_token
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{HostAndPort, RemoteCommandResponse, StaticHostTargeter};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Runner answering with canned replies and recording every request.
    #[derive(Default)]
    struct ScriptedRunner {
        replies: Mutex<VecDeque<Result<Document>>>,
        requests: Mutex<Vec<RemoteCommandRequest>>,
    }

    impl ScriptedRunner {
        fn reply(self, reply: Result<Document>) -> Self {
            self.replies.lock().push_back(reply);
            self
        }

        fn last_request(&self) -> RemoteCommandRequest {
            self.requests.lock().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl RemoteCommandRunner for ScriptedRunner {
        async fn run_command(&self, request: RemoteCommandRequest) -> Result<RemoteCommandResponse> {
            self.requests.lock().push(request);
            let reply = self
                .replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(CatalogError::Transport("no scripted reply".to_string())));
            reply.map(RemoteCommandResponse::new)
        }
    }

    fn catalog(runner: Arc<ScriptedRunner>) -> ReplSetDistLockCatalog {
        let targeter = Arc::new(StaticHostTargeter::new(vec![HostAndPort::new("cfg1", 27019)]));
        ReplSetDistLockCatalog::new(targeter, runner, &DistLockCatalogConfig::default())
    }

    fn acquire_request(token: ObjectId) -> LockAcquireRequest {
        LockAcquireRequest::new(
            "balancer",
            token,
            "host1:27017:Balancer",
            "host1:27017:1440000000:123",
            DateTime::from_millis(1_440_000_000_000),
            "doing balance round",
        )
    }

    fn stored_lock(request: &LockAcquireRequest) -> Document {
        let mut stored = doc! { "_id": request.name.as_str() };
        for (field, value) in request.lock_details() {
            stored.insert(field, value);
        }
        stored
    }

    fn write_concern() -> Document {
        doc! { "w": "majority", "j": true, "wtimeout": 15000 }
    }

    #[tokio::test]
    async fn test_grab_lock_command() {
        let token = ObjectId::new();
        let request = acquire_request(token);
        let new_doc = stored_lock(&request);

        let runner = Arc::new(ScriptedRunner::default().reply(Ok(doc! {
            "lastErrorObject": { "n": 1, "updatedExisting": false },
            "value": new_doc,
            "ok": 1,
        })));
        let lock = catalog(runner.clone())
            .grab_lock(&request)
            .await
            .unwrap()
            .unwrap();

        assert!(lock.is_held_with(&token));
        let sent = runner.last_request();
        assert_eq!(sent.target, HostAndPort::new("cfg1", 27019));
        assert_eq!(sent.db_name, "config");
        assert_eq!(
            sent.cmd,
            doc! {
                "findAndModify": "locks",
                "query": { "_id": "balancer", "state": 0 },
                "update": { "$set": {
                    "ts": token,
                    "state": 2,
                    "who": "host1:27017:Balancer",
                    "process": "host1:27017:1440000000:123",
                    "when": DateTime::from_millis(1_440_000_000_000),
                    "why": "doing balance round",
                } },
                "upsert": true,
                "new": true,
                "writeConcern": write_concern(),
            }
        );
    }

    #[tokio::test]
    async fn test_grab_lock_busy_on_duplicate_key() {
        let runner = Arc::new(ScriptedRunner::default().reply(Ok(duplicate_key_reply())));

        let result = catalog(runner).grab_lock(&acquire_request(ObjectId::new())).await;
        assert_eq!(result, Ok(None));
    }

    #[tokio::test]
    async fn test_grab_lock_propagates_other_failures() {
        let runner = Arc::new(ScriptedRunner::default().reply(Ok(doc! {
            "ok": 0,
            "code": 10107,
            "errmsg": "not master",
        })));

        let err = catalog(runner)
            .grab_lock(&acquire_request(ObjectId::new()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 10107);
    }

    fn duplicate_key_reply() -> Document {
        doc! {
            "ok": 0,
            "code": 11000,
            "codeName": "DuplicateKey",
            "errmsg": "E11000 duplicate key error collection: config.locks",
        }
    }

    #[tokio::test]
    async fn test_duplicate_key_only_means_busy_for_grab() {
        let runner = Arc::new(
            ScriptedRunner::default()
                .reply(Ok(duplicate_key_reply()))
                .reply(Ok(duplicate_key_reply())),
        );
        let catalog = catalog(runner);

        let err = catalog
            .overtake_lock(&acquire_request(ObjectId::new()), ObjectId::new())
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key());

        let err = catalog.unlock(ObjectId::new()).await.unwrap_err();
        assert!(err.is_duplicate_key());
    }

    #[tokio::test]
    async fn test_incomplete_post_image_fails_to_parse() {
        let incomplete = || -> Result<Document> {
            Ok(doc! { "value": { "_id": "balancer", "state": 2 }, "ok": 1 })
        };
        let runner = Arc::new(
            ScriptedRunner::default()
                .reply(incomplete())
                .reply(incomplete()),
        );
        let catalog = catalog(runner);
        let request = acquire_request(ObjectId::new());

        let err = catalog.grab_lock(&request).await.unwrap_err();
        assert!(matches!(err, CatalogError::FailedToParse(_)));

        let err = catalog
            .overtake_lock(&request, ObjectId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::FailedToParse(_)));
    }

    #[tokio::test]
    async fn test_overtake_lock_command() {
        let token = ObjectId::new();
        let current = ObjectId::new();
        let runner = Arc::new(ScriptedRunner::default().reply(Ok(doc! { "value": null, "ok": 1 })));

        let result = catalog(runner.clone())
            .overtake_lock(&acquire_request(token), current)
            .await;
        assert_eq!(result, Ok(None));

        let cmd = runner.last_request().cmd;
        assert_eq!(
            cmd.get_document("query").unwrap(),
            &doc! { "$or": [
                { "_id": "balancer", "state": 0 },
                { "_id": "balancer", "ts": current },
            ] }
        );
        assert!(!cmd.contains_key("upsert"));
        assert_eq!(cmd.get_bool("new").unwrap(), true);
        assert_eq!(cmd.get_document("writeConcern").unwrap(), &write_concern());
    }

    #[tokio::test]
    async fn test_unlock_command() {
        let token = ObjectId::new();
        let runner = Arc::new(ScriptedRunner::default().reply(Ok(doc! { "value": null, "ok": 1 })));

        catalog(runner.clone()).unlock(token).await.unwrap();

        assert_eq!(
            runner.last_request().cmd,
            doc! {
                "findAndModify": "locks",
                "query": { "ts": token },
                "update": { "$set": { "state": 0 } },
                "writeConcern": write_concern(),
            }
        );
    }

    #[tokio::test]
    async fn test_ping_command() {
        let now = DateTime::from_millis(42);
        let runner = Arc::new(ScriptedRunner::default().reply(Ok(doc! { "value": null, "ok": 1 })));

        catalog(runner.clone()).ping("p1", now).await.unwrap();

        let sent = runner.last_request();
        assert_eq!(sent.db_name, "config");
        assert_eq!(
            sent.cmd,
            doc! {
                "findAndModify": "lockpings",
                "query": { "_id": "p1" },
                "update": { "$set": { "ping": now } },
                "upsert": true,
                "writeConcern": write_concern(),
            }
        );
    }

    #[tokio::test]
    async fn test_write_concern_error_wins_over_value() {
        let runner = Arc::new(ScriptedRunner::default().reply(Ok(doc! {
            "value": { "_id": "balancer", "state": 0 },
            "writeConcernError": { "code": 64, "errmsg": "waiting for replication timed out" },
            "ok": 1,
        })));

        let err = catalog(runner).unlock(ObjectId::new()).await.unwrap_err();
        assert_eq!(
            err,
            CatalogError::WriteConcernFailed("waiting for replication timed out".to_string())
        );
    }

    #[tokio::test]
    async fn test_transport_error_propagates() {
        let runner = Arc::new(
            ScriptedRunner::default().reply(Err(CatalogError::Transport("connection reset".to_string()))),
        );

        let err = catalog(runner).ping("p1", DateTime::now()).await.unwrap_err();
        assert!(err.is_network_error());
    }

    #[tokio::test]
    async fn test_no_host_sends_nothing() {
        let runner = Arc::new(ScriptedRunner::default());
        let catalog = ReplSetDistLockCatalog::new(
            Arc::new(StaticHostTargeter::new(Vec::new())),
            runner.clone(),
            &DistLockCatalogConfig::default(),
        );

        let err = catalog.unlock(ObjectId::new()).await.unwrap_err();
        assert!(matches!(err, CatalogError::HostUnreachable(_)));
        assert!(runner.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_get_server_info() {
        let election = ObjectId::new();
        let runner = Arc::new(ScriptedRunner::default().reply(Ok(doc! {
            "localTime": DateTime::from_millis(1_000),
            "$gleStats": { "lastOpTime": 0, "electionId": election },
            "ok": 1,
        })));

        let info = catalog(runner.clone()).get_server_info().await.unwrap();
        assert_eq!(info, ServerInfo::new(DateTime::from_millis(1_000), election));

        let sent = runner.last_request();
        assert_eq!(sent.db_name, "admin");
        assert_eq!(sent.cmd, doc! { "serverStatus": 1 });
    }

    #[tokio::test]
    async fn test_get_lock_by_ts() {
        let token = ObjectId::new();
        let request = acquire_request(token);
        let stored = stored_lock(&request);

        let runner = Arc::new(
            ScriptedRunner::default()
                .reply(Ok(doc! { "cursor": { "firstBatch": [stored], "id": 0i64 }, "ok": 1 }))
                .reply(Ok(doc! { "cursor": { "firstBatch": [], "id": 0i64 }, "ok": 1 })),
        );
        let catalog = catalog(runner.clone());

        let lock = catalog.get_lock_by_ts(token).await.unwrap();
        assert!(lock.is_held_with(&token));
        assert_eq!(
            runner.last_request().cmd.get_document("filter").unwrap(),
            &doc! { "ts": token }
        );

        let err = catalog.get_lock_by_ts(token).await.unwrap_err();
        assert!(matches!(err, CatalogError::LockNotFound(_)));
    }

    #[tokio::test]
    async fn test_get_ping_not_found() {
        let runner = Arc::new(
            ScriptedRunner::default()
                .reply(Ok(doc! { "cursor": { "firstBatch": [], "id": 0i64 }, "ok": 1 })),
        );

        let err = catalog(runner).get_ping("p1").await.unwrap_err();
        assert!(matches!(err, CatalogError::NoMatchingDocument(_)));
    }
}
