//! Classification of raw command replies
//!
//! A findAndModify reply is resolved in a fixed order: command status first,
//! then the write concern error, then the `value` field. Callers depend on
//! this order when deciding whether a retry is safe, so a write concern
//! failure always wins over the result document.

use bson::oid::ObjectId;
use bson::{Bson, Document};
use serde::Deserialize;

use distlock_common::error::UNKNOWN_ERROR;
use distlock_common::{CatalogError, Result};

use crate::model::ServerInfo;
use crate::schema::reply;

/// Parsed `writeConcernError` sub-document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WriteConcernErrorDetail {
    pub code: i32,
    #[serde(default)]
    pub errmsg: Option<String>,
    #[serde(rename = "errInfo", default)]
    pub err_info: Option<Document>,
}

impl WriteConcernErrorDetail {
    pub fn parse(doc: &Document) -> Result<Self> {
        bson::from_document(doc.clone()).map_err(|e| {
            CatalogError::UnsupportedFormat(format!("malformed writeConcernError: {}", e))
        })
    }

    pub fn message(&self) -> &str {
        self.errmsg.as_deref().unwrap_or_default()
    }
}

/// Truthiness of a reply field such as `ok`.
fn true_value(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(n) => *n != 0.0,
        Bson::Null | Bson::Undefined => false,
        _ => true,
    }
}

fn numeric_code(value: &Bson) -> Option<i32> {
    match value {
        Bson::Int32(n) => Some(*n),
        Bson::Int64(n) => i32::try_from(*n).ok(),
        Bson::Double(n) => Some(*n as i32),
        _ => None,
    }
}

/// Turn a reply with a falsy `ok` into `CommandFailed`, keeping the store's
/// own code and message.
pub fn get_status_from_command_result(response: &Document) -> Result<()> {
    if response.get(reply::OK).is_some_and(true_value) {
        return Ok(());
    }

    let code = response
        .get(reply::CODE)
        .and_then(numeric_code)
        .unwrap_or(UNKNOWN_ERROR.code);
    let code_name = response.get_str(reply::CODE_NAME).ok().map(str::to_string);
    let message = response
        .get_str(reply::ERRMSG)
        .or_else(|_| response.get_str("$err"))
        .map(str::to_string)
        .unwrap_or_else(|_| "command failed without an error message".to_string());

    Err(CatalogError::CommandFailed {
        code,
        code_name,
        message,
    })
}

/// Classify a findAndModify reply.
///
/// `Ok(None)` means no document matched; `Ok(Some(doc))` carries the image
/// returned by the store.
pub fn extract_find_and_modify_new_obj(response: &Document) -> Result<Option<Document>> {
    get_status_from_command_result(response)?;

    match response.get(reply::WRITE_CONCERN_ERROR) {
        Some(Bson::Document(wc_error)) => {
            let detail = WriteConcernErrorDetail::parse(wc_error)?;
            return Err(CatalogError::WriteConcernFailed(detail.message().to_string()));
        }
        Some(other) => {
            return Err(CatalogError::UnsupportedFormat(format!(
                "'{}' field has type {:?}, expected an object",
                reply::WRITE_CONCERN_ERROR,
                other.element_type()
            )));
        }
        None => {}
    }

    match response.get(reply::VALUE) {
        // nMatched == 0
        Some(Bson::Null) | None => Ok(None),
        Some(Bson::Document(doc)) => Ok(Some(doc.clone())),
        Some(other) => Err(CatalogError::UnsupportedFormat(format!(
            "expected an object from the findAndModify response '{}' field, found {:?}",
            reply::VALUE,
            other.element_type()
        ))),
    }
}

/// Extract the election id from a serverStatus reply.
pub fn extract_election_id(response: &Document) -> Result<ObjectId> {
    let gle_stats = match response.get(reply::GLE_STATS) {
        Some(Bson::Document(stats)) => stats,
        Some(other) => {
            return Err(CatalogError::UnsupportedFormat(format!(
                "'{}' field has type {:?}, expected an object",
                reply::GLE_STATS,
                other.element_type()
            )));
        }
        None => {
            return Err(CatalogError::UnsupportedFormat(format!(
                "missing '{}' field in serverStatus response",
                reply::GLE_STATS
            )));
        }
    };

    match gle_stats.get(reply::ELECTION_ID) {
        Some(Bson::ObjectId(election_id)) => Ok(*election_id),
        Some(other) => Err(CatalogError::UnsupportedFormat(format!(
            "'{}.{}' field has type {:?}, expected an ObjectId",
            reply::GLE_STATS,
            reply::ELECTION_ID,
            other.element_type()
        ))),
        None => Err(CatalogError::UnsupportedFormat(format!(
            "missing '{}.{}' field in serverStatus response",
            reply::GLE_STATS,
            reply::ELECTION_ID
        ))),
    }
}

/// Extract node time and election id from a serverStatus reply.
pub fn extract_server_info(response: &Document) -> Result<ServerInfo> {
    get_status_from_command_result(response)?;

    let server_time = match response.get(reply::LOCAL_TIME) {
        Some(Bson::DateTime(time)) => *time,
        Some(other) => {
            return Err(CatalogError::UnsupportedFormat(format!(
                "'{}' field has type {:?}, expected a date",
                reply::LOCAL_TIME,
                other.element_type()
            )));
        }
        None => {
            return Err(CatalogError::UnsupportedFormat(format!(
                "missing '{}' field in serverStatus response",
                reply::LOCAL_TIME
            )));
        }
    };

    let election_id = extract_election_id(response)?;
    Ok(ServerInfo::new(server_time, election_id))
}

/// Documents of `cursor.firstBatch` from a find reply.
pub fn extract_first_batch(response: &Document) -> Result<Vec<Document>> {
    get_status_from_command_result(response)?;

    let cursor = response.get_document(reply::CURSOR).map_err(|_| {
        CatalogError::UnsupportedFormat(format!(
            "expected an object in the find response '{}' field",
            reply::CURSOR
        ))
    })?;
    let batch = cursor.get_array(reply::FIRST_BATCH).map_err(|_| {
        CatalogError::UnsupportedFormat(format!(
            "expected an array in the find response '{}.{}' field",
            reply::CURSOR,
            reply::FIRST_BATCH
        ))
    })?;

    batch
        .iter()
        .map(|entry| match entry {
            Bson::Document(doc) => Ok(doc.clone()),
            other => Err(CatalogError::UnsupportedFormat(format!(
                "expected only objects in '{}.{}', found {:?}",
                reply::CURSOR,
                reply::FIRST_BATCH,
                other.element_type()
            ))),
        })
        .collect()
}
