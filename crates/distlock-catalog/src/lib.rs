//! Distlock Catalog - Fencing-token distributed locks over a replicated store
//!
//! This crate provides:
//! - The lock catalog protocol: grab, overtake, unlock, ping and lookups,
//!   each a single conditional command with majority write concern
//! - Reply classification for findAndModify, find and serverStatus
//! - Host targeting and command runner seams
//! - An in-memory config server for exercising the protocol

pub mod catalog;
pub mod config;
pub mod memory;
pub mod model;
pub mod remote;
pub mod request;
pub mod response;
pub mod schema;

// Re-export the catalog and its configuration
pub use catalog::{DistLockCatalog, ReplSetDistLockCatalog};
pub use config::DistLockCatalogConfig;

// Re-export data model
pub use model::{LockAcquireRequest, LockDocument, LockPingDocument, LockState, ServerInfo};

// Re-export transport seams
pub use memory::{Fault, InMemoryConfigServer};
pub use remote::{
    HostAndPort, ReadPreference, ReadPreferenceSetting, RemoteCommandRequest,
    RemoteCommandResponse, RemoteCommandRunner, RemoteCommandTargeter, StaticHostTargeter,
};
