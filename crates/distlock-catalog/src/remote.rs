//! Interfaces to the command execution and host targeting services
//!
//! The catalog never talks to the network itself: it resolves a host through a
//! [`RemoteCommandTargeter`] and hands a command document to a
//! [`RemoteCommandRunner`].

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bson::Document;
use tracing::debug;

use distlock_common::{CatalogError, Result};

/// Network address of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for HostAndPort {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid host '{}', expected 'host:port'", s))?;
        let port = port
            .parse()
            .map_err(|_| format!("invalid port in host '{}'", s))?;
        if host.is_empty() {
            return Err(format!("invalid host '{}', empty host name", s));
        }
        Ok(Self::new(host, port))
    }
}

/// Which member of the replica set may serve a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPreference {
    #[default]
    PrimaryOnly,
    PrimaryPreferred,
    SecondaryOnly,
    SecondaryPreferred,
    Nearest,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadPreferenceSetting {
    pub pref: ReadPreference,
}

impl ReadPreferenceSetting {
    pub fn primary_only() -> Self {
        Self::default()
    }
}

/// A command addressed to one node.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCommandRequest {
    pub target: HostAndPort,
    pub db_name: String,
    pub cmd: Document,
}

impl RemoteCommandRequest {
    pub fn new(target: HostAndPort, db_name: impl Into<String>, cmd: Document) -> Self {
        Self {
            target,
            db_name: db_name.into(),
            cmd,
        }
    }
}

/// Raw reply of a command that completed its round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCommandResponse {
    pub data: Document,
}

impl RemoteCommandResponse {
    pub fn new(data: Document) -> Self {
        Self { data }
    }
}

/// Resolves a read preference to a concrete host.
#[async_trait]
pub trait RemoteCommandTargeter: Send + Sync {
    async fn find_host(&self, read_pref: &ReadPreferenceSetting) -> Result<HostAndPort>;
}

/// Executes one command round trip.
///
/// Only transport-level failures are errors here; a reply carrying `ok: 0`
/// is still a successful round trip and is classified by the caller.
#[async_trait]
pub trait RemoteCommandRunner: Send + Sync {
    async fn run_command(&self, request: RemoteCommandRequest) -> Result<RemoteCommandResponse>;
}

/// Targeter over a fixed member list with a known primary.
///
/// Primary-only requests go to the current primary; other preferences rotate
/// over all members. The primary is moved with [`StaticHostTargeter::set_primary`]
/// when the caller learns of an election.
pub struct StaticHostTargeter {
    hosts: Vec<HostAndPort>,
    primary_index: AtomicUsize,
    next_index: AtomicUsize,
}

impl StaticHostTargeter {
    pub fn new(hosts: Vec<HostAndPort>) -> Self {
        Self {
            hosts,
            primary_index: AtomicUsize::new(0),
            next_index: AtomicUsize::new(0),
        }
    }

    /// Mark `host` as primary. Returns false if it is not a known member.
    pub fn set_primary(&self, host: &HostAndPort) -> bool {
        match self.hosts.iter().position(|h| h == host) {
            Some(index) => {
                self.primary_index.store(index, Ordering::SeqCst);
                debug!(primary = %host, "switched primary");
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl RemoteCommandTargeter for StaticHostTargeter {
    async fn find_host(&self, read_pref: &ReadPreferenceSetting) -> Result<HostAndPort> {
        if self.hosts.is_empty() {
            return Err(CatalogError::HostUnreachable(
                "no hosts configured".to_string(),
            ));
        }

        let index = match read_pref.pref {
            ReadPreference::PrimaryOnly | ReadPreference::PrimaryPreferred => {
                self.primary_index.load(Ordering::SeqCst)
            }
            _ => self.next_index.fetch_add(1, Ordering::Relaxed) % self.hosts.len(),
        };

        Ok(self.hosts[index].clone())
    }
}
