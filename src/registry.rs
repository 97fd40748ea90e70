//! Live switch sessions.
//!
//! A [`ClientSession`] exists only for an authenticated connection and owns
//! that connection's write half behind its own send lock.  The
//! [`SessionRegistry`] is a plain map; the switch keeps it under its coarse
//! table lock together with the MAC table, and clones `Arc<ClientSession>`
//! handles out of it so no lock is held while sending.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use crate::control::{self, ControlCommand};
use crate::error::{Error, NetworkError};
use crate::shutdown::Shutdown;
use crate::transport::{BoxedWriter, FrameSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct ClientSession {
    pub id: SessionId,
    pub username: String,
    /// Broadcast domain this session belongs to.
    pub network: String,
    /// Remote transport address, for logs.
    pub peer: String,
    pub connected_at: SystemTime,
    sender: FrameSender<BoxedWriter>,
    closed: Shutdown,
}

impl ClientSession {
    pub fn new(
        id: SessionId,
        username: impl Into<String>,
        network: impl Into<String>,
        peer: impl Into<String>,
        writer: BoxedWriter,
    ) -> Self {
        Self {
            id,
            username: username.into(),
            network: network.into(),
            peer: peer.into(),
            connected_at: SystemTime::now(),
            sender: FrameSender::new(writer),
            closed: Shutdown::new(),
        }
    }

    /// Send one encoded frame.  Serialised against every other sender.
    pub async fn send(&self, raw: &[u8]) -> Result<(), NetworkError> {
        self.sender.send(raw).await
    }

    pub async fn send_control(&self, command: ControlCommand, data: &[u8]) -> Result<(), Error> {
        self.sender.send_payload(&control::encode(command, data)).await
    }

    /// Close the transport and wake anyone waiting in [`Self::closed`].
    pub async fn close(&self) {
        self.closed.trigger();
        self.sender.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_triggered()
    }

    /// Resolves once [`Self::close`] has been called.
    pub async fn closed(&self) {
        self.closed.listener().wait().await;
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("network", &self.network)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Arc<ClientSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: Arc<ClientSession>) -> Option<Arc<ClientSession>> {
        self.sessions.insert(session.id, session)
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Arc<ClientSession>> {
        self.sessions.remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Arc<ClientSession>> {
        self.sessions.get(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Every session of `network` except `exclude`.
    pub fn peers(&self, network: &str, exclude: SessionId) -> Vec<Arc<ClientSession>> {
        self.sessions
            .values()
            .filter(|s| s.id != exclude && s.network == network)
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ClientSession>> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
