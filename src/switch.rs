//! Switch forwarding engine: a learning bridge over framed transports.
//!
//! Every accepted connection runs [`Switch::run_connection`]:
//!
//! ```text
//!   accept ─▶ pending ──login_req ok──▶ active ──EOF / error / left_req──▶ closed
//!                │                        │
//!                └─ bad login / timeout ──┴──────────▶ remove_session
//! ```
//!
//! While active, each frame goes through [`Switch::handle_frame`]: control
//! frames are answered in place, data frames teach the MAC table their
//! source and are then unicast to the learned session or flooded to the rest
//! of the sender's network.
//!
//! All shared state (sessions, MAC table, address pool) sits behind one
//! `std::sync::Mutex` that is never held across an `.await`.  Sends go
//! through each session's own send lock, bounded by `send_timeout`, so a slow
//! or dead recipient costs the sender at most that long and never fails the
//! fan-out.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, MissedTickBehavior};

use crate::config::SwitchConfig;
use crate::control::{self, ControlCommand, Credentials, Lease, LoginReply, Neighbor};
use crate::error::{AuthError, Error, NetworkError, ProtocolError};
use crate::ethernet::EtherHeader;
use crate::frame;
use crate::logging::Logger;
use crate::mac_table::MacTable;
use crate::pool::AddressPool;
use crate::registry::{ClientSession, SessionId, SessionRegistry};
use crate::shutdown::ShutdownListener;
use crate::transport::{BoxedWriter, FrameReader, Listener};

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Point-in-time copy of the switch counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SwitchMetrics {
    pub frames_received: u64, // every frame handed to handle_frame
    pub frames_unicast: u64,  // data frames sent to one learned session
    pub frames_flooded: u64,  // broadcast or unknown-unicast data frames
    pub frames_dropped: u64,  // undecodable, unauthorised or hairpin frames
    pub send_failures: u64,   // per-recipient send errors and timeouts
    pub sessions_opened: u64,
    pub sessions_closed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_received: AtomicU64,
    frames_unicast: AtomicU64,
    frames_flooded: AtomicU64,
    frames_dropped: AtomicU64,
    send_failures: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SwitchMetrics {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SwitchMetrics {
            frames_received: get(&self.frames_received),
            frames_unicast: get(&self.frames_unicast),
            frames_flooded: get(&self.frames_flooded),
            frames_dropped: get(&self.frames_dropped),
            send_failures: get(&self.send_failures),
            sessions_opened: get(&self.sessions_opened),
            sessions_closed: get(&self.sessions_closed),
        }
    }
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// An accepted connection that has not logged in yet.  It owns the write
/// half but is invisible to forwarding.
pub struct PendingConnection {
    peer: String,
    writer: BoxedWriter,
}

impl PendingConnection {
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

/// Read-only view of one live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub username: String,
    pub network: String,
    pub peer: String,
    pub address: Option<Ipv4Addr>,
    pub connected_at: SystemTime,
}

/// Where a data frame goes after the MAC lookup.
enum Route {
    Unicast(Arc<ClientSession>),
    Flood(Vec<Arc<ClientSession>>),
    Drop,
}

struct SwitchTables {
    sessions: SessionRegistry,
    macs: MacTable,
    pool: AddressPool,
}

struct Inner {
    config: SwitchConfig,
    log: Logger,
    tables: Mutex<SwitchTables>,
    next_id: AtomicU64,
    counters: Counters,
}

/// Cheap to clone; clones share one switch.
#[derive(Clone)]
pub struct Switch {
    inner: Arc<Inner>,
}

impl Switch {
    pub fn new(config: SwitchConfig, log: Logger) -> Self {
        let tables = SwitchTables {
            sessions: SessionRegistry::new(),
            macs: MacTable::new(config.mac_max_age),
            pool: AddressPool::new(config.subnet),
        };
        Self {
            inner: Arc::new(Inner {
                config,
                log,
                tables: Mutex::new(tables),
                next_id: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &SwitchConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> SwitchMetrics {
        self.inner.counters.snapshot()
    }

    /// Live sessions ordered by id.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let tables = self.tables();
        let mut out: Vec<SessionInfo> = tables
            .sessions
            .iter()
            .map(|s| SessionInfo {
                id: s.id,
                username: s.username.clone(),
                network: s.network.clone(),
                peer: s.peer.clone(),
                address: tables.pool.lookup(&s.network, s.id),
                connected_at: s.connected_at,
            })
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    fn tables(&self) -> MutexGuard<'_, SwitchTables> {
        self.inner
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn log(&self) -> &str {
        self.inner.log.target()
    }

    // -----------------------------------------------------------------------
    // Login
    // -----------------------------------------------------------------------

    pub fn accept_connection(&self, writer: BoxedWriter, peer: impl Into<String>) -> PendingConnection {
        let peer = peer.into();
        log::debug!(target: self.log(), "[switch] accepted {peer}");
        PendingConnection { peer, writer }
    }

    /// Authenticate a pending connection with the body of its `login_req`.
    ///
    /// On success the session receives `login_resp ok` and only then becomes
    /// visible to forwarding.  On failure the connection receives
    /// `login_resp err`, its writer is shut down and the error is returned.
    pub async fn handle_login(
        &self,
        pending: PendingConnection,
        body: &[u8],
    ) -> Result<Arc<ClientSession>, Error> {
        let credentials = match self.validate(body) {
            Ok(c) => c,
            Err(e) => {
                log::warn!(target: self.log(), "[switch] login from {} rejected: {e}", pending.peer);
                self.reject(pending, &e.to_string()).await;
                return Err(e.into());
            }
        };

        let id = SessionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(ClientSession::new(
            id,
            credentials.username,
            credentials.network,
            pending.peer,
            pending.writer,
        ));

        let reply = LoginReply::Accepted {
            session: id.0,
            network: session.network.clone(),
        };
        if let Err(e) = self.send_control(&session, ControlCommand::LoginResp, &reply.encode()).await {
            session.close().await;
            return Err(e);
        }

        self.tables().sessions.insert(session.clone());
        Counters::bump(&self.inner.counters.sessions_opened);
        log::info!(
            target: self.log(),
            "[switch] ← LOGIN {} as {id} user={} network={}",
            session.peer,
            session.username,
            session.network
        );
        Ok(session)
    }

    fn validate(&self, body: &[u8]) -> Result<Credentials, AuthError> {
        let credentials =
            Credentials::parse(body).map_err(|e| AuthError::InvalidCredentials(e.to_string()))?;
        let printable = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_graphic());
        if !printable(&credentials.username) || !printable(&credentials.network) {
            return Err(AuthError::InvalidCredentials("non-printable name".into()));
        }
        if let Some(expected) = &self.inner.config.secret {
            if credentials.secret.as_deref() != Some(expected.as_str()) {
                return Err(AuthError::AuthenticationFailed("bad secret".into()));
            }
        }
        Ok(credentials)
    }

    async fn reject(&self, pending: PendingConnection, reason: &str) {
        let PendingConnection { peer, mut writer } = pending;
        let payload = control::encode(ControlCommand::LoginResp, &LoginReply::Rejected(reason.into()).encode());
        let write = async {
            let raw = frame::encode(&payload).map_err(std::io::Error::other)?;
            writer.write_all(&raw).await?;
            writer.flush().await?;
            writer.shutdown().await
        };
        match timeout(self.inner.config.send_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!(target: self.log(), "[switch] → {peer} login_resp err: {e}"),
            Err(_) => log::debug!(target: self.log(), "[switch] → {peer} login_resp err timed out"),
        }
    }

    // -----------------------------------------------------------------------
    // Forwarding
    // -----------------------------------------------------------------------

    /// Process one raw frame received from session `id`.
    ///
    /// Decode failures are returned; the caller logs them and carries on.
    /// Failures to deliver to other sessions are never returned.
    pub async fn handle_frame(&self, id: SessionId, raw: &[u8]) -> Result<(), Error> {
        Counters::bump(&self.inner.counters.frames_received);
        let result = self.route_frame(id, raw).await;
        if result.is_err() {
            Counters::bump(&self.inner.counters.frames_dropped);
        }
        result
    }

    async fn route_frame(&self, id: SessionId, raw: &[u8]) -> Result<(), Error> {
        let frame = frame::decode(raw)?;
        let session = self
            .tables()
            .sessions
            .get(id)
            .cloned()
            .ok_or(AuthError::Unauthorized)?;

        if frame.is_control() {
            return self.handle_control(&session, &frame.payload).await;
        }

        let header = EtherHeader::parse(&frame.payload).ok_or(ProtocolError::InvalidFrame {
            len: frame.payload.len(),
        })?;

        let route = {
            let mut tables = self.tables();
            let SwitchTables { sessions, macs, .. } = &mut *tables;
            if let Some(previous) = macs.learn(&session.network, header.src, id) {
                log::debug!(
                    target: self.log(),
                    "[switch] {} moved {previous} → {id} on {}",
                    header.src,
                    session.network
                );
            }
            if header.dst.is_broadcast() {
                Route::Flood(sessions.peers(&session.network, id))
            } else {
                match macs
                    .lookup(&session.network, &header.dst)
                    .and_then(|owner| sessions.get(owner))
                    .filter(|owner| owner.network == session.network)
                {
                    Some(owner) if owner.id == id => Route::Drop,
                    Some(owner) => Route::Unicast(owner.clone()),
                    None => Route::Flood(sessions.peers(&session.network, id)),
                }
            }
        };

        let raw = &raw[..frame.wire_len()];
        match route {
            Route::Unicast(target) => {
                Counters::bump(&self.inner.counters.frames_unicast);
                log::trace!(target: self.log(), "[switch] {id} → {} {}", target.id, header.dst);
                self.deliver(&target, raw).await;
            }
            Route::Flood(targets) => {
                Counters::bump(&self.inner.counters.frames_flooded);
                log::trace!(
                    target: self.log(),
                    "[switch] {id} → flood {} ({} peers)",
                    header.dst,
                    targets.len()
                );
                for target in &targets {
                    self.deliver(target, raw).await;
                }
            }
            Route::Drop => {
                Counters::bump(&self.inner.counters.frames_dropped);
                log::trace!(target: self.log(), "[switch] {id} hairpin to {} dropped", header.dst);
            }
        }
        Ok(())
    }

    /// Send to one fan-out recipient.  A failure is logged and counted, and
    /// the recipient is dropped since its stream may hold a partial frame.
    async fn deliver(&self, target: &ClientSession, raw: &[u8]) {
        let failure = match timeout(self.inner.config.send_timeout, target.send(raw)).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(_) => NetworkError::ConnectionTimeout,
        };
        Counters::bump(&self.inner.counters.send_failures);
        log::warn!(target: self.log(), "[switch] → {} failed: {failure}", target.id);
        self.remove_session(target.id).await;
    }

    async fn send_control(
        &self,
        session: &ClientSession,
        command: ControlCommand,
        data: &[u8],
    ) -> Result<(), Error> {
        let result =
            match timeout(self.inner.config.send_timeout, session.send_control(command, data)).await {
                Ok(result) => result,
                Err(_) => Err(NetworkError::ConnectionTimeout.into()),
            };
        if result.is_err() {
            self.remove_session(session.id).await;
        }
        result
    }

    async fn handle_control(&self, session: &Arc<ClientSession>, payload: &[u8]) -> Result<(), Error> {
        let msg = control::decode(payload)?;
        if !msg.command.is_request() {
            log::trace!(target: self.log(), "[switch] {} from {} ignored", msg.command, session.id);
            return Ok(());
        }
        log::debug!(target: self.log(), "[switch] ← {} from {}", msg.command, session.id);
        match msg.command {
            ControlCommand::LoginReq => {
                let reply = LoginReply::Accepted {
                    session: session.id.0,
                    network: session.network.clone(),
                };
                self.send_control(session, ControlCommand::LoginResp, &reply.encode()).await
            }
            ControlCommand::PingReq => {
                self.send_control(session, ControlCommand::PongResp, &msg.data).await
            }
            ControlCommand::NeighborReq => {
                let neighbors: Vec<Neighbor> = {
                    let tables = self.tables();
                    let mut peers = tables.sessions.peers(&session.network, session.id);
                    peers.sort_by_key(|p| p.id);
                    peers
                        .iter()
                        .map(|p| Neighbor {
                            session: p.id.0,
                            username: p.username.clone(),
                            address: tables.pool.lookup(&p.network, p.id),
                        })
                        .collect()
                };
                self.send_control(session, ControlCommand::NeighborResp, &Neighbor::encode_list(&neighbors))
                    .await
            }
            ControlCommand::IpaddrReq => {
                let lease = self.tables().pool.allocate(&session.network, session.id);
                match lease {
                    Some(l) => log::info!(target: self.log(), "[switch] {} leased {l}", session.id),
                    None => log::warn!(
                        target: self.log(),
                        "[switch] pool exhausted on {} for {}",
                        session.network,
                        session.id
                    ),
                }
                self.send_control(session, ControlCommand::IpaddrResp, &Lease::encode(lease))
                    .await
            }
            ControlCommand::LeftReq => {
                self.remove_session(session.id).await;
                Ok(())
            }
            ControlCommand::LoginResp
            | ControlCommand::NeighborResp
            | ControlCommand::IpaddrResp
            | ControlCommand::PongResp => Ok(()),
        }
    }

    /// Unregister a session, release its lease and close its transport.
    /// Returns `false` when it was already gone.
    pub async fn remove_session(&self, id: SessionId) -> bool {
        let removed = {
            let mut tables = self.tables();
            let removed = tables.sessions.remove(id);
            if let Some(s) = &removed {
                tables.pool.release(&s.network, id);
            }
            removed
        };
        let Some(session) = removed else {
            return false;
        };
        session.close().await;
        Counters::bump(&self.inner.counters.sessions_closed);
        log::info!(target: self.log(), "[switch] {id} ({}) left {}", session.username, session.network);
        true
    }

    /// Reclaim expired MAC bindings and bindings to closed sessions.
    pub fn sweep(&self) -> usize {
        let mut tables = self.tables();
        let SwitchTables { sessions, macs, .. } = &mut *tables;
        let removed = macs.sweep(Instant::now(), |id| sessions.contains(id));
        if removed > 0 {
            log::debug!(target: self.log(), "[switch] swept {removed} MAC entries");
        }
        removed
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Drive one transport connection from accept to teardown.
    ///
    /// Returns `Ok(())` when the peer disconnects or leaves, and the error
    /// that ended the connection otherwise.  The session is always removed.
    pub async fn run_connection<S>(&self, stream: S, peer: impl Into<String>) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (rd, wr) = tokio::io::split(stream);
        let mut reader = FrameReader::new(rd);
        let pending = self.accept_connection(Box::new(wr), peer);
        let peer = pending.peer.clone();

        let session = match timeout(self.inner.config.login_timeout, self.await_login(&mut reader, pending)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                log::debug!(target: self.log(), "[switch] {peer} dropped before login: {e}");
                return Err(e);
            }
            Err(_) => {
                log::warn!(target: self.log(), "[switch] {peer} did not log in in time");
                return Err(NetworkError::ConnectionTimeout.into());
            }
        };

        let id = session.id;
        let result = loop {
            let next = tokio::select! {
                next = reader.next_frame() => next,
                _ = session.closed() => break Ok(()),
            };
            match next {
                Ok(raw) => {
                    if let Err(e) = self.handle_frame(id, &raw).await {
                        log::debug!(target: self.log(), "[switch] {id} frame dropped: {e}");
                    }
                }
                Err(Error::Network(NetworkError::ConnectionClosed)) => break Ok(()),
                Err(e) => {
                    log::warn!(target: self.log(), "[switch] {id} connection error: {e}");
                    break Err(e);
                }
            }
        };
        self.remove_session(id).await;
        result
    }

    async fn await_login<R>(
        &self,
        reader: &mut FrameReader<R>,
        pending: PendingConnection,
    ) -> Result<Arc<ClientSession>, Error>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let raw = reader.next_frame().await?;
            let msg = frame::decode(&raw)
                .map_err(Error::from)
                .and_then(|f| control::decode(&f.payload).map_err(Error::from));
            match msg {
                Ok(msg) if msg.command == ControlCommand::LoginReq => {
                    return self.handle_login(pending, &msg.data).await;
                }
                Ok(msg) => {
                    Counters::bump(&self.inner.counters.frames_dropped);
                    log::debug!(
                        target: self.log(),
                        "[switch] {} sent {} before login: {}",
                        pending.peer,
                        msg.command,
                        AuthError::Unauthorized
                    );
                }
                Err(_) => {
                    Counters::bump(&self.inner.counters.frames_dropped);
                    log::debug!(
                        target: self.log(),
                        "[switch] {} sent data before login: {}",
                        pending.peer,
                        AuthError::Unauthorized
                    );
                }
            }
        }
    }

    /// Accept connections until `shutdown` fires, then close every session.
    pub async fn serve(&self, listener: Listener, mut shutdown: ShutdownListener) -> Result<(), Error> {
        log::info!(target: self.log(), "[switch] listening on {}", listener.local_addr);
        let mut sweep = tokio::time::interval(self.inner.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let switch = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = switch.run_connection(stream, addr.to_string()).await {
                                log::debug!(target: switch.log(), "[switch] {addr} closed: {e}");
                            }
                        });
                    }
                    Err(e) => log::warn!(target: self.log(), "[switch] {e}"),
                },
                _ = sweep.tick() => {
                    self.sweep();
                }
            }
        }

        self.close_all().await;
        log::info!(target: self.log(), "[switch] stopped");
        Ok(())
    }

    /// Remove and close every live session.
    pub async fn close_all(&self) {
        let ids: Vec<SessionId> = self.tables().sessions.iter().map(|s| s.id).collect();
        for id in ids {
            self.remove_session(id).await;
        }
    }
}

impl std::fmt::Debug for Switch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switch")
            .field("bind", &self.inner.config.bind)
            .field("sessions", &self.tables().sessions.len())
            .finish_non_exhaustive()
    }
}
