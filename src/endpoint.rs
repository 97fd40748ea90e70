//! Endpoint worker: bridges one local virtual device to a remote switch.
//!
//! ```text
//!             ┌──────────── device → transport ─────────────┐
//!  device ───▶│ read frame ─▶ encode ─▶ FrameSender (+ ping) │───▶ switch
//!             └──────────────────────────────────────────────┘
//!             ┌──────────── transport → device ─────────────┐
//!  device ◀───│ write data ◀─ decode ◀─ FrameReader         │◀─── switch
//!             │                 └─ control: pong, lease, …   │
//!             └──────────────────────────────────────────────┘
//! ```
//!
//! [`EndpointWorker::start`] walks the state machine in [`crate::state`] up
//! to `Ready` and spawns the two loops as tokio tasks.  Every blocking await
//! in either loop is raced against one per-start [`Shutdown`] signal; the
//! first loop to finish raises it, so the other follows.  [`EndpointWorker::stop`]
//! raises it too and additionally closes the device and the transport writer.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Interval, MissedTickBehavior};

use crate::config::{EndpointConfig, KeepaliveConfig};
use crate::control::{self, ControlCommand, ControlMessage, Lease, LoginReply, Neighbor};
use crate::device::{DeviceProvider, VirtualDevice};
use crate::error::{AuthError, DeviceError, Error, NetworkError};
use crate::frame::{self, MAX_PAYLOAD};
use crate::logging::Logger;
use crate::shutdown::{Shutdown, ShutdownListener};
use crate::state::EndpointState;
use crate::transport::{Connector, FrameReader, FrameSender};

/// Bound on the best-effort `left_req` sent by [`EndpointWorker::stop`].
const LEAVE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EndpointMetrics {
    pub frames_sent: u64,     // device → switch
    pub frames_received: u64, // switch → device
    pub pings_sent: u64,
    pub pongs_received: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    pings_sent: AtomicU64,
    pongs_received: AtomicU64,
}

/// State shared between the worker handle and its loop tasks.
struct Core {
    log: Logger,
    state: watch::Sender<EndpointState>,
    running: AtomicBool,
    /// Pings sent since the last pong.
    unanswered: AtomicU32,
    neighbors: Mutex<Vec<Neighbor>>,
    lease: Mutex<Option<Lease>>,
    counters: Counters,
}

impl Core {
    fn target(&self) -> &str {
        self.log.target()
    }

    /// Move `from → to`; a no-op when something else moved the state first.
    fn transition(&self, from: EndpointState, to: EndpointState) -> bool {
        let moved = self.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        });
        if moved {
            log::debug!(target: self.target(), "[endpoint] {from} → {to}");
        }
        moved
    }

    fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        let moved = self.state.send_if_modified(|s| {
            if *s != EndpointState::Disconnected {
                *s = EndpointState::Disconnected;
                true
            } else {
                false
            }
        });
        if moved {
            log::info!(target: self.target(), "[endpoint] disconnected");
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resources of one successful start.
struct Link<D, W> {
    device: Arc<D>,
    writer: Arc<FrameSender<W>>,
    tasks: Vec<JoinHandle<Result<(), Error>>>,
}

type Writer<C> = WriteHalf<<C as Connector>::Stream>;
type Reader<C> = FrameReader<ReadHalf<<C as Connector>::Stream>>;

pub struct EndpointWorker<P: DeviceProvider, C: Connector> {
    config: EndpointConfig,
    provider: P,
    connector: C,
    core: Arc<Core>,
    /// Signal of the current (or last) start.
    shutdown: Mutex<Option<Arc<Shutdown>>>,
    link: Mutex<Option<Link<P::Device, Writer<C>>>>,
}

impl<P: DeviceProvider, C: Connector> EndpointWorker<P, C> {
    pub fn new(config: EndpointConfig, provider: P, connector: C, log: Logger) -> Self {
        let (state, _) = watch::channel(EndpointState::Init);
        Self {
            config,
            provider,
            connector,
            core: Arc::new(Core {
                log,
                state,
                running: AtomicBool::new(false),
                unanswered: AtomicU32::new(0),
                neighbors: Mutex::new(Vec::new()),
                lease: Mutex::new(None),
                counters: Counters::default(),
            }),
            shutdown: Mutex::new(None),
            link: Mutex::new(None),
        }
    }

    pub fn state(&self) -> EndpointState {
        *self.core.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<EndpointState> {
        self.core.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    /// Latest `neighbor_resp` received from the switch.
    pub fn neighbors(&self) -> Vec<Neighbor> {
        lock(&self.core.neighbors).clone()
    }

    /// Address most recently leased by the switch and applied to the device.
    pub fn lease(&self) -> Option<Lease> {
        *lock(&self.core.lease)
    }

    pub fn metrics(&self) -> EndpointMetrics {
        let c = &self.core.counters;
        EndpointMetrics {
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            pings_sent: c.pings_sent.load(Ordering::Relaxed),
            pongs_received: c.pongs_received.load(Ordering::Relaxed),
        }
    }

    fn target(&self) -> &str {
        self.core.target()
    }

    // -----------------------------------------------------------------------
    // start
    // -----------------------------------------------------------------------

    /// Open the device, connect, log in and spawn both forwarding loops.
    ///
    /// Fails with [`Error::AlreadyRunning`] unless the worker is in `Init`,
    /// and with [`Error::NotInitialized`] from `Disconnected`.  On any other
    /// failure everything opened so far is closed again and the worker ends
    /// up `Disconnected`.
    pub async fn start(&self) -> Result<(), Error> {
        let mut previous = EndpointState::Init;
        let claimed = self.core.state.send_if_modified(|s| {
            previous = *s;
            if *s == EndpointState::Init {
                *s = EndpointState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(match previous {
                EndpointState::Disconnected => Error::NotInitialized,
                _ => Error::AlreadyRunning,
            });
        }
        log::info!(
            target: self.target(),
            "[endpoint] connecting to {}:{} as {}",
            self.config.host,
            self.config.port,
            self.config.credentials.username
        );

        let shutdown = Arc::new(Shutdown::new());
        *lock(&self.shutdown) = Some(shutdown.clone());
        self.core.unanswered.store(0, Ordering::SeqCst);

        let mut cancelled = shutdown.listener();
        let established = tokio::select! {
            r = self.establish() => r,
            _ = cancelled.wait() => Err(NetworkError::ConnectionClosed.into()),
        };
        let (device, reader, writer) = match established {
            Ok(parts) => parts,
            Err(e) => {
                log::warn!(target: self.target(), "[endpoint] start failed: {e}");
                self.core.disconnect();
                return Err(e);
            }
        };

        // stop() takes the same lock, so it either sees the link or has
        // already raised the signal.
        let admitted = {
            let mut link = lock(&self.link);
            let admitted = !shutdown.is_triggered()
                && self.core.transition(EndpointState::Authenticating, EndpointState::Ready);
            if admitted {
                self.start_loops(&mut link, &shutdown, device.clone(), reader, writer.clone());
            }
            admitted
        };
        if !admitted {
            device.close();
            writer.close().await;
            self.core.disconnect();
            return Err(NetworkError::ConnectionClosed.into());
        }
        log::info!(target: self.target(), "[endpoint] ready");

        // A lost request only costs the lease; a dead transport is reported
        // by the loops.
        if self.config.request_address {
            let req = control::encode(ControlCommand::IpaddrReq, b"");
            if let Err(e) = writer.send_payload(&req).await {
                log::warn!(target: self.target(), "[endpoint] → IPADDR failed: {e}");
            }
        }
        Ok(())
    }

    fn start_loops(
        &self,
        link: &mut Option<Link<P::Device, Writer<C>>>,
        shutdown: &Arc<Shutdown>,
        device: Arc<P::Device>,
        reader: Reader<C>,
        writer: Arc<FrameSender<Writer<C>>>,
    ) {
        self.core.running.store(true, Ordering::SeqCst);

        let outbound = tokio::spawn(supervise(
            "device→transport",
            self.core.clone(),
            shutdown.clone(),
            device.clone(),
            writer.clone(),
            device_to_transport(
                self.core.clone(),
                device.clone(),
                writer.clone(),
                shutdown.listener(),
                self.config.keepalive.clone(),
            ),
        ));
        let inbound = tokio::spawn(supervise(
            "transport→device",
            self.core.clone(),
            shutdown.clone(),
            device.clone(),
            writer.clone(),
            transport_to_device(self.core.clone(), device.clone(), reader, writer.clone(), shutdown.listener()),
        ));
        *link = Some(Link {
            device,
            writer,
            tasks: vec![outbound, inbound],
        });
    }

    async fn establish(&self) -> Result<(Arc<P::Device>, Reader<C>, Arc<FrameSender<Writer<C>>>), Error> {
        let device = Arc::new(self.provider.open(&self.config.device)?);
        match self.bring_up(&device).await {
            Ok((reader, writer)) => Ok((device, reader, writer)),
            Err(e) => {
                device.close();
                Err(e)
            }
        }
    }

    async fn bring_up(&self, device: &P::Device) -> Result<(Reader<C>, Arc<FrameSender<Writer<C>>>), Error> {
        let dc = &self.config.device;
        device.set_mtu(dc.mtu)?;
        device.set_up()?;
        if let Some(lease) = dc.address {
            device.set_addr(lease.address, lease.netmask())?;
            *lock(&self.core.lease) = Some(lease);
        }
        log::debug!(target: self.target(), "[endpoint] device {} up mtu={}", device.name(), dc.mtu);

        let stream = self.connector.connect(&self.config.host, self.config.port).await?;
        self.core.transition(EndpointState::Connecting, EndpointState::Connected);

        let (rd, wr) = tokio::io::split(stream);
        let mut reader = FrameReader::new(rd);
        let writer = Arc::new(FrameSender::new(wr));
        match self.login(&mut reader, &writer).await {
            Ok(()) => Ok((reader, writer)),
            Err(e) => {
                writer.close().await;
                Err(e)
            }
        }
    }

    async fn login(&self, reader: &mut Reader<C>, writer: &FrameSender<Writer<C>>) -> Result<(), Error> {
        self.core.transition(EndpointState::Connected, EndpointState::Authenticating);
        writer
            .send_payload(&control::encode(ControlCommand::LoginReq, &self.config.credentials.encode()))
            .await?;
        log::debug!(target: self.target(), "[endpoint] → LOGIN {}", self.config.credentials.username);

        let reply = match timeout(self.config.login_timeout, await_login_reply(reader)).await {
            Ok(reply) => reply?,
            Err(_) => return Err(NetworkError::ConnectionTimeout.into()),
        };
        match reply {
            LoginReply::Accepted { session, network } => {
                log::info!(target: self.target(), "[endpoint] ← LOGIN ok session=#{session} network={network}");
                Ok(())
            }
            LoginReply::Rejected(reason) => Err(AuthError::AuthenticationFailed(reason).into()),
        }
    }

    // -----------------------------------------------------------------------
    // stop / join / deinit
    // -----------------------------------------------------------------------

    /// Stop forwarding.  Idempotent.
    ///
    /// Sends a best-effort `left_req` when the session was running, then
    /// raises the shutdown signal and closes the device and the transport so
    /// that no loop stays blocked.  The worker always ends up
    /// `Disconnected`, even if it never started; [`Self::deinit`] brings it
    /// back to `Init`.
    pub async fn stop(&self) {
        let was_running = self.core.running.swap(false, Ordering::SeqCst);
        let parts = lock(&self.link)
            .as_ref()
            .map(|l| (l.device.clone(), l.writer.clone()));

        if was_running {
            if let Some((_, writer)) = &parts {
                let left = control::encode(ControlCommand::LeftReq, b"");
                if let Ok(Err(e)) = timeout(LEAVE_TIMEOUT, writer.send_payload(&left)).await {
                    log::debug!(target: self.target(), "[endpoint] → LEFT failed: {e}");
                }
            }
        }

        self.core.disconnect();
        if let Some(shutdown) = lock(&self.shutdown).as_ref() {
            shutdown.trigger();
        }
        if let Some((device, writer)) = parts {
            device.close();
            writer.close().await;
        }
    }

    /// Wait for both loops to finish.  Returns the first error either loop
    /// ended with.
    pub async fn join(&self) -> Result<(), Error> {
        let tasks = match lock(&self.link).as_mut() {
            Some(link) => std::mem::take(&mut link.tasks),
            None => Vec::new(),
        };
        let mut first = Ok(());
        for task in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_cancelled) => Ok(()),
            };
            if first.is_ok() {
                first = result;
            }
        }
        first
    }

    /// Stop, wait for the loops, drop every resource and return to `Init` so
    /// the worker can be started again.
    pub async fn deinit(&self) -> Result<(), Error> {
        self.stop().await;
        let result = self.join().await;
        *lock(&self.link) = None;
        *lock(&self.shutdown) = None;
        lock(&self.core.neighbors).clear();
        *lock(&self.core.lease) = None;
        self.core.state.send_replace(EndpointState::Init);
        log::debug!(target: self.target(), "[endpoint] reinitialised");
        result
    }

    /// Ask the switch for the other sessions of this network.  The answer
    /// shows up in [`Self::neighbors`].
    pub async fn request_neighbors(&self) -> Result<(), Error> {
        let writer = lock(&self.link)
            .as_ref()
            .filter(|_| self.is_running())
            .map(|l| l.writer.clone())
            .ok_or(NetworkError::ConnectionClosed)?;
        writer
            .send_payload(&control::encode(ControlCommand::NeighborReq, b""))
            .await
    }
}

impl<P: DeviceProvider, C: Connector> Drop for EndpointWorker<P, C> {
    fn drop(&mut self) {
        if let Some(shutdown) = lock(&self.shutdown).as_ref() {
            shutdown.trigger();
        }
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

async fn await_login_reply<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Result<LoginReply, Error> {
    loop {
        let raw = reader.next_frame().await?;
        let frame = frame::decode(&raw)?;
        if !frame.is_control() {
            continue;
        }
        let msg = control::decode(&frame.payload)?;
        if msg.command == ControlCommand::LoginResp {
            return Ok(LoginReply::parse(&msg.data)?);
        }
    }
}

/// Run one loop; whichever loop ends first takes the whole session down.
async fn supervise<D, W>(
    name: &'static str,
    core: Arc<Core>,
    shutdown: Arc<Shutdown>,
    device: Arc<D>,
    writer: Arc<FrameSender<W>>,
    body: impl std::future::Future<Output = Result<(), Error>>,
) -> Result<(), Error>
where
    D: VirtualDevice,
    W: AsyncWrite + Send + Unpin,
{
    let result = body.await;
    match &result {
        Ok(()) => log::debug!(target: core.target(), "[endpoint] {name} loop ended"),
        Err(e) => log::warn!(target: core.target(), "[endpoint] {name} loop failed: {e}"),
    }
    core.disconnect();
    shutdown.trigger();
    device.close();
    writer.close().await;
    result
}

/// A failure after stop() began is the expected unblock, not an error.
fn stopping(core: &Core, shutdown: &ShutdownListener) -> bool {
    shutdown.is_triggered() || !core.running.load(Ordering::SeqCst)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn device_to_transport<D, W>(
    core: Arc<Core>,
    device: Arc<D>,
    writer: Arc<FrameSender<W>>,
    mut shutdown: ShutdownListener,
    keepalive: KeepaliveConfig,
) -> Result<(), Error>
where
    D: VirtualDevice,
    W: AsyncWrite + Send + Unpin,
{
    let mut keepalive_timer = (!keepalive.interval.is_zero()).then(|| {
        let start = tokio::time::Instant::now() + keepalive.interval;
        let mut i = tokio::time::interval_at(start, keepalive.interval);
        i.set_missed_tick_behavior(MissedTickBehavior::Delay);
        i
    });
    let mut buf = vec![0u8; MAX_PAYLOAD];

    loop {
        let payload: Vec<u8> = tokio::select! {
            _ = shutdown.wait() => return Ok(()),
            _ = tick(&mut keepalive_timer) => {
                let missed = core.unanswered.fetch_add(1, Ordering::SeqCst);
                if missed > keepalive.max_missed {
                    log::warn!(target: core.target(), "[endpoint] {missed} pings unanswered");
                    return Err(NetworkError::ConnectionTimeout.into());
                }
                let nonce: [u8; 8] = rand::rng().random();
                core.counters.pings_sent.fetch_add(1, Ordering::Relaxed);
                log::trace!(target: core.target(), "[endpoint] → PING missed={missed}");
                control::encode(ControlCommand::PingReq, &nonce)
            }
            read = device.read(&mut buf) => match read {
                Ok(0) => continue,
                Ok(n) => {
                    core.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                    buf[..n].to_vec()
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => continue,
                Err(_) if stopping(&core, &shutdown) => return Ok(()),
                Err(e) => return Err(DeviceError::ReadFailed(e.to_string()).into()),
            },
        };

        tokio::select! {
            _ = shutdown.wait() => return Ok(()),
            sent = writer.send_payload(&payload) => match sent {
                Ok(()) => {}
                Err(_) if stopping(&core, &shutdown) => return Ok(()),
                Err(e) => return Err(e),
            },
        }
    }
}

/// What the inbound loop does after a control message.
enum Flow {
    Continue,
    Leave,
}

async fn transport_to_device<D, R, W>(
    core: Arc<Core>,
    device: Arc<D>,
    mut reader: FrameReader<R>,
    writer: Arc<FrameSender<W>>,
    mut shutdown: ShutdownListener,
) -> Result<(), Error>
where
    D: VirtualDevice,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let raw = tokio::select! {
            _ = shutdown.wait() => return Ok(()),
            next = reader.next_frame() => match next {
                Ok(raw) => raw,
                Err(_) if stopping(&core, &shutdown) => return Ok(()),
                Err(e) => return Err(e),
            },
        };
        let frame = match frame::decode(&raw) {
            Ok(f) => f,
            Err(e) => {
                log::debug!(target: core.target(), "[endpoint] ← bad frame: {e}");
                continue;
            }
        };

        if frame.is_control() {
            let msg = match control::decode(&frame.payload) {
                Ok(m) => m,
                Err(e) => {
                    log::debug!(target: core.target(), "[endpoint] ← bad control frame: {e}");
                    continue;
                }
            };
            match handle_control(&core, device.as_ref(), &writer, msg).await? {
                Flow::Continue => continue,
                Flow::Leave => return Ok(()),
            }
        }

        tokio::select! {
            _ = shutdown.wait() => return Ok(()),
            written = device.write(&frame.payload) => match written {
                Ok(_) => {
                    core.counters.frames_received.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) if stopping(&core, &shutdown) => return Ok(()),
                Err(e) => return Err(DeviceError::WriteFailed(e.to_string()).into()),
            },
        }
    }
}

async fn handle_control<D, W>(
    core: &Core,
    device: &D,
    writer: &FrameSender<W>,
    msg: ControlMessage,
) -> Result<Flow, Error>
where
    D: VirtualDevice,
    W: AsyncWrite + Send + Unpin,
{
    log::trace!(target: core.target(), "[endpoint] ← {}", msg.command);
    match msg.command {
        ControlCommand::PingReq => {
            writer
                .send_payload(&control::encode(ControlCommand::PongResp, &msg.data))
                .await?;
        }
        ControlCommand::PongResp => {
            core.unanswered.store(0, Ordering::SeqCst);
            core.counters.pongs_received.fetch_add(1, Ordering::Relaxed);
        }
        ControlCommand::LoginResp => match LoginReply::parse(&msg.data)? {
            LoginReply::Accepted { session, .. } => {
                log::debug!(target: core.target(), "[endpoint] login confirmed as #{session}");
            }
            LoginReply::Rejected(reason) => {
                return Err(AuthError::AuthenticationFailed(reason).into());
            }
        },
        ControlCommand::IpaddrResp => match Lease::parse(&msg.data) {
            Ok(Some(lease)) => match device.set_addr(lease.address, lease.netmask()) {
                Ok(()) => {
                    log::info!(target: core.target(), "[endpoint] {} address {lease}", device.name());
                    *lock(&core.lease) = Some(lease);
                }
                Err(e) => log::warn!(target: core.target(), "[endpoint] cannot apply {lease}: {e}"),
            },
            Ok(None) => log::warn!(target: core.target(), "[endpoint] switch has no address to lease"),
            Err(e) => log::debug!(target: core.target(), "[endpoint] bad lease: {e}"),
        },
        ControlCommand::NeighborResp => match Neighbor::parse_list(&msg.data) {
            Ok(list) => *lock(&core.neighbors) = list,
            Err(e) => log::debug!(target: core.target(), "[endpoint] bad neighbor list: {e}"),
        },
        ControlCommand::LeftReq => {
            log::info!(target: core.target(), "[endpoint] switch ended the session");
            return Ok(Flow::Leave);
        }
        ControlCommand::LoginReq | ControlCommand::NeighborReq | ControlCommand::IpaddrReq => {}
    }
    Ok(Flow::Continue)
}
