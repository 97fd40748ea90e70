//! Integration tests for the endpoint worker.
//!
//! Endpoints run against a real in-process `Switch`: the test connector
//! hands the switch one end of a duplex pipe per connection.  Devices are
//! `MemoryDevice`s, so the tests play the host network stack through their
//! handles.

use std::time::Duration;

use tokio::io::{AsyncWriteExt, DuplexStream};

use ethertunnel::config::{EndpointConfig, KeepaliveConfig, SwitchConfig};
use ethertunnel::control::{self, ControlCommand, Credentials, Lease, LoginReply};
use ethertunnel::device::{MemoryDevice, MemoryDeviceHandle, MemoryDeviceProvider};
use ethertunnel::endpoint::EndpointWorker;
use ethertunnel::error::{AuthError, DeviceError, Error, NetworkError};
use ethertunnel::ethernet::{ether_type, EtherHeader, MacAddr};
use ethertunnel::frame;
use ethertunnel::logging::Logger;
use ethertunnel::state::EndpointState;
use ethertunnel::switch::Switch;
use ethertunnel::transport::{Connector, FrameReader};

const MAC_A: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0a]);
const MAC_B: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0b]);

// ---------------------------------------------------------------------------
// Connectors
// ---------------------------------------------------------------------------

/// Connects to an in-process switch over a duplex pipe.
struct DuplexConnector {
    switch: Switch,
}

impl Connector for DuplexConnector {
    type Stream = DuplexStream;

    async fn connect(&self, _host: &str, _port: u16) -> Result<DuplexStream, NetworkError> {
        let (server, client) = tokio::io::duplex(64 * 1024);
        let switch = self.switch.clone();
        tokio::spawn(async move {
            let _ = switch.run_connection(server, "endpoint").await;
        });
        Ok(client)
    }
}

/// A fake switch that answers `login_req` with a fixed reply (or never) and
/// ignores everything else, pings included.
struct ScriptedConnector {
    reply: Option<LoginReply>,
    /// Drop the connection right after the login reply.
    hang_up: bool,
}

impl Connector for ScriptedConnector {
    type Stream = DuplexStream;

    async fn connect(&self, _host: &str, _port: u16) -> Result<DuplexStream, NetworkError> {
        let (server, client) = tokio::io::duplex(4096);
        let reply = self.reply.clone();
        let hang_up = self.hang_up;
        tokio::spawn(async move {
            let (rd, mut wr) = tokio::io::split(server);
            let mut reader = FrameReader::new(rd);
            while let Ok(raw) = reader.next_frame().await {
                let Ok(f) = frame::decode(&raw) else { continue };
                let Ok(msg) = control::decode(&f.payload) else { continue };
                if let (ControlCommand::LoginReq, Some(reply)) = (msg.command, &reply) {
                    let resp = control::encode(ControlCommand::LoginResp, &reply.encode());
                    let _ = wr.write_all(&frame::encode(&resp).unwrap()).await;
                    if hang_up {
                        break;
                    }
                }
            }
        });
        Ok(client)
    }
}

struct RefusingConnector;

impl Connector for RefusingConnector {
    type Stream = DuplexStream;

    async fn connect(&self, host: &str, port: u16) -> Result<DuplexStream, NetworkError> {
        Err(NetworkError::ConnectionFailed(format!("{host}:{port}: refused")))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(user: &str) -> EndpointConfig {
    EndpointConfig {
        credentials: Credentials::new(user, "default"),
        login_timeout: Duration::from_secs(2),
        keepalive: KeepaliveConfig {
            interval: Duration::ZERO,
            max_missed: 3,
        },
        ..EndpointConfig::default()
    }
}

fn switch() -> Switch {
    Switch::new(SwitchConfig::default(), Logger::new("test::switch"))
}

fn endpoint<C: Connector>(
    config: EndpointConfig,
    connector: C,
) -> (EndpointWorker<MemoryDeviceProvider, C>, MemoryDeviceHandle) {
    let (device, host) = MemoryDevice::pair("mem0");
    let log = Logger::new(format!("test::{}", config.credentials.username));
    let worker = EndpointWorker::new(config, MemoryDeviceProvider::new(device), connector, log);
    (worker, host)
}

fn ether(dst: MacAddr, src: MacAddr, tag: u8) -> Vec<u8> {
    let mut payload = vec![tag; 60];
    EtherHeader {
        dst,
        src,
        ether_type: ether_type::ARP,
    }
    .write_to(&mut payload)
    .unwrap();
    payload
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

async fn recv(host: &mut MemoryDeviceHandle) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(2), host.recv())
        .await
        .expect("nothing reached the device")
        .expect("device dropped")
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_reaches_ready_and_rejects_a_second_start() {
    let sw = switch();
    let (worker, host) = endpoint(config("alice"), DuplexConnector { switch: sw.clone() });
    let mut states = worker.subscribe();
    assert_eq!(worker.state(), EndpointState::Init);

    worker.start().await.unwrap();
    assert_eq!(worker.state(), EndpointState::Ready);
    assert!(worker.is_running());
    assert!(matches!(worker.start().await, Err(Error::AlreadyRunning)));
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), EndpointState::Ready);

    let status = host.status();
    assert!(status.up);
    assert_eq!(status.mtu, Some(1400));
    wait_for(|| sw.sessions().len() == 1).await;
    worker.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_leaves_the_switch() {
    let sw = switch();
    let (worker, host) = endpoint(config("alice"), DuplexConnector { switch: sw.clone() });
    worker.start().await.unwrap();
    wait_for(|| sw.sessions().len() == 1).await;

    worker.stop().await;
    worker.stop().await;
    assert!(!worker.is_running());
    assert_eq!(worker.state(), EndpointState::Disconnected);
    assert!(host.status().closed);

    tokio::time::timeout(Duration::from_secs(2), worker.join())
        .await
        .expect("loops stayed blocked after stop")
        .unwrap();
    wait_for(|| sw.sessions().is_empty()).await;

    assert!(matches!(worker.start().await, Err(Error::NotInitialized)));
    worker.deinit().await.unwrap();
    assert_eq!(worker.state(), EndpointState::Init);
}

#[tokio::test]
async fn stop_before_start_disconnects() {
    let sw = switch();
    let (worker, _host) = endpoint(config("alice"), DuplexConnector { switch: sw });
    worker.stop().await;
    assert_eq!(worker.state(), EndpointState::Disconnected);
    assert!(!worker.is_running());
    assert!(worker.join().await.is_ok());
    assert!(matches!(worker.start().await, Err(Error::NotInitialized)));

    worker.deinit().await.unwrap();
    assert_eq!(worker.state(), EndpointState::Init);
}

#[tokio::test]
async fn rejected_login_ends_disconnected() {
    let sw = Switch::new(
        SwitchConfig {
            secret: Some("hunter2".into()),
            ..SwitchConfig::default()
        },
        Logger::new("test::switch"),
    );
    let mut cfg = config("mallory");
    cfg.credentials = cfg.credentials.with_secret("guess");
    let (worker, host) = endpoint(cfg, DuplexConnector { switch: sw.clone() });

    let err = worker.start().await.unwrap_err();
    assert!(matches!(err, Error::Auth(AuthError::AuthenticationFailed(_))));
    assert_eq!(worker.state(), EndpointState::Disconnected);
    assert!(!worker.is_running());
    assert!(host.status().closed);
    assert!(sw.sessions().is_empty());
}

#[tokio::test]
async fn device_open_failure_is_reported() {
    let sw = switch();
    let worker = EndpointWorker::new(
        config("alice"),
        MemoryDeviceProvider::unavailable(),
        DuplexConnector { switch: sw.clone() },
        Logger::new("test::alice"),
    );
    let err = worker.start().await.unwrap_err();
    assert!(matches!(err, Error::Device(DeviceError::DeviceOpenFailed(_))));
    assert_eq!(worker.state(), EndpointState::Disconnected);
    assert!(sw.sessions().is_empty());
}

#[tokio::test]
async fn connect_failure_is_reported_and_closes_the_device() {
    let (worker, host) = endpoint(config("alice"), RefusingConnector);
    let err = worker.start().await.unwrap_err();
    assert!(matches!(err, Error::Network(NetworkError::ConnectionFailed(_))));
    assert_eq!(worker.state(), EndpointState::Disconnected);
    assert!(host.status().closed);
}

#[tokio::test]
async fn missing_login_reply_times_out() {
    let mut cfg = config("alice");
    cfg.login_timeout = Duration::from_millis(100);
    let (worker, _host) = endpoint(cfg, ScriptedConnector { reply: None, hang_up: false });
    let err = worker.start().await.unwrap_err();
    assert!(err.is_recoverable());
    assert!(matches!(err, Error::Network(NetworkError::ConnectionTimeout)));
    assert_eq!(worker.state(), EndpointState::Disconnected);
}

// ---------------------------------------------------------------------------
// Forwarding
// ---------------------------------------------------------------------------

#[tokio::test]
async fn frames_travel_between_two_endpoints() {
    let sw = switch();
    let (a, mut host_a) = endpoint(config("alice"), DuplexConnector { switch: sw.clone() });
    let (b, mut host_b) = endpoint(config("bob"), DuplexConnector { switch: sw.clone() });
    a.start().await.unwrap();
    b.start().await.unwrap();
    wait_for(|| sw.sessions().len() == 2).await;

    let who_has = ether(MacAddr::BROADCAST, MAC_A, 1);
    host_a.inject(who_has.clone()).await.unwrap();
    assert_eq!(recv(&mut host_b).await, who_has);

    let reply = ether(MAC_A, MAC_B, 2);
    host_b.inject(reply.clone()).await.unwrap();
    assert_eq!(recv(&mut host_a).await, reply);

    assert_eq!(a.metrics().frames_sent, 1);
    wait_for(|| a.metrics().frames_received == 1).await;
    assert!(host_a.try_recv().is_none());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn switch_teardown_ends_the_loops() {
    let sw = switch();
    let (worker, host) = endpoint(config("alice"), DuplexConnector { switch: sw.clone() });
    worker.start().await.unwrap();
    wait_for(|| sw.sessions().len() == 1).await;

    sw.close_all().await;
    let result = tokio::time::timeout(Duration::from_secs(2), worker.join())
        .await
        .expect("loops did not notice the closed transport");
    assert!(matches!(result, Err(Error::Network(NetworkError::ConnectionClosed))));
    assert_eq!(worker.state(), EndpointState::Disconnected);
    assert!(!worker.is_running());
    assert!(host.status().closed);
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

#[tokio::test]
async fn static_and_leased_addresses_reach_the_device() {
    let sw = switch();

    let mut cfg = config("alice");
    cfg.device.address = Some("10.1.0.5/16".parse().unwrap());
    let (a, host_a) = endpoint(cfg, DuplexConnector { switch: sw.clone() });
    a.start().await.unwrap();
    let (ip, mask) = host_a.status().address.unwrap();
    assert_eq!(ip.to_string(), "10.1.0.5");
    assert_eq!(mask.to_string(), "255.255.0.0");

    let mut cfg = config("bob");
    cfg.request_address = true;
    let (b, host_b) = endpoint(cfg, DuplexConnector { switch: sw.clone() });
    b.start().await.unwrap();
    wait_for(|| b.lease().is_some()).await;
    let lease: Lease = b.lease().unwrap();
    assert_eq!(host_b.status().address, Some((lease.address, lease.netmask())));
    assert!(sw.config().subnet.base.octets()[..3] == lease.address.octets()[..3]);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn lost_address_request_leaves_the_loops_to_report() {
    let mut cfg = config("alice");
    cfg.request_address = true;
    let reply = LoginReply::Accepted {
        session: 1,
        network: "default".into(),
    };
    let (worker, _host) = endpoint(cfg, ScriptedConnector { reply: Some(reply), hang_up: true });
    worker.start().await.expect("start succeeds once the loops run");

    let result = tokio::time::timeout(Duration::from_secs(2), worker.join())
        .await
        .expect("loops never ended");
    assert!(result.is_err());
    assert_eq!(worker.state(), EndpointState::Disconnected);
    assert!(worker.lease().is_none());
}

#[tokio::test]
async fn neighbors_are_requested_on_demand() {
    let sw = switch();
    let (a, _host_a) = endpoint(config("alice"), DuplexConnector { switch: sw.clone() });
    let (b, _host_b) = endpoint(config("bob"), DuplexConnector { switch: sw.clone() });
    assert!(a.request_neighbors().await.is_err());

    a.start().await.unwrap();
    b.start().await.unwrap();
    wait_for(|| sw.sessions().len() == 2).await;

    a.request_neighbors().await.unwrap();
    wait_for(|| !a.neighbors().is_empty()).await;
    let neighbors = a.neighbors();
    assert_eq!(neighbors.len(), 1);
    assert_eq!(neighbors[0].username, "bob");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn keepalive_pings_are_answered() {
    let sw = switch();
    let mut cfg = config("alice");
    cfg.keepalive = KeepaliveConfig {
        interval: Duration::from_millis(20),
        max_missed: 2,
    };
    let (worker, _host) = endpoint(cfg, DuplexConnector { switch: sw.clone() });
    worker.start().await.unwrap();

    wait_for(|| worker.metrics().pongs_received >= 3).await;
    assert!(worker.is_running());
    assert_eq!(worker.state(), EndpointState::Ready);
    worker.stop().await;
}

#[tokio::test]
async fn unanswered_keepalives_time_out() {
    let mut cfg = config("alice");
    cfg.keepalive = KeepaliveConfig {
        interval: Duration::from_millis(20),
        max_missed: 1,
    };
    let reply = LoginReply::Accepted {
        session: 1,
        network: "default".into(),
    };
    let (worker, _host) = endpoint(cfg, ScriptedConnector { reply: Some(reply), hang_up: false });
    worker.start().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), worker.join())
        .await
        .expect("keepalive never gave up");
    assert!(matches!(result, Err(Error::Network(NetworkError::ConnectionTimeout))));
    assert_eq!(worker.state(), EndpointState::Disconnected);
    assert!(worker.metrics().pings_sent >= 2);
}
