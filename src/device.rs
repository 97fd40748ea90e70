//! Virtual network device abstraction.
//!
//! The endpoint talks to its local Layer-2 interface only through
//! [`VirtualDevice`]; devices are obtained from a [`DeviceProvider`] so the
//! worker controls when the device is opened.
//!
//! Two implementations ship with the crate:
//! - [`MemoryDevice`] : channel-backed, paired with a [`MemoryDeviceHandle`]
//!   that plays the host network stack.  Used by tests and by applications
//!   embedding the endpoint.
//! - [`crate::tap::TapDevice`] : a Linux TAP interface.

use std::future::Future;
use std::io;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::config::DeviceConfig;
use crate::error::DeviceError;
use crate::shutdown::Shutdown;

/// Frames buffered in each direction of a [`MemoryDevice`].
const MEMORY_QUEUE_DEPTH: usize = 256;

/// A local Layer-2 interface.
///
/// `read` must be cancel safe: the endpoint races it against its keepalive
/// timer and the shutdown signal.  After [`VirtualDevice::close`] pending and
/// future reads fail.
pub trait VirtualDevice: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Read one Ethernet frame into `buf`.  May fail with
    /// [`io::ErrorKind::WouldBlock`], which callers retry.
    fn read(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Write one Ethernet frame.
    fn write(&self, buf: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;

    fn set_up(&self) -> Result<(), DeviceError>;

    fn set_addr(&self, ip: Ipv4Addr, mask: Ipv4Addr) -> Result<(), DeviceError>;

    fn set_mtu(&self, mtu: u32) -> Result<(), DeviceError>;

    fn close(&self);
}

pub trait DeviceProvider: Send + Sync + 'static {
    type Device: VirtualDevice;

    fn open(&self, config: &DeviceConfig) -> Result<Self::Device, DeviceError>;
}

// ---------------------------------------------------------------------------
// MemoryDevice
// ---------------------------------------------------------------------------

/// Configuration a [`MemoryDevice`] has received, as seen by the host side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub up: bool,
    pub address: Option<(Ipv4Addr, Ipv4Addr)>,
    pub mtu: Option<u32>,
    pub closed: bool,
}

pub struct MemoryDevice {
    name: String,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
    status: Arc<Mutex<DeviceStatus>>,
    closed: Shutdown,
}

/// Host side of a [`MemoryDevice`]: inject frames the "kernel" would deliver
/// and collect the frames the endpoint writes.
pub struct MemoryDeviceHandle {
    to_device: mpsc::Sender<Vec<u8>>,
    from_device: mpsc::Receiver<Vec<u8>>,
    status: Arc<Mutex<DeviceStatus>>,
}

impl MemoryDevice {
    pub fn pair(name: impl Into<String>) -> (MemoryDevice, MemoryDeviceHandle) {
        let (to_device, inbound) = mpsc::channel(MEMORY_QUEUE_DEPTH);
        let (outbound, from_device) = mpsc::channel(MEMORY_QUEUE_DEPTH);
        let status = Arc::new(Mutex::new(DeviceStatus::default()));
        let device = MemoryDevice {
            name: name.into(),
            inbound: tokio::sync::Mutex::new(inbound),
            outbound,
            status: status.clone(),
            closed: Shutdown::new(),
        };
        let handle = MemoryDeviceHandle {
            to_device,
            from_device,
            status,
        };
        (device, handle)
    }

    fn update(&self, f: impl FnOnce(&mut DeviceStatus)) {
        f(&mut self.status.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed.is_triggered() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device closed"));
        }
        Ok(())
    }
}

impl VirtualDevice for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        let mut closed = self.closed.listener();
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            frame = inbound.recv() => match frame {
                Some(frame) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    Ok(n)
                }
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "host side dropped")),
            },
            _ = closed.wait() => Err(io::Error::new(io::ErrorKind::NotConnected, "device closed")),
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        self.outbound
            .send(buf.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "host side dropped"))?;
        Ok(buf.len())
    }

    fn set_up(&self) -> Result<(), DeviceError> {
        self.update(|s| s.up = true);
        Ok(())
    }

    fn set_addr(&self, ip: Ipv4Addr, mask: Ipv4Addr) -> Result<(), DeviceError> {
        self.update(|s| s.address = Some((ip, mask)));
        Ok(())
    }

    fn set_mtu(&self, mtu: u32) -> Result<(), DeviceError> {
        self.update(|s| s.mtu = Some(mtu));
        Ok(())
    }

    fn close(&self) {
        self.closed.trigger();
        self.update(|s| {
            s.closed = true;
            s.up = false;
        });
    }
}

impl MemoryDeviceHandle {
    /// Deliver a frame to the device, as if the host stack transmitted it.
    pub async fn inject(&self, frame: impl Into<Vec<u8>>) -> Result<(), DeviceError> {
        self.to_device
            .send(frame.into())
            .await
            .map_err(|_| DeviceError::WriteFailed("device dropped".into()))
    }

    /// Next frame the endpoint wrote to the device.  `None` once the device
    /// is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.from_device.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.from_device.try_recv().ok()
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Hands out one pre-built [`MemoryDevice`], or fails every open.
pub struct MemoryDeviceProvider {
    device: Mutex<Option<MemoryDevice>>,
}

impl MemoryDeviceProvider {
    pub fn new(device: MemoryDevice) -> Self {
        Self {
            device: Mutex::new(Some(device)),
        }
    }

    /// A provider whose `open` always fails, for exercising startup errors.
    pub fn unavailable() -> Self {
        Self {
            device: Mutex::new(None),
        }
    }
}

impl DeviceProvider for MemoryDeviceProvider {
    type Device = MemoryDevice;

    fn open(&self, config: &DeviceConfig) -> Result<MemoryDevice, DeviceError> {
        self.device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| DeviceError::DeviceOpenFailed(format!("{}: no device available", config.name)))
    }
}
