//! Linux TAP device.
//!
//! Opens `/dev/net/tun` in TAP mode without packet information, switches the
//! descriptor to non-blocking and drives it through tokio's [`AsyncFd`].
//! Link configuration (up, address, MTU) goes through the `ip` tool, so
//! those calls need `CAP_NET_ADMIN` like the open itself.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::process::Command;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::config::DeviceConfig;
use crate::control::Lease;
use crate::device::{DeviceProvider, VirtualDevice};
use crate::error::DeviceError;
use crate::shutdown::Shutdown;

const TUN_PATH: &str = "/dev/net/tun";
const IFNAMSIZ: usize = 16;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

#[repr(C)]
struct IfReq {
    name: [u8; IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TapProvider;

impl DeviceProvider for TapProvider {
    type Device = TapDevice;

    fn open(&self, config: &DeviceConfig) -> Result<TapDevice, DeviceError> {
        TapDevice::open(&config.name)
    }
}

#[derive(Debug)]
pub struct TapDevice {
    name: String,
    fd: AsyncFd<File>,
    closed: Shutdown,
}

impl TapDevice {
    /// Create (or attach to) the TAP interface `name`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn open(name: &str) -> Result<Self, DeviceError> {
        if name.is_empty() || name.len() >= IFNAMSIZ {
            return Err(DeviceError::DeviceCreateFailed(format!("bad interface name {name:?}")));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_PATH)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => DeviceError::DeviceNotFound(TUN_PATH.into()),
                _ => DeviceError::DeviceOpenFailed(format!("{TUN_PATH}: {e}")),
            })?;

        let mut req = IfReq {
            name: [0; IFNAMSIZ],
            flags: IFF_TAP | IFF_NO_PI,
            _pad: [0; 22],
        };
        req.name[..name.len()].copy_from_slice(name.as_bytes());

        let fd = file.as_raw_fd();
        // SAFETY: `fd` is an open descriptor owned by `file` and `req` is a
        // properly sized, initialised ifreq that outlives the call.
        unsafe {
            if libc::ioctl(fd, TUNSETIFF as _, &req as *const IfReq) < 0 {
                let e = io::Error::last_os_error();
                return Err(match e.raw_os_error() {
                    Some(libc::EBUSY) => DeviceError::DeviceAlreadyExists(name.into()),
                    _ => DeviceError::DeviceCreateFailed(format!("{name}: TUNSETIFF: {e}")),
                });
            }
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(DeviceError::DeviceOpenFailed(format!(
                    "{name}: O_NONBLOCK: {}",
                    io::Error::last_os_error()
                )));
            }
        }

        Self::from_file(name, file)
    }

    /// Register an already non-blocking descriptor with the reactor.
    fn from_file(name: &str, file: File) -> Result<Self, DeviceError> {
        let fd = AsyncFd::with_interest(file, Interest::READABLE | Interest::WRITABLE)
            .map_err(|e| DeviceError::DeviceOpenFailed(format!("{name}: {e}")))?;
        Ok(Self {
            name: name.to_string(),
            fd,
            closed: Shutdown::new(),
        })
    }

    fn ip(&self, args: &[&str]) -> Result<(), DeviceError> {
        let out = Command::new("ip")
            .args(args)
            .output()
            .map_err(|e| DeviceError::DeviceOpenFailed(format!("ip: {e}")))?;
        if !out.status.success() {
            return Err(DeviceError::DeviceOpenFailed(format!(
                "ip {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(())
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "device closed")
    }
}

impl VirtualDevice for TapDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut closed = self.closed.listener();
        loop {
            if closed.is_triggered() {
                return Err(Self::closed_error());
            }
            let mut guard = tokio::select! {
                ready = self.fd.readable() => ready?,
                _ = closed.wait() => return Err(Self::closed_error()),
            };
            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut closed = self.closed.listener();
        loop {
            if closed.is_triggered() {
                return Err(Self::closed_error());
            }
            let mut guard = tokio::select! {
                ready = self.fd.writable() => ready?,
                _ = closed.wait() => return Err(Self::closed_error()),
            };
            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    fn set_up(&self) -> Result<(), DeviceError> {
        self.ip(&["link", "set", "dev", &self.name, "up"])
    }

    fn set_addr(&self, ip: Ipv4Addr, mask: Ipv4Addr) -> Result<(), DeviceError> {
        let prefix_len = u32::from(mask).count_ones() as u8;
        let cidr = Lease { address: ip, prefix_len }.to_string();
        self.ip(&["addr", "replace", &cidr, "dev", &self.name])
    }

    fn set_mtu(&self, mtu: u32) -> Result<(), DeviceError> {
        self.ip(&["link", "set", "dev", &self.name, "mtu", &mtu.to_string()])
    }

    fn close(&self) {
        self.closed.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ifreq_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<IfReq>(), 40);
    }

    /// A non-blocking pipe write end whose buffer is already full.
    fn full_pipe() -> (File, File) {
        use std::os::fd::FromRawFd;

        let mut fds = [0; 2];
        // SAFETY: `fds` has room for the two descriptors pipe(2) returns,
        // and each is wrapped in exactly one `File`.
        let (rx, mut tx) = unsafe {
            assert_eq!(libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK), 0);
            (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1]))
        };
        let chunk = [0u8; 4096];
        while tx.write(&chunk).is_ok() {}
        (rx, tx)
    }

    #[tokio::test]
    async fn close_unblocks_a_stalled_write() {
        let (_rx, tx) = full_pipe();
        let device = std::sync::Arc::new(TapDevice::from_file("pipe0", tx).unwrap());

        let writer = device.clone();
        let pending = tokio::spawn(async move { writer.write(&[1u8; 64]).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        device.close();
        let res = tokio::time::timeout(std::time::Duration::from_secs(1), pending)
            .await
            .expect("write stayed blocked after close")
            .unwrap();
        assert_eq!(res.unwrap_err().kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn rejects_overlong_names() {
        assert!(matches!(
            TapDevice::open("a-name-that-is-far-too-long"),
            Err(DeviceError::DeviceCreateFailed(_))
        ));
    }
}
