//! Linux TUN device as the host network stack of an adapter
//!
//! The bridge binary uses a kernel TUN interface in place of a network
//! stack: packets the kernel routes into the interface are submitted to the
//! adapter, and packets a consumer writes are injected back into the kernel.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use ipnet::IpNet;
use nix::libc::{self, IFF_NO_PI, IFF_TUN, IFNAMSIZ, c_char, c_short};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, info, trace, warn};

use crate::adapter::{Adapter, InboundPacket, MediaConnectState, NetworkStack};
use crate::batch::{Batch, BatchStatus};
use crate::exchange::MAX_IP_PACKET_SIZE;

const TUNSETIFF: libc::Ioctl = 0x400454ca as libc::Ioctl;

/// Poll interval of the reader thread, bounds shutdown latency
const POLL_TIMEOUT_MS: u16 = 100;

#[repr(C)]
struct IfReq {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_flags: c_short,
    _padding: [u8; 22],
}

impl IfReq {
    fn new(name: &str, flags: c_short) -> io::Result<Self> {
        if name.is_empty() || name.len() >= IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TUN device name too long",
            ));
        }
        let mut ifr = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: flags,
            _padding: [0; 22],
        };
        for (i, byte) in name.bytes().enumerate() {
            ifr.ifr_name[i] = byte as c_char;
        }
        Ok(ifr)
    }
}

/// Layer 3 TUN device (raw IP packets, no packet information header).
pub struct TunDevice {
    name: String,
    file: File,
}

impl TunDevice {
    pub fn create(name: &str) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;

        let ifr = IfReq::new(name, (IFF_TUN | IFF_NO_PI) as c_short)?;
        let result = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &ifr) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        info!(name, "TUN device created");
        Ok(Self {
            name: name.to_string(),
            file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Read one packet (blocks until data is available)
    pub fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    /// Write one packet
    pub fn write_packet(&self, packet: &[u8]) -> io::Result<usize> {
        (&self.file).write(packet)
    }

    /// Wait until a packet is readable or the timeout expires.
    fn wait_readable(&self, timeout_ms: u16) -> io::Result<bool> {
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, PollTimeout::from(timeout_ms)).map_err(io::Error::from)?;
        Ok(ready > 0)
    }

    /// Set IFF_UP on the interface.
    pub fn bring_up(&self) -> io::Result<()> {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if sock < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock_guard = SockGuard(sock);

        let mut ifr = IfReq::new(&self.name, 0)?;
        let ret = unsafe { libc::ioctl(sock_guard.0, libc::SIOCGIFFLAGS as _, &mut ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        ifr.ifr_flags |= libc::IFF_UP as c_short;
        let ret = unsafe { libc::ioctl(sock_guard.0, libc::SIOCSIFFLAGS as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        info!(name = %self.name, "Interface set UP");
        Ok(())
    }

    /// Assign an address to the interface.
    ///
    /// This runs `ip addr add <address> dev <name>`.
    pub fn add_address(&self, address: IpNet) -> io::Result<()> {
        let output = Command::new("ip")
            .args(["addr", "add", &address.to_string(), "dev", &self.name])
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Address already assigned
            if !stderr.contains("File exists") {
                return Err(io::Error::other(format!(
                    "ip addr add failed: {}",
                    stderr.trim()
                )));
            }
        }

        info!(address = %address, name = %self.name, "Address added");
        Ok(())
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        debug!(name = %self.name, "TUN device closed");
    }
}

/// RAII guard for socket fd
struct SockGuard(RawFd);

impl Drop for SockGuard {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

/// Network stack backed by a TUN device.
///
/// Indicated packets are written to the device; released batches are
/// dropped, the kernel does its own retransmission.
pub struct TunStack {
    device: Arc<TunDevice>,
}

impl TunStack {
    pub fn new(device: Arc<TunDevice>) -> Self {
        Self { device }
    }
}

impl NetworkStack for TunStack {
    fn indicate(&self, packets: &mut [InboundPacket<'_>]) {
        for packet in packets.iter_mut() {
            if let Err(e) = self.device.write_packet(packet.data()) {
                warn!(name = %self.device.name(), error = %e, len = packet.len(), "TUN write failed");
                packet.reject();
            }
        }
    }

    fn release(&self, batch: Batch, status: BatchStatus) {
        if !status.is_success() {
            trace!(packets = batch.len(), status = ?status, "Outbound batch dropped");
        }
    }

    fn link_state(&self, state: MediaConnectState) {
        info!(name = %self.device.name(), state = ?state, "Link state changed");
    }
}

/// Spawn the thread feeding packets from the TUN device into the adapter.
///
/// Each packet is submitted as a single-packet batch. The thread exits once
/// `shutdown` is set.
pub fn spawn_reader(
    device: Arc<TunDevice>,
    adapter: Arc<Adapter>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("{}-rx", device.name()))
        .spawn(move || reader_loop(&device, &adapter, &shutdown))
}

fn reader_loop(device: &TunDevice, adapter: &Adapter, shutdown: &AtomicBool) {
    let mut buf = vec![0u8; MAX_IP_PACKET_SIZE];
    while !shutdown.load(Ordering::SeqCst) {
        match device.wait_readable(POLL_TIMEOUT_MS) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(name = %device.name(), error = %e, "TUN poll failed");
                break;
            }
        }

        match device.read_packet(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                trace!(len = n, "TUN packet read");
                adapter.submit([Batch::single(buf[..n].to_vec())]);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(name = %device.name(), error = %e, "TUN read failed");
                break;
            }
        }
    }
    debug!(name = %device.name(), "TUN reader stopped");
}
