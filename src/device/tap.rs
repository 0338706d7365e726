//! Linux TAP device via `/dev/net/tun`.
//!
//! Only attaches to the interface. Addressing, MTU and link state are left
//! to the host (`ip link set <name> up`, ...).

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use super::VirtualDevice;
use crate::error::{RelayError, Result};

const TUN_PATH: &str = "/dev/net/tun";

const IFNAMSIZ: usize = 16;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// `struct ifreq` with the flags member of the union; padded to the
/// kernel's 40-byte size.
#[repr(C)]
struct IfReq {
    ifr_name: [u8; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// An attached TAP interface carrying Ethernet frames without packet info.
pub struct TapDevice {
    file: File,
    name: String,
}

impl TapDevice {
    /// Attach to (or create) the TAP interface `name`. An empty name lets
    /// the kernel pick one (`tap0`, `tap1`, ...).
    pub fn open(name: &str) -> Result<Self> {
        if name.len() >= IFNAMSIZ {
            return Err(RelayError::Device(format!(
                "interface name too long: {:?} (max {} bytes)",
                name,
                IFNAMSIZ - 1
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_PATH)
            .map_err(|e| RelayError::Device(format!("failed to open {}: {}", TUN_PATH, e)))?;

        let mut req = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: IFF_TAP | IFF_NO_PI,
            _pad: [0; 22],
        };
        req.ifr_name[..name.len()].copy_from_slice(name.as_bytes());

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req as *mut IfReq) };
        if ret < 0 {
            return Err(RelayError::Device(format!(
                "TUNSETIFF failed: {}",
                io::Error::last_os_error()
            )));
        }

        // The kernel writes back the final name
        let len = req.ifr_name.iter().position(|&b| b == 0).unwrap_or(IFNAMSIZ);
        let name = String::from_utf8_lossy(&req.ifr_name[..len]).into_owned();
        log::info!("Attached to TAP device {}", name);

        Ok(TapDevice { file, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl VirtualDevice for TapDevice {
    fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<usize> {
        (&self.file).write(frame)
    }

    fn wait_readable(&self, timeout: Duration) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        ret > 0 && pfd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0
    }
}
