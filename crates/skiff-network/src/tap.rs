//! Linux TAP interfaces.
//!
//! A TAP device created through `/dev/net/tun` lives as long as its
//! descriptor: dropping a [`TapDevice`] removes the interface.

#![allow(unsafe_code)]

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;

use crate::device::FrameDevice;
use crate::naming::MAX_IFNAME_LEN;
use crate::transport::fd::{raw_read, raw_write};

const TUN_PATH: &str = "/dev/net/tun";
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// A TAP interface carrying raw Ethernet frames (no packet info header).
pub struct TapDevice {
    name: String,
    fd: AsyncFd<OwnedFd>,
}

impl std::fmt::Debug for TapDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapDevice").field("name", &self.name).finish()
    }
}

impl TapDevice {
    /// Create (or attach to) the TAP interface `name`.
    ///
    /// # Errors
    ///
    /// Fails if the name is too long, `/dev/net/tun` is unavailable or the
    /// caller lacks `CAP_NET_ADMIN`.
    pub fn open(name: &str) -> io::Result<Self> {
        if name.is_empty() || name.len() > MAX_IFNAME_LEN || name.contains('\0') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid interface name '{name}'"),
            ));
        }

        let path = CString::new(TUN_PATH).map_err(io::Error::other)?;
        // SAFETY: path is a valid NUL-terminated string.
        let raw = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: open returned a descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags: IFF_TAP | IFF_NO_PI,
            _pad: [0; 22],
        };
        for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
            #[allow(clippy::cast_possible_wrap)]
            {
                *dst = src as libc::c_char;
            }
        }
        // SAFETY: req is a properly sized ifreq that outlives the call.
        #[allow(clippy::unnecessary_cast, clippy::cast_possible_truncation)]
        let rc = unsafe {
            libc::ioctl(
                fd.as_raw_fd(),
                TUNSETIFF as _,
                std::ptr::from_mut(&mut req),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let actual: Vec<u8> = req
            .name
            .iter()
            .take_while(|c| **c != 0)
            .map(|c| c.to_ne_bytes()[0])
            .collect();
        let name = String::from_utf8_lossy(&actual).into_owned();
        tracing::debug!(name, "Opened TAP device");

        Ok(Self {
            name,
            // SAFETY: the descriptor is owned and moves into the AsyncFd.
            fd: unsafe { AsyncFd::register(fd) }?,
        })
    }
}

#[async_trait]
impl FrameDevice for TapDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| raw_read(inner.as_raw_fd(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => {}
            }
        }
    }

    async fn send_frame(&self, frame: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| raw_write(inner.as_raw_fd(), frame)) {
                Ok(result) => {
                    let written = result?;
                    if written != frame.len() {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            format!("short TAP write: {written} of {} bytes", frame.len()),
                        ));
                    }
                    return Ok(());
                }
                Err(_would_block) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ifreq_matches_kernel_size() {
        assert_eq!(std::mem::size_of::<IfReq>(), 40);
    }

    #[tokio::test]
    async fn rejects_overlong_names() {
        let err = TapDevice::open("this-name-is-too-long").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(TapDevice::open("").is_err());
    }
}
