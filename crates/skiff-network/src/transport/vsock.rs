//! Native `AF_VSOCK` sockets.
//!
//! Inside a VM the agent and the helper listen on vsock ports with
//! [`VsockBinder`]. On hosts whose hypervisor uses vhost-vsock, the daemon
//! reaches a guest by context id with [`VsockChannel`].

#![allow(unsafe_code)]

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use async_trait::async_trait;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use super::fd::FdStream;
use super::{ChannelBinder, ChannelListener, ChannelStream, ControlChannel};

/// Context id that accepts connections for any local address.
pub const VMADDR_CID_ANY: u32 = libc::VMADDR_CID_ANY;

/// Context id of the host.
pub const VMADDR_CID_HOST: u32 = libc::VMADDR_CID_HOST;

fn vsock_socket() -> io::Result<OwnedFd> {
    // SAFETY: plain socket(2) call; the result is checked before use.
    let fd = unsafe {
        libc::socket(
            libc::AF_VSOCK,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a freshly created descriptor we own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn sockaddr(cid: u32, port: u32) -> libc::sockaddr_vm {
    // SAFETY: sockaddr_vm is plain old data; all-zero is a valid value.
    let mut addr: libc::sockaddr_vm = unsafe { mem::zeroed() };
    #[allow(clippy::cast_possible_truncation)]
    {
        addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
    }
    addr.svm_cid = cid;
    addr.svm_port = port;
    addr
}

#[allow(clippy::cast_possible_truncation)]
const SOCKADDR_VM_LEN: libc::socklen_t = mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t;

/// Listens on vsock ports of the local VM.
#[derive(Debug, Clone, Copy)]
pub struct VsockBinder {
    cid: u32,
}

impl VsockBinder {
    /// Listen on any local context id.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cid: VMADDR_CID_ANY,
        }
    }
}

impl Default for VsockBinder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelBinder for VsockBinder {
    async fn bind(&self, port: u32) -> io::Result<Box<dyn ChannelListener>> {
        let fd = vsock_socket()?;
        let addr = sockaddr(self.cid, port);
        // SAFETY: addr is a valid sockaddr_vm of the advertised length.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                std::ptr::from_ref(&addr).cast(),
                SOCKADDR_VM_LEN,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: listen on a bound socket we own.
        if unsafe { libc::listen(fd.as_raw_fd(), 128) } < 0 {
            return Err(io::Error::last_os_error());
        }
        tracing::debug!(port, "Listening on vsock");
        Ok(Box::new(VsockListener {
            // SAFETY: the descriptor is owned and moves into the AsyncFd.
            fd: unsafe { AsyncFd::register(fd) }?,
            port,
        }))
    }
}

struct VsockListener {
    fd: AsyncFd<OwnedFd>,
    port: u32,
}

fn accept_raw(listener: RawFd) -> io::Result<(OwnedFd, u32)> {
    // SAFETY: see sockaddr().
    let mut peer: libc::sockaddr_vm = unsafe { mem::zeroed() };
    let mut len = SOCKADDR_VM_LEN;
    // SAFETY: peer and len describe a writable sockaddr_vm buffer.
    let fd = unsafe {
        libc::accept4(
            listener,
            std::ptr::from_mut(&mut peer).cast(),
            &raw mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: accept4 returned a new descriptor we own.
    Ok((unsafe { OwnedFd::from_raw_fd(fd) }, peer.svm_cid))
}

#[async_trait]
impl ChannelListener for VsockListener {
    async fn accept(&mut self) -> io::Result<ChannelStream> {
        let (fd, cid) = self
            .fd
            .async_io(Interest::READABLE, |inner| accept_raw(inner.as_raw_fd()))
            .await?;
        let stream = FdStream::new(fd)?;
        Ok(ChannelStream::new(
            stream,
            format!("vsock:{cid}->{}", self.port),
        ))
    }
}

/// Connects to ports of a guest by context id.
#[derive(Debug, Clone, Copy)]
pub struct VsockChannel {
    cid: u32,
}

impl VsockChannel {
    /// Connect to the guest with context id `cid`.
    #[must_use]
    pub const fn new(cid: u32) -> Self {
        Self { cid }
    }
}

#[async_trait]
impl ControlChannel for VsockChannel {
    async fn open(&self, port: u32) -> io::Result<ChannelStream> {
        let fd = vsock_socket()?;
        let addr = sockaddr(self.cid, port);
        // SAFETY: addr is a valid sockaddr_vm of the advertised length.
        let rc = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                std::ptr::from_ref(&addr).cast(),
                SOCKADDR_VM_LEN,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(err);
            }
            // SAFETY: the descriptor is owned and moves into the AsyncFd.
            let pending = unsafe { AsyncFd::register_with_interest(fd, Interest::WRITABLE) }?;
            drop(pending.writable().await?);
            let fd = pending.into_inner();
            if let Some(err) = take_socket_error(fd.as_raw_fd())? {
                return Err(err);
            }
            return Ok(ChannelStream::new(
                FdStream::new(fd)?,
                format!("vsock:{}:{port}", self.cid),
            ));
        }
        Ok(ChannelStream::new(
            FdStream::new(fd)?,
            format!("vsock:{}:{port}", self.cid),
        ))
    }

    fn describe(&self) -> String {
        format!("vsock:{}", self.cid)
    }
}

fn take_socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut value: libc::c_int = 0;
    #[allow(clippy::cast_possible_truncation)]
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: value and len describe a writable c_int.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            std::ptr::from_mut(&mut value).cast(),
            &raw mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((value != 0).then(|| io::Error::from_raw_os_error(value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_layout() {
        let addr = sockaddr(3, 5555);
        assert_eq!(i32::from(addr.svm_family), libc::AF_VSOCK);
        assert_eq!(addr.svm_cid, 3);
        assert_eq!(addr.svm_port, 5555);
    }

    #[tokio::test]
    async fn connecting_to_a_missing_guest_fails() {
        // Either vsock is unavailable here or no guest 0xfffffff0 exists.
        let attempt = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            VsockChannel::new(0xffff_fff0).open(5555),
        )
        .await;
        assert!(!matches!(attempt, Ok(Ok(_))));
    }
}
