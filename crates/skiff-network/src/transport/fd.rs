//! Async streams over raw socket descriptors.
//!
//! Descriptors are registered with the tokio reactor. Some descriptors
//! (vsock devices of certain hypervisors, character devices) refuse epoll
//! registration; for those the stream falls back to non-blocking polling
//! with a 1 ms back-off between `EWOULDBLOCK` results.

#![allow(unsafe_code)]

use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// Back-off used when a descriptor cannot be driven by readiness events.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Put a descriptor into non-blocking mode.
///
/// # Errors
///
/// Returns the `fcntl` error.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we were handed; no memory is passed.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn raw_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: buf is valid for writes of buf.len() bytes.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        #[allow(clippy::cast_sign_loss)]
        Ok(n as usize)
    }
}

pub(crate) fn raw_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: buf is valid for reads of buf.len() bytes.
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        #[allow(clippy::cast_sign_loss)]
        Ok(n as usize)
    }
}

enum Mode {
    Reactor(AsyncFd<OwnedFd>),
    Polled {
        fd: OwnedFd,
        read_wait: Option<Pin<Box<Sleep>>>,
        write_wait: Option<Pin<Box<Sleep>>>,
    },
}

/// A non-blocking descriptor as an [`AsyncRead`] + [`AsyncWrite`] stream.
pub struct FdStream {
    mode: Mode,
}

impl FdStream {
    /// Wrap a connected descriptor, preferring reactor readiness.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be made non-blocking.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        // SAFETY: `fd` is owned and moves into the AsyncFd, so it stays open
        // and unchanged for as long as it is registered.
        match unsafe { AsyncFd::register(fd) } {
            Ok(async_fd) => Ok(Self {
                mode: Mode::Reactor(async_fd),
            }),
            Err(err) => {
                let (fd, cause) = err.into_parts();
                tracing::debug!(error = %cause, "Descriptor not pollable, using timed polling");
                Ok(Self::polled_unchecked(fd))
            }
        }
    }

    /// Wrap a descriptor in timed-polling mode regardless of epoll support.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be made non-blocking.
    pub fn polled(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self::polled_unchecked(fd))
    }

    const fn polled_unchecked(fd: OwnedFd) -> Self {
        Self {
            mode: Mode::Polled {
                fd,
                read_wait: None,
                write_wait: None,
            },
        }
    }

    /// Whether the stream is driven by reactor readiness.
    #[must_use]
    pub const fn is_reactor_driven(&self) -> bool {
        matches!(self.mode, Mode::Reactor(_))
    }
}

/// Retry `op` on `EWOULDBLOCK`, sleeping [`POLL_INTERVAL`] in between.
fn poll_with_backoff<T>(
    wait: &mut Option<Pin<Box<Sleep>>>,
    cx: &mut Context<'_>,
    mut op: impl FnMut() -> io::Result<T>,
) -> Poll<io::Result<T>> {
    loop {
        if let Some(sleep) = wait.as_mut() {
            ready!(sleep.as_mut().poll(cx));
            *wait = None;
        }
        match op() {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                *wait = Some(Box::pin(tokio::time::sleep(POLL_INTERVAL)));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            other => return Poll::Ready(other),
        }
    }
}

impl AsyncRead for FdStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let n = match &mut self.get_mut().mode {
            Mode::Reactor(fd) => loop {
                let mut guard = ready!(fd.poll_read_ready(cx))?;
                let unfilled = buf.initialize_unfilled();
                match guard.try_io(|inner| raw_read(inner.as_raw_fd(), unfilled)) {
                    Ok(result) => break result?,
                    Err(_would_block) => {}
                }
            },
            Mode::Polled { fd, read_wait, .. } => {
                let raw = fd.as_raw_fd();
                let unfilled = buf.initialize_unfilled();
                ready!(poll_with_backoff(read_wait, cx, || raw_read(raw, unfilled)))?
            }
        };
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for FdStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().mode {
            Mode::Reactor(fd) => loop {
                let mut guard = ready!(fd.poll_write_ready(cx))?;
                match guard.try_io(|inner| raw_write(inner.as_raw_fd(), buf)) {
                    Ok(result) => return Poll::Ready(result),
                    Err(_would_block) => {}
                }
            },
            Mode::Polled { fd, write_wait, .. } => {
                let raw = fd.as_raw_fd();
                poll_with_backoff(write_wait, cx, || raw_write(raw, buf))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let raw = match &self.mode {
            Mode::Reactor(fd) => fd.as_raw_fd(),
            Mode::Polled { fd, .. } => fd.as_raw_fd(),
        };
        // SAFETY: shutdown on an owned socket; ENOTSOCK is ignored below.
        let rc = unsafe { libc::shutdown(raw, libc::SHUT_WR) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOTSOCK) && err.kind() != io::ErrorKind::NotConnected {
                return Poll::Ready(Err(err));
            }
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{read_frame, write_frame};
    use std::os::unix::net::UnixStream;

    fn pair() -> (OwnedFd, OwnedFd) {
        let (a, b) = UnixStream::pair().unwrap();
        (OwnedFd::from(a), OwnedFd::from(b))
    }

    async fn exchange(mut left: FdStream, mut right: FdStream) {
        let frames: Vec<Vec<u8>> = [14usize, 60, 1500, 9000]
            .iter()
            .map(|len| vec![0xa5; *len])
            .collect();
        let sent = frames.clone();
        let writer = tokio::spawn(async move {
            for frame in &sent {
                write_frame(&mut left, frame).await.unwrap();
            }
        });
        let mut buf = Vec::new();
        for frame in &frames {
            let n = read_frame(&mut right, &mut buf).await.unwrap().unwrap();
            assert_eq!(&buf[..n], frame.as_slice());
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn socketpair_is_reactor_driven() {
        let (a, b) = pair();
        let left = FdStream::new(a).unwrap();
        let right = FdStream::new(b).unwrap();
        assert!(left.is_reactor_driven());
        exchange(left, right).await;
    }

    #[tokio::test]
    async fn polled_mode_moves_frames() {
        let (a, b) = pair();
        let left = FdStream::polled(a).unwrap();
        let right = FdStream::polled(b).unwrap();
        assert!(!left.is_reactor_driven());
        exchange(left, right).await;
    }

    #[tokio::test]
    async fn regular_files_fall_back_to_polling() {
        let file = tempfile::tempfile().unwrap();
        let stream = FdStream::new(OwnedFd::from(file)).unwrap();
        assert!(!stream.is_reactor_driven());
    }
}
