//! The master's end of the dispatch socket.
//!
//! A UNIX-domain stream socket listening with backlog equal to the
//! worker count: every worker can always enqueue a connect, so a
//! full pool never observes connection-refused while the master is
//! alive. The socket file is unlinked before bind (stale files from
//! a dead master) and again at stop.

use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{
    AddressFamily, Backlog, SockFlag, SockType, UnixAddr, accept, bind, listen, socket,
};
use nix::unistd::{Pid, getpid};

use crate::error::Result;

/// Listening socket handle, owned by the master process.
pub(crate) struct Listener {
    fd: Option<OwnedFd>,
    path: PathBuf,
    /// Pid that created the socket file. Forked children inherit the
    /// struct but must never unlink the path; only the owner does.
    owner: Pid,
}

impl Listener {
    /// Unlink any stale socket file, then bind and listen.
    pub(crate) fn start(path: &Path, backlog: usize) -> Result<Self> {
        remove_if_present(path)?;

        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )?;
        let addr = UnixAddr::new(path)?;
        bind(fd.as_raw_fd(), &addr)?;
        listen(&fd, Backlog::new(backlog as i32)?)?;

        Ok(Self {
            fd: Some(fd),
            path: path.to_path_buf(),
            owner: getpid(),
        })
    }

    /// Bounded check for a pending connection. `Ok(false)` covers
    /// timeout and interruption by a signal; the caller re-checks its
    /// flags and polls again.
    pub(crate) fn pending(&self, timeout: Duration) -> Result<bool> {
        let Some(fd) = &self.fd else {
            return Ok(false);
        };
        let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(ms)) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Accept one connection. Bounded in practice because callers
    /// only accept after `pending` reported a waiting connection.
    pub(crate) fn accept_one(&self) -> Result<UnixStream> {
        let Some(fd) = &self.fd else {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        };
        let conn = accept(fd.as_raw_fd())?;
        // SAFETY: accept returned a fresh descriptor we now own.
        Ok(unsafe { <UnixStream as std::os::fd::FromRawFd>::from_raw_fd(conn) })
    }

    /// Raw listening descriptor, for the fork prelude to close in the
    /// child.
    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Close the listening handle and unlink the path. Idempotent.
    pub(crate) fn stop(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if self.fd.take().is_some() && getpid() == self.owner {
            let _ = fs::remove_file(&self.path);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
