//! Thin wrappers over epoll, eventfd and timerfd, plus non-blocking fd
//! helpers shared by the client and dispatcher code.

use nix::errno::Errno;
use nix::libc;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

pub(crate) const EV_IN: u32 = libc::EPOLLIN as u32;
pub(crate) const EV_OUT: u32 = libc::EPOLLOUT as u32;
pub(crate) const EV_HUP: u32 = (libc::EPOLLHUP | libc::EPOLLERR) as u32;

fn check(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Level-triggered readiness demultiplexer.
///
/// Sources are identified by a caller-chosen 64-bit token; a source can be
/// silenced by modifying it to an empty event set without deregistering.
pub(crate) struct Poller {
    epoll: OwnedFd,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = check(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: token };
        check(unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) })?;
        Ok(())
    }

    pub(crate) fn add(&self, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, token)
    }

    pub(crate) fn modify(&self, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, token)
    }

    pub(crate) fn remove(&self, fd: RawFd) {
        let _ = self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0);
    }

    /// Blocks until at least one source is ready. Retries on EINTR.
    pub(crate) fn wait(
        &self,
        events: &mut Vec<libc::epoll_event>,
        max_events: usize,
    ) -> io::Result<usize> {
        events.clear();
        events.resize(max_events, libc::epoll_event { events: 0, u64: 0 });
        loop {
            let rc = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    events.as_mut_ptr(),
                    max_events as libc::c_int,
                    -1,
                )
            };
            match check(rc) {
                Ok(n) => {
                    events.truncate(n as usize);
                    return Ok(n as usize);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// A 64-bit kernel event counter (eventfd).
pub(crate) struct EventCounter {
    fd: OwnedFd,
}

impl EventCounter {
    pub(crate) fn new(nonblocking: bool) -> io::Result<Self> {
        let mut flags = libc::EFD_CLOEXEC;
        if nonblocking {
            flags |= libc::EFD_NONBLOCK;
        }
        let fd = check(unsafe { libc::eventfd(0, flags) })?;
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Adds `value` to the counter. A saturated counter already has a wake
    /// pending, so a short or refused write is not an error.
    pub(crate) fn post(&self, value: u64) -> io::Result<()> {
        write_nonblock(self.fd.as_raw_fd(), &value.to_ne_bytes())?;
        Ok(())
    }

    /// Reads and resets the counter. Returns 0 when nothing is pending.
    pub(crate) fn drain(&self) -> io::Result<u64> {
        let mut bytes = [0u8; 8];
        match read_nonblock(self.fd.as_raw_fd(), &mut bytes)? {
            IoStatus::Transferred(8) => Ok(u64::from_ne_bytes(bytes)),
            _ => Ok(0),
        }
    }
}

impl AsRawFd for EventCounter {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// One-shot monotonic timer (timerfd).
pub(crate) struct SettleTimer {
    fd: OwnedFd,
}

impl SettleTimer {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = check(unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC)
        })?;
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn settime(&self, timeout: Duration) -> io::Result<()> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: timeout.as_secs() as libc::time_t,
                tv_nsec: timeout.subsec_nanos() as libc::c_long,
            },
        };
        check(unsafe {
            libc::timerfd_settime(self.fd.as_raw_fd(), 0, &spec, std::ptr::null_mut())
        })?;
        Ok(())
    }

    pub(crate) fn arm(&self, timeout: Duration) -> io::Result<()> {
        self.settime(timeout)
    }

    /// Disarming also clears a pending expiry.
    pub(crate) fn disarm(&self) -> io::Result<()> {
        self.settime(Duration::ZERO)
    }
}

impl AsRawFd for SettleTimer {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Outcome of one non-blocking transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoStatus {
    Transferred(usize),
    WouldBlock,
    /// The peer end has been closed.
    Closed,
}

pub(crate) fn read_nonblock(fd: RawFd, dst: &mut [u8]) -> io::Result<IoStatus> {
    loop {
        let n = unsafe { libc::read(fd, dst.as_mut_ptr().cast(), dst.len()) };
        if n > 0 {
            return Ok(IoStatus::Transferred(n as usize));
        }
        if n == 0 {
            return Ok(IoStatus::Closed);
        }
        match Errno::last() {
            Errno::EINTR => continue,
            Errno::EAGAIN => return Ok(IoStatus::WouldBlock),
            errno => return Err(io::Error::from(errno)),
        }
    }
}

pub(crate) fn write_nonblock(fd: RawFd, src: &[u8]) -> io::Result<IoStatus> {
    loop {
        let n = unsafe { libc::write(fd, src.as_ptr().cast(), src.len()) };
        if n >= 0 {
            return Ok(IoStatus::Transferred(n as usize));
        }
        match Errno::last() {
            Errno::EINTR => continue,
            Errno::EAGAIN => return Ok(IoStatus::WouldBlock),
            errno => return Err(io::Error::from(errno)),
        }
    }
}

/// Discards up to `limit` pending bytes from a non-blocking fd.
pub(crate) fn discard_pending(fd: RawFd, limit: usize) -> io::Result<usize> {
    let mut scratch = [0u8; 4096];
    let mut total = 0;
    while total < limit {
        let want = scratch.len().min(limit - total);
        match read_nonblock(fd, &mut scratch[..want])? {
            IoStatus::Transferred(n) => total += n,
            IoStatus::WouldBlock | IoStatus::Closed => break,
        }
    }
    Ok(total)
}
