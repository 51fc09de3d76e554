#![allow(dead_code)]

use mixlink::{PcmMulti, TransportOps, TransportSignal};
use nix::libc;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

pub struct NullTransport;

impl TransportOps for NullTransport {
    fn signal(&self, _signal: TransportSignal) {}
    fn resume(&self) {}
    fn drop_frames(&self) {}
    fn stop_if_no_clients(&self) {}
}

pub fn pipe_pair() -> (OwnedFd, OwnedFd) {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(rc, 0, "pipe2 failed");
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

pub fn socket_pair() -> (OwnedFd, OwnedFd) {
    let mut fds = [0i32; 2];
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(rc, 0, "socketpair failed");
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

/// Shrinks a pipe to the smallest size the kernel allows at or above
/// `size` bytes.
pub fn set_pipe_size(fd: RawFd, size: usize) {
    let rc = unsafe { libc::fcntl(fd, libc::F_SETPIPE_SZ, size as libc::c_int) };
    assert!(rc >= 0, "F_SETPIPE_SZ failed");
}

fn raw_write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn raw_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// The peer side of one client connection: our end of the data pipe and
/// the control socket.
pub struct TestClient {
    pub pcm: OwnedFd,
    pub ctl: OwnedFd,
}

impl TestClient {
    /// Connects a playback client; we keep the pipe's write end.
    pub fn playback(multi: &PcmMulti) -> Self {
        let (pipe_r, pipe_w) = pipe_pair();
        let (ctl_ours, ctl_theirs) = socket_pair();
        multi.add_client(pipe_r, ctl_theirs).unwrap();
        Self {
            pcm: pipe_w,
            ctl: ctl_ours,
        }
    }

    /// Connects a capture client; we keep the pipe's read end.
    pub fn capture(multi: &PcmMulti) -> Self {
        let (pipe_r, pipe_w) = pipe_pair();
        let (ctl_ours, ctl_theirs) = socket_pair();
        multi.add_client(pipe_w, ctl_theirs).unwrap();
        Self {
            pcm: pipe_r,
            ctl: ctl_ours,
        }
    }

    pub fn write_pcm(&self, data: &[u8]) -> io::Result<usize> {
        raw_write(self.pcm.as_raw_fd(), data)
    }

    /// Writes the whole buffer, waiting out transient back-pressure.
    pub fn write_pcm_all(&self, data: &[u8]) {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut offset = 0;
        while offset < data.len() {
            match self.write_pcm(&data[offset..]) {
                Ok(n) => offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    assert!(Instant::now() < deadline, "pcm pipe stayed full");
                    std::thread::sleep(Duration::from_millis(2));
                }
                Err(e) => panic!("pcm write failed: {e}"),
            }
        }
    }

    pub fn read_pcm(&self, buf: &mut [u8]) -> io::Result<usize> {
        raw_read(self.pcm.as_raw_fd(), buf)
    }

    pub fn command(&self, command: &str) {
        let n = raw_write(self.ctl.as_raw_fd(), command.as_bytes()).unwrap();
        assert_eq!(n, command.len());
    }

    pub fn try_reply(&self) -> Option<String> {
        let mut buf = [0u8; 16];
        match raw_read(self.ctl.as_raw_fd(), &mut buf) {
            Ok(n) if n > 0 => Some(String::from_utf8_lossy(&buf[..n]).into_owned()),
            _ => None,
        }
    }

    pub fn wait_reply(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(reply) = self.try_reply() {
                return Some(reply);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
