//! Control pipe plumbing.
//!
//! The worker gets two descriptors beyond its stdio: fd 3 is the read end of
//! the host → worker pipe, fd 4 the write end of the worker → host pipe.
//! Every end is created close-on-exec; only the copies placed on fds 3/4 in
//! the child survive exec, so the worker never holds a host-side end (it
//! would otherwise never observe EOF when the host goes away).
//!
//! ## Safety contracts
//!
//! - The `pre_exec` hook runs between fork and exec and only calls
//!   async-signal-safe functions (fcntl, dup2, close).
//! - Raw fds captured by the hook stay open in the parent until the child has
//!   exited, because `WorkerEnds` is held by the supervisor until then.
//! - The worker side takes ownership of fds 3/4 exactly once, at startup.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::unistd::pipe;
use tokio::net::unix::pipe::{Receiver, Sender};
use tokio::process::Command;

/// Descriptor the worker reads requests from.
pub const WORKER_READ_FD: RawFd = 3;
/// Descriptor the worker writes responses to.
pub const WORKER_WRITE_FD: RawFd = 4;

/// Lowest fd the hook parks ends on before placing them, clear of 3 and 4.
const PARK_FD_FLOOR: RawFd = 10;

/// Host-side ends, owned by the read and write loops.
pub struct HostEnds {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

/// Worker-side ends as seen from the parent. Dropped once the worker exits.
pub struct WorkerEnds {
    read: OwnedFd,
    write: OwnedFd,
}

pub struct ControlPipes {
    host: HostEnds,
    worker: WorkerEnds,
}

impl ControlPipes {
    pub fn create() -> io::Result<Self> {
        let (worker_read, host_write) = cloexec_pipe()?;
        let (host_read, worker_write) = cloexec_pipe()?;

        tracing::trace!(
            host_read = host_read.as_raw_fd(),
            host_write = host_write.as_raw_fd(),
            worker_read = worker_read.as_raw_fd(),
            worker_write = worker_write.as_raw_fd(),
            "Created control pipes"
        );

        Ok(Self {
            host: HostEnds {
                read: host_read,
                write: host_write,
            },
            worker: WorkerEnds {
                read: worker_read,
                write: worker_write,
            },
        })
    }

    /// Arrange for the worker ends to land on fds 3 and 4 in the child.
    pub fn install(&self, command: &mut Command) {
        let read_fd = self.worker.read.as_raw_fd();
        let write_fd = self.worker.write.as_raw_fd();

        // Safety: see module-level contracts.
        unsafe {
            command.pre_exec(move || place_worker_fds(read_fd, write_fd));
        }
    }

    pub fn split(self) -> (HostEnds, WorkerEnds) {
        (self.host, self.worker)
    }
}

impl HostEnds {
    /// Register both ends with the runtime. Must run inside a Tokio runtime.
    pub fn into_async(self) -> io::Result<(Receiver, Sender)> {
        let receiver = Receiver::from_owned_fd(self.read)?;
        let sender = Sender::from_owned_fd(self.write)?;
        Ok((receiver, sender))
    }
}

impl Drop for WorkerEnds {
    fn drop(&mut self) {
        tracing::trace!(
            read = self.read.as_raw_fd(),
            write = self.write.as_raw_fd(),
            "Releasing worker pipe ends"
        );
    }
}

fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = pipe().map_err(|e| io::Error::other(format!("pipe failed: {}", e)))?;
    for fd in [&read, &write] {
        // Safety: fd is a valid descriptor owned by this function.
        let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok((read, write))
}

/// Runs in the forked child. Parks both ends above the target slots first so
/// that an end already sitting on fd 3 or 4 cannot be clobbered by the other.
fn place_worker_fds(read_fd: RawFd, write_fd: RawFd) -> io::Result<()> {
    // Safety: only async-signal-safe libc calls on descriptors inherited from
    // the parent.
    unsafe {
        let parked_read = libc::fcntl(read_fd, libc::F_DUPFD, PARK_FD_FLOOR);
        if parked_read < 0 {
            return Err(io::Error::last_os_error());
        }
        let parked_write = libc::fcntl(write_fd, libc::F_DUPFD, PARK_FD_FLOOR);
        if parked_write < 0 {
            return Err(io::Error::last_os_error());
        }

        // dup2 clears close-on-exec on the new descriptor.
        if libc::dup2(parked_read, WORKER_READ_FD) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::dup2(parked_write, WORKER_WRITE_FD) < 0 {
            return Err(io::Error::last_os_error());
        }

        libc::close(parked_read);
        libc::close(parked_write);
    }
    Ok(())
}

/// Worker side: take ownership of the inherited control descriptors.
///
/// Call once, at worker startup, before anything else can claim fds 3/4.
pub fn open_inherited() -> io::Result<(Receiver, Sender)> {
    // Safety: the host placed pipe ends on these descriptors before exec and
    // nothing else in this process owns them.
    let read = unsafe { OwnedFd::from_raw_fd(WORKER_READ_FD) };
    let write = unsafe { OwnedFd::from_raw_fd(WORKER_WRITE_FD) };

    let receiver = Receiver::from_owned_fd(read)?;
    let sender = Sender::from_owned_fd(write)?;
    Ok((receiver, sender))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_cloexec(fd: &OwnedFd) -> bool {
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
        flags >= 0 && flags & libc::FD_CLOEXEC != 0
    }

    #[test]
    fn all_ends_are_close_on_exec() {
        let pipes = ControlPipes::create().unwrap();
        let (host, worker) = pipes.split();

        assert!(is_cloexec(&host.read));
        assert!(is_cloexec(&host.write));
        assert!(is_cloexec(&worker.read));
        assert!(is_cloexec(&worker.write));
    }

    #[tokio::test]
    async fn host_ends_are_connected_to_worker_ends() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let pipes = ControlPipes::create().unwrap();
        let (host, worker) = pipes.split();
        let (mut host_rx, mut host_tx) = host.into_async().unwrap();

        let worker_rx = Receiver::from_owned_fd(worker.read.try_clone().unwrap()).unwrap();
        let worker_tx = Sender::from_owned_fd(worker.write.try_clone().unwrap()).unwrap();

        host_tx.write_all(b"ping\n").await.unwrap();
        let mut buf = [0u8; 5];
        let mut worker_rx = worker_rx;
        worker_rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping\n");

        let mut worker_tx = worker_tx;
        worker_tx.write_all(b"pong\n").await.unwrap();
        host_rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong\n");

        drop(worker);
    }
}
