//! Readiness reactor for descriptor and signal sources
//!
//! One `dispatch-reactor` thread polls every armed descriptor plus the read
//! end of a self-pipe. Registration changes and signal arrivals write a
//! byte to the pipe so the poll set is rebuilt.
//!
//! Descriptors are one-shot: a readiness event disarms the watch until the
//! source's handler returns and re-arms it, so a level-triggered descriptor
//! produces one delivery per handler run rather than a storm.
//!
//! Signals are counted in a static table by an async-signal-safe handler;
//! the reactor thread swaps the counts out and forwards them.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd;

use dispatch_core::{DispatchError, DispatchResult};

use super::SourceCore;
use crate::lock;

const MAX_SIGNAL: usize = 65;

static SIGNAL_COUNTS: [AtomicU64; MAX_SIGNAL] = [const { AtomicU64::new(0) }; MAX_SIGNAL];
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(signo: libc::c_int) {
    let saved = Errno::last_raw();
    if let Some(count) = usize::try_from(signo).ok().and_then(|s| SIGNAL_COUNTS.get(s)) {
        count.fetch_add(1, Ordering::Relaxed);
    }
    let fd = WAKE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = 1u8;
        // SAFETY: write(2) is async-signal-safe; the pipe outlives the process
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
    Errno::set_raw(saved);
}

/// Handle returned by registration, consumed by `deregister`
#[derive(Debug)]
pub(crate) enum OsRegistration {
    Fd(u64),
    Signal { signo: i32, token: u64 },
}

struct FdWatch {
    fd: RawFd,
    write: bool,
    armed: bool,
    source: Weak<SourceCore>,
}

struct SignalWatch {
    previous: SigAction,
    sources: HashMap<u64, Weak<SourceCore>>,
}

struct ReactorState {
    next_token: u64,
    fds: HashMap<u64, FdWatch>,
    signals: HashMap<i32, SignalWatch>,
}

pub(crate) struct Reactor {
    wake_read: OwnedFd,
    wake_write: OwnedFd,
    state: Mutex<ReactorState>,
}

fn os_err(op: &'static str, errno: Errno) -> DispatchError {
    DispatchError::Os {
        op,
        errno: errno as i32,
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> DispatchResult<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| os_err("fcntl", e))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| os_err("fcntl", e))?;
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|e| os_err("fcntl", e))?;
    Ok(())
}

fn validate_fd(fd: RawFd) -> DispatchResult<()> {
    if fd < 0 {
        return Err(DispatchError::InvalidDescriptor(fd));
    }
    match fcntl(fd, FcntlArg::F_GETFD) {
        Ok(_) => Ok(()),
        Err(Errno::EBADF) => Err(DispatchError::InvalidDescriptor(fd)),
        Err(e) => Err(os_err("fcntl", e)),
    }
}

/// Bytes available to read, 0 at EOF or when the ioctl is unsupported
fn readable_bytes(fd: RawFd) -> u64 {
    let mut n: libc::c_int = 0;
    // SAFETY: FIONREAD writes one c_int
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut n) };
    if rc < 0 {
        0
    } else {
        n.max(0) as u64
    }
}

impl Reactor {
    pub fn new() -> DispatchResult<Arc<Self>> {
        let (wake_read, wake_write) = unistd::pipe().map_err(|e| os_err("pipe", e))?;
        set_nonblocking_cloexec(wake_read.as_raw_fd())?;
        set_nonblocking_cloexec(wake_write.as_raw_fd())?;

        let reactor = Arc::new(Self {
            wake_read,
            wake_write,
            state: Mutex::new(ReactorState {
                next_token: 1,
                fds: HashMap::new(),
                signals: HashMap::new(),
            }),
        });
        WAKE_FD.store(reactor.wake_write.as_raw_fd(), Ordering::Release);

        let this = Arc::clone(&reactor);
        thread::Builder::new()
            .name("dispatch-reactor".into())
            .spawn(move || this.run())
            .map_err(|e| DispatchError::ThreadSpawn(e.to_string()))?;
        tracing::debug!("reactor thread started");
        Ok(reactor)
    }

    fn wake(&self) {
        // A full pipe already guarantees a wakeup
        let _ = unistd::write(&self.wake_write, &[1u8]);
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = unistd::read(self.wake_read.as_raw_fd(), &mut buf) {
            if n < buf.len() {
                break;
            }
        }
    }

    pub fn register_fd(
        &self,
        fd: RawFd,
        write: bool,
        source: Weak<SourceCore>,
    ) -> DispatchResult<OsRegistration> {
        validate_fd(fd)?;
        let token = {
            let mut st = lock(&self.state);
            let token = st.next_token;
            st.next_token += 1;
            st.fds.insert(
                token,
                FdWatch {
                    fd,
                    write,
                    armed: true,
                    source,
                },
            );
            token
        };
        self.wake();
        Ok(OsRegistration::Fd(token))
    }

    pub fn register_signal(
        &self,
        signo: i32,
        source: Weak<SourceCore>,
    ) -> DispatchResult<OsRegistration> {
        let signal = Signal::try_from(signo).map_err(|_| DispatchError::InvalidSignal(signo))?;
        if matches!(signal, Signal::SIGKILL | Signal::SIGSTOP) || signo as usize >= MAX_SIGNAL {
            return Err(DispatchError::InvalidSignal(signo));
        }

        let mut st = lock(&self.state);
        let token = st.next_token;
        st.next_token += 1;
        if let Some(watch) = st.signals.get_mut(&signo) {
            watch.sources.insert(token, source);
        } else {
            let action = SigAction::new(
                SigHandler::Handler(on_signal),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            // SAFETY: on_signal only touches atomics and write(2)
            let previous =
                unsafe { sigaction(signal, &action) }.map_err(|e| os_err("sigaction", e))?;
            SIGNAL_COUNTS[signo as usize].store(0, Ordering::Relaxed);
            let mut sources = HashMap::new();
            sources.insert(token, source);
            st.signals.insert(signo, SignalWatch { previous, sources });
            tracing::debug!(signo, "signal handler installed");
        }
        Ok(OsRegistration::Signal { signo, token })
    }

    /// Re-enable a descriptor watch after its handler ran
    pub fn rearm(&self, registration: &OsRegistration) {
        if let OsRegistration::Fd(token) = registration {
            let changed = {
                let mut st = lock(&self.state);
                match st.fds.get_mut(token) {
                    Some(watch) if !watch.armed => {
                        watch.armed = true;
                        true
                    }
                    _ => false,
                }
            };
            if changed {
                self.wake();
            }
        }
    }

    pub fn deregister(&self, registration: OsRegistration) {
        match registration {
            OsRegistration::Fd(token) => {
                lock(&self.state).fds.remove(&token);
                self.wake();
            }
            OsRegistration::Signal { signo, token } => {
                let mut st = lock(&self.state);
                let emptied = match st.signals.get_mut(&signo) {
                    Some(watch) => {
                        watch.sources.remove(&token);
                        watch.sources.is_empty()
                    }
                    None => false,
                };
                if !emptied {
                    return;
                }
                if let (Some(watch), Ok(signal)) = (st.signals.remove(&signo), Signal::try_from(signo)) {
                    // SAFETY: restores the action that was in place before us
                    if let Err(e) = unsafe { sigaction(signal, &watch.previous) } {
                        tracing::warn!(signo, error = %e, "failed to restore signal action");
                    }
                    tracing::debug!(signo, "signal handler removed");
                }
            }
        }
    }

    fn run(self: Arc<Self>) {
        let mut pollfds: Vec<libc::pollfd> = Vec::new();
        let mut tokens: Vec<u64> = Vec::new();
        loop {
            pollfds.clear();
            tokens.clear();
            pollfds.push(libc::pollfd {
                fd: self.wake_read.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            {
                let st = lock(&self.state);
                for (&token, watch) in st.fds.iter().filter(|(_, w)| w.armed) {
                    pollfds.push(libc::pollfd {
                        fd: watch.fd,
                        events: if watch.write { libc::POLLOUT } else { libc::POLLIN },
                        revents: 0,
                    });
                    tokens.push(token);
                }
            }

            // SAFETY: pollfds is a valid, initialized slice
            let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let errno = Errno::last();
                if errno != Errno::EINTR {
                    tracing::error!(error = %errno, "reactor poll failed");
                }
                continue;
            }

            if pollfds[0].revents != 0 {
                self.drain_wake();
            }

            let mut ready: Vec<(Weak<SourceCore>, u64)> = Vec::new();
            let mut signalled: Vec<(Weak<SourceCore>, u64)> = Vec::new();
            {
                let mut st = lock(&self.state);
                for (pfd, token) in pollfds[1..].iter().zip(&tokens) {
                    if pfd.revents == 0 {
                        continue;
                    }
                    if let Some(watch) = st.fds.get_mut(token) {
                        if !watch.armed {
                            continue;
                        }
                        watch.armed = false;
                        let count = if watch.write { 1 } else { readable_bytes(watch.fd) };
                        ready.push((watch.source.clone(), count));
                    }
                }
                for (&signo, watch) in &st.signals {
                    let count = SIGNAL_COUNTS[signo as usize].swap(0, Ordering::Relaxed);
                    if count > 0 {
                        signalled.extend(watch.sources.values().map(|s| (s.clone(), count)));
                    }
                }
            }

            for (source, count) in ready {
                if let Some(core) = source.upgrade() {
                    core.readiness(count);
                }
            }
            for (source, count) in signalled {
                if let Some(core) = source.upgrade() {
                    core.signal_fired(count);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_fd() {
        assert_eq!(validate_fd(-1), Err(DispatchError::InvalidDescriptor(-1)));
        let (r, _w) = unistd::pipe().unwrap();
        assert!(validate_fd(r.as_raw_fd()).is_ok());
        // Far above anything the test process opens
        assert_eq!(validate_fd(1 << 20), Err(DispatchError::InvalidDescriptor(1 << 20)));
    }

    #[test]
    fn test_readable_bytes() {
        let (r, w) = unistd::pipe().unwrap();
        assert_eq!(readable_bytes(r.as_raw_fd()), 0);
        unistd::write(&w, b"hello").unwrap();
        assert_eq!(readable_bytes(r.as_raw_fd()), 5);
    }
}
