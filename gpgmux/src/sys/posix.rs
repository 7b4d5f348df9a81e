//! POSIX implementation of the I/O primitives.
//!
//! All raw descriptors used with the backend engines go through this
//! module so that the close-notify bookkeeping stays accurate.  The
//! select is implemented over poll(2); the fixed 1 s default timeout
//! bounds how long a wait loop can stay blind to a cancellation.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::{Mutex, Once};

use bitflags::bitflags;
use log::{debug, trace, warn};
use once_cell::sync::Lazy;

use crate::error::{Error, Result};

/// Default select timeout in milliseconds.
pub const SELECT_TIMEOUT_MS: i32 = 1000;

static SUBSYSTEM_INIT: Once = Once::new();

/// One-time process setup: a SIGPIPE from an engine that went away
/// must not kill the host application, so the default disposition is
/// replaced with ignore.  An application that installed its own
/// handler is left alone.
pub fn io_subsystem_init() {
    SUBSYSTEM_INIT.call_once(|| unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(libc::SIGPIPE, std::ptr::null(), &mut act) == 0
            && act.sa_sigaction == libc::SIG_DFL
        {
            act.sa_sigaction = libc::SIG_IGN;
            libc::sigemptyset(&mut act.sa_mask);
            act.sa_flags = 0;
            libc::sigaction(libc::SIGPIPE, &act, std::ptr::null_mut());
        }
    });
}

/// One slot of a select set.
#[derive(Debug, Clone, Copy)]
pub struct IoSelectFd {
    pub fd: RawFd,
    pub for_read: bool,
    pub for_write: bool,
    pub signaled: bool,
}

impl IoSelectFd {
    pub fn read(fd: RawFd) -> Self {
        IoSelectFd { fd, for_read: true, for_write: false, signaled: false }
    }

    pub fn write(fd: RawFd) -> Self {
        IoSelectFd { fd, for_read: false, for_write: true, signaled: false }
    }
}

type CloseNotify = Box<dyn FnOnce(RawFd) + Send>;

/// Handlers to run just before a descriptor is closed.  Linear table,
/// grown on demand; a slot is keyed by the fd value.
static NOTIFY_TABLE: Lazy<Mutex<Vec<(RawFd, Option<CloseNotify>)>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

/// Create a pipe.  `inherit_idx` selects the end that stays inheritable
/// for a child process (0 = read end, 1 = write end); the other end is
/// marked close-on-exec.  Returns `[read_fd, write_fd]`.
pub fn pipe(inherit_idx: usize) -> Result<[RawFd; 2]> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(Error::last_os_error());
    }
    let keep_open_end = fds[1 - inherit_idx];
    if unsafe { libc::fcntl(keep_open_end, libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
        let err = Error::last_os_error();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
        return Err(err);
    }
    trace!("pipe: read fd={} write fd={}", fds[0], fds[1]);
    Ok([fds[0], fds[1]])
}

/// Read up to the buffer size, retrying on EINTR.  May return short.
pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            trace!("read: fd={} n={}", fd, n);
            return Ok(n as usize);
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno != libc::EINTR {
            return Err(Error::Sys(errno));
        }
    }
}

/// Write up to the buffer size, retrying on EINTR.  May return short.
pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize> {
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            trace!("write: fd={} n={}", fd, n);
            return Ok(n as usize);
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno != libc::EINTR {
            return Err(Error::Sys(errno));
        }
    }
}

/// Register a close handler for FD.  Fails with `DupValue` if one is
/// already registered; handlers are one-shot.
pub fn set_close_notify<F>(fd: RawFd, handler: F) -> Result<()>
where
    F: FnOnce(RawFd) + Send + 'static,
{
    if fd < 0 {
        return Err(Error::InvValue);
    }
    let mut table = NOTIFY_TABLE.lock().unwrap();
    if table.iter().any(|(slot_fd, h)| *slot_fd == fd && h.is_some()) {
        return Err(Error::DupValue);
    }
    if let Some(slot) = table.iter_mut().find(|(_, h)| h.is_none()) {
        *slot = (fd, Some(Box::new(handler)));
    } else {
        table.push((fd, Some(Box::new(handler))));
    }
    Ok(())
}

/// Close FD, invoking its close-notify handler first.  The handler runs
/// after the table entry has been removed, so it may register a new
/// handler or close other descriptors but must not touch FD itself.
pub fn close_fd(fd: RawFd) -> Result<()> {
    if fd < 0 {
        return Err(Error::InvValue);
    }
    let handler = {
        let mut table = NOTIFY_TABLE.lock().unwrap();
        table
            .iter_mut()
            .find(|(slot_fd, h)| *slot_fd == fd && h.is_some())
            .and_then(|slot| {
                slot.0 = -1;
                slot.1.take()
            })
    };
    if let Some(handler) = handler {
        debug!("close: fd={} running close handler", fd);
        handler(fd);
    }
    if unsafe { libc::close(fd) } != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Switch FD to non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags == -1 {
        return Err(Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Poll the given set.  Returns the number of slots whose `signaled`
/// flag was set, 0 on timeout or when there was nothing to poll.  The
/// timeout is the fixed default, or zero with `nonblock`.
pub fn select(fds: &mut [IoSelectFd], nonblock: bool) -> Result<usize> {
    let timeout = if nonblock { 0 } else { SELECT_TIMEOUT_MS };

    let mut poll_fds: Vec<libc::pollfd> = Vec::with_capacity(fds.len());
    for slot in fds.iter_mut() {
        slot.signaled = false;
        if slot.fd < 0 || (!slot.for_read && !slot.for_write) {
            continue;
        }
        let mut events: libc::c_short = 0;
        if slot.for_read {
            events |= libc::POLLIN;
        }
        if slot.for_write {
            events |= libc::POLLOUT;
        }
        poll_fds.push(libc::pollfd { fd: slot.fd, events, revents: 0 });
    }
    if poll_fds.is_empty() {
        return Ok(0);
    }

    let count = loop {
        let n = unsafe {
            libc::poll(poll_fds.as_mut_ptr(), poll_fds.len() as libc::nfds_t, timeout)
        };
        if n >= 0 {
            break n;
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno != libc::EINTR && errno != libc::EAGAIN {
            return Err(Error::Sys(errno));
        }
    };

    let mut idx = 0;
    for slot in fds.iter_mut() {
        if slot.fd < 0 || (!slot.for_read && !slot.for_write) {
            continue;
        }
        let revents = poll_fds[idx].revents;
        idx += 1;
        let mut interesting: libc::c_short = 0;
        if slot.for_read {
            interesting |= libc::POLLIN | libc::POLLHUP;
        }
        if slot.for_write {
            interesting |= libc::POLLOUT;
        }
        if revents & interesting != 0 {
            slot.signaled = true;
        }
    }
    Ok(count as usize)
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpawnFlags: u32 {
        /// Do not connect the child to the terminal session.
        const DETACHED = 1;
        /// Child may take the foreground (only meaningful on platforms
        /// with a foreground window concept; accepted everywhere).
        const ALLOW_SET_FG = 2;
        /// Keep the parent's copies of the remapped fds open.
        const NO_CLOSE = 4;
    }
}

/// One fd remapping for spawn.  `dup_to` of -1 keeps the fd number;
/// `arg_loc` names the argv slot that should receive the child-side fd
/// number, used by platforms where fd numbers change across spawn (here
/// they do not, so `peer_name` is set to `fd` after a spawn).
#[derive(Debug, Clone, Copy)]
pub struct SpawnFd {
    pub fd: RawFd,
    pub dup_to: RawFd,
    pub peer_name: RawFd,
    pub arg_loc: usize,
}

impl SpawnFd {
    pub fn new(fd: RawFd, dup_to: RawFd) -> Self {
        SpawnFd { fd, dup_to, peer_name: -1, arg_loc: 0 }
    }
}

fn max_fds() -> libc::c_int {
    let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if limit > 0 && limit <= i32::MAX as libc::c_long {
        limit as libc::c_int
    } else {
        1024
    }
}

/// Wait for a child.  Returns `None` while the child is still running
/// in non-hanging mode.
pub struct WaitStatus {
    pub status: i32,
    pub signal: i32,
}

pub fn waitpid(pid: libc::pid_t, hang: bool) -> Option<WaitStatus> {
    let mut status: libc::c_int = 0;
    let flags = if hang { 0 } else { libc::WNOHANG };
    loop {
        let ret = unsafe { libc::waitpid(pid, &mut status, flags) };
        if ret == pid {
            let ws = if libc::WIFSIGNALED(status) {
                WaitStatus { status: 4, signal: libc::WTERMSIG(status) }
            } else if libc::WIFEXITED(status) {
                WaitStatus { status: libc::WEXITSTATUS(status), signal: 0 }
            } else {
                WaitStatus { status: 4, signal: 0 }
            };
            return Some(ws);
        }
        if ret == -1 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EINTR {
                continue;
            }
        }
        return None;
    }
}

/// Spawn PATH with ARGV.  The child only inherits the descriptors in
/// `fd_list`; each entry may be renumbered via `dup_to`, and stdin,
/// stdout and stderr are connected to /dev/null when not covered by the
/// list.  An intermediate fork reaps the child immediately so no zombie
/// is left behind; the spawned process is therefore detached and the
/// returned pid only identifies the spawn transaction.
///
/// Unless `NO_CLOSE` is given, the parent's copies of the listed fds
/// are closed (running their close-notify handlers) after the spawn.
pub fn spawn(
    path: &str,
    argv: &[&str],
    flags: SpawnFlags,
    fd_list: &mut [SpawnFd],
    atfork: Option<&(dyn Fn() + Sync)>,
) -> Result<libc::pid_t> {
    debug!("spawn: path={} argv={:?} flags={:?}", path, argv, flags);
    for (i, item) in fd_list.iter().enumerate() {
        trace!("spawn: fd[{}] = {} -> {}", i, item.fd, item.dup_to);
    }

    let c_path = CString::new(path).map_err(|_| Error::InvValue)?;
    let c_args: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(*a).map_err(|_| Error::InvValue))
        .collect::<Result<_>>()?;
    let mut arg_ptrs: Vec<*const libc::c_char> = c_args.iter().map(|a| a.as_ptr()).collect();
    arg_ptrs.push(std::ptr::null());
    let devnull = CString::new("/dev/null").unwrap();
    let highest = max_fds();

    let pid = unsafe { libc::fork() };
    if pid == -1 {
        return Err(Error::last_os_error());
    }

    if pid == 0 {
        // Intermediate child; forks again so the grandchild is reaped
        // by init rather than becoming our zombie.
        unsafe {
            let child = libc::fork();
            if child == 0 {
                if let Some(hook) = atfork {
                    hook();
                }

                // Close everything that is not in the inherit list.
                for fd in 0..highest {
                    if !fd_list.iter().any(|item| item.fd == fd) {
                        libc::close(fd);
                    }
                }

                let mut seen_stdin = false;
                let mut seen_stdout = false;
                let mut seen_stderr = false;
                for item in fd_list.iter() {
                    let child_fd = if item.dup_to != -1 { item.dup_to } else { item.fd };
                    seen_stdin |= child_fd == 0;
                    seen_stdout |= child_fd == 1;
                    seen_stderr |= child_fd == 2;
                    if item.dup_to != -1 {
                        if libc::dup2(item.fd, item.dup_to) < 0 {
                            libc::_exit(8);
                        }
                        libc::close(item.fd);
                    }
                }

                if !seen_stdin || !seen_stdout || !seen_stderr {
                    let fd = libc::open(devnull.as_ptr(), libc::O_RDWR);
                    if fd == -1 {
                        libc::_exit(8);
                    }
                    if !seen_stdin && fd != 0 && libc::dup2(fd, 0) == -1 {
                        libc::_exit(8);
                    }
                    if !seen_stdout && fd != 1 && libc::dup2(fd, 1) == -1 {
                        libc::_exit(8);
                    }
                    if !seen_stderr && fd != 2 && libc::dup2(fd, 2) == -1 {
                        libc::_exit(8);
                    }
                    if fd > 2 {
                        libc::close(fd);
                    }
                }

                libc::execv(c_path.as_ptr(), arg_ptrs.as_ptr());
                libc::_exit(8);
            }
            libc::_exit(if child == -1 { 1 } else { 0 });
        }
    }

    // Parent: reap the intermediate child and check that the second
    // fork succeeded.
    match waitpid(pid, true) {
        Some(ws) if ws.status == 0 => {}
        other => {
            warn!(
                "spawn: intermediate child failed (status {:?})",
                other.map(|w| w.status)
            );
            return Err(Error::General);
        }
    }

    for item in fd_list.iter_mut() {
        if !flags.contains(SpawnFlags::NO_CLOSE) {
            let _ = close_fd(item.fd);
        }
        // No fd renumbering across a POSIX spawn.
        item.peer_name = item.fd;
    }

    Ok(pid)
}
