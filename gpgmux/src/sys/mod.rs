//! Platform I/O: pipes, non-blocking reads and writes, the poll based
//! select, subprocess spawning with fd inheritance, and the ring
//! buffered helper threads for descriptors that cannot be polled.

mod helper;
mod posix;

pub use helper::{FdHolder, Reader, Writer};
pub use posix::{
    close_fd, io_subsystem_init, pipe, read, select, set_close_notify, set_nonblocking, spawn,
    waitpid, write, IoSelectFd, SpawnFd, SpawnFlags, WaitStatus, SELECT_TIMEOUT_MS,
};
