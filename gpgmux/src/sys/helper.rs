//! Ring buffered reader and writer helpers.
//!
//! Some descriptors cannot sit in a poll set (on platforms whose
//! anonymous pipes are not pollable, and for callers that must keep
//! draining data that arrives after the descriptor was logically
//! closed).  A helper owns a background thread that shuttles bytes
//! between the descriptor and a small ring buffer; consumers interact
//! only with the ring, under a mutex with data/space condition
//! variables.
//!
//! Ownership of the descriptor is shared through a refcounted holder:
//! the helper thread keeps one reference and releases it on exit, so
//! the descriptor outlives an early drop of the handle until the thread
//! has observed the stop request.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::sys::posix;

const BUF_SIZE: usize = 4096;

struct OwnedRaw(RawFd);

impl Drop for OwnedRaw {
    fn drop(&mut self) {
        if self.0 >= 0 {
            let _ = unsafe { libc::close(self.0) };
        }
    }
}

/// Refcounted descriptor holder.  The descriptor is closed when the
/// last clone is dropped.
#[derive(Clone)]
pub struct FdHolder(Arc<OwnedRaw>);

impl FdHolder {
    pub fn new(fd: RawFd) -> Self {
        FdHolder(Arc::new(OwnedRaw(fd)))
    }

    pub fn raw(&self) -> RawFd {
        self.0 .0
    }
}

struct Ring {
    buf: [u8; BUF_SIZE],
    readpos: usize,
    writepos: usize,
    stop_me: bool,
    eof: bool,
    error: Option<i32>,
}

impl Ring {
    fn new() -> Self {
        Ring { buf: [0; BUF_SIZE], readpos: 0, writepos: 0, stop_me: false, eof: false, error: None }
    }

    fn is_empty(&self) -> bool {
        self.readpos == self.writepos
    }

    fn is_full(&self) -> bool {
        (self.writepos + 1) % BUF_SIZE == self.readpos
    }
}

struct Shared {
    fd: FdHolder,
    ring: Mutex<Ring>,
    have_data: Condvar,
    have_space: Condvar,
}

/// Background reader filling a ring from a descriptor.
pub struct Reader {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Reader {
    pub fn new(fd: FdHolder) -> Reader {
        let shared = Arc::new(Shared {
            fd,
            ring: Mutex::new(Ring::new()),
            have_data: Condvar::new(),
            have_space: Condvar::new(),
        });
        let worker = shared.clone();
        let thread = thread::spawn(move || reader_main(worker));
        Reader { shared, thread: Some(thread) }
    }

    /// Copy buffered bytes out of the ring.  Returns 0 at end of file,
    /// EAGAIN while the ring is empty but the stream still open.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut ring = self.shared.ring.lock().unwrap();
        if ring.is_empty() {
            if ring.eof {
                return Ok(0);
            }
            if let Some(errno) = ring.error {
                return Err(Error::Sys(errno));
            }
            return Err(Error::Sys(libc::EAGAIN));
        }
        let mut copied = 0;
        while copied < buf.len() && !ring.is_empty() {
            let readpos = ring.readpos;
            buf[copied] = ring.buf[readpos];
            ring.readpos = (readpos + 1) % BUF_SIZE;
            copied += 1;
        }
        self.shared.have_space.notify_one();
        Ok(copied)
    }

    /// Block until data, end of file, or an error is available, or the
    /// timeout expires.  Returns whether a read would make progress.
    pub fn wait_data(&self, timeout: Duration) -> bool {
        let ring = self.shared.ring.lock().unwrap();
        let (ring, _) = self
            .shared
            .have_data
            .wait_timeout_while(ring, timeout, |r| {
                r.is_empty() && !r.eof && r.error.is_none()
            })
            .unwrap();
        !ring.is_empty() || ring.eof || ring.error.is_some()
    }

    pub fn has_data(&self) -> bool {
        let ring = self.shared.ring.lock().unwrap();
        !ring.is_empty() || ring.eof || ring.error.is_some()
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        {
            let mut ring = self.shared.ring.lock().unwrap();
            ring.stop_me = true;
        }
        self.shared.have_space.notify_all();
        if let Some(handle) = self.thread.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
            // Otherwise the thread is parked in read(2); it exits on
            // its own once the peer closes and then drops its
            // descriptor reference.
        }
    }
}

fn reader_main(shared: Arc<Shared>) {
    let fd = shared.fd.raw();
    trace!("reader thread for fd={} ready", fd);
    let mut scratch = [0u8; BUF_SIZE];
    loop {
        let space = {
            let ring = shared.ring.lock().unwrap();
            let mut ring = shared
                .have_space
                .wait_while(ring, |r| r.is_full() && !r.stop_me)
                .unwrap();
            if ring.stop_me {
                break;
            }
            // Largest contiguous chunk we may read without overtaking
            // the consumer.
            let space =
                (ring.readpos + BUF_SIZE - ring.writepos - 1) % BUF_SIZE;
            space.min(BUF_SIZE - ring.writepos).min(scratch.len())
        };

        match posix::read(fd, &mut scratch[..space]) {
            Ok(0) => {
                let mut ring = shared.ring.lock().unwrap();
                ring.eof = true;
                shared.have_data.notify_all();
                break;
            }
            Ok(n) => {
                let mut ring = shared.ring.lock().unwrap();
                for &b in &scratch[..n] {
                    let writepos = ring.writepos;
                    ring.buf[writepos] = b;
                    ring.writepos = (writepos + 1) % BUF_SIZE;
                }
                shared.have_data.notify_all();
                if ring.stop_me {
                    break;
                }
            }
            Err(Error::Sys(errno)) => {
                let mut ring = shared.ring.lock().unwrap();
                ring.error = Some(errno);
                ring.eof = true;
                shared.have_data.notify_all();
                break;
            }
            Err(_) => break,
        }
    }
    debug!("reader thread for fd={} exiting", fd);
}

/// Background writer draining a ring into a descriptor.
pub struct Writer {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Writer {
    pub fn new(fd: FdHolder) -> Writer {
        let shared = Arc::new(Shared {
            fd,
            ring: Mutex::new(Ring::new()),
            have_data: Condvar::new(),
            have_space: Condvar::new(),
        });
        let worker = shared.clone();
        let thread = thread::spawn(move || writer_main(worker));
        Writer { shared, thread: Some(thread) }
    }

    /// Copy bytes into the ring.  EAGAIN when the ring is full; a prior
    /// write error from the helper thread is sticky.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut ring = self.shared.ring.lock().unwrap();
        if let Some(errno) = ring.error {
            return Err(Error::Sys(errno));
        }
        if ring.is_full() {
            return Err(Error::Sys(libc::EAGAIN));
        }
        let mut copied = 0;
        while copied < buf.len() && !ring.is_full() {
            let writepos = ring.writepos;
            ring.buf[writepos] = buf[copied];
            ring.writepos = (writepos + 1) % BUF_SIZE;
            copied += 1;
        }
        self.shared.have_data.notify_one();
        Ok(copied)
    }

    /// Block until the helper thread has drained the ring.
    pub fn wait_empty(&self, timeout: Duration) -> bool {
        let ring = self.shared.ring.lock().unwrap();
        let (ring, _) = self
            .shared
            .have_space
            .wait_timeout_while(ring, timeout, |r| !r.is_empty() && r.error.is_none())
            .unwrap();
        ring.is_empty()
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        {
            let mut ring = self.shared.ring.lock().unwrap();
            ring.stop_me = true;
        }
        self.shared.have_data.notify_all();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn writer_main(shared: Arc<Shared>) {
    let fd = shared.fd.raw();
    trace!("writer thread for fd={} ready", fd);
    let mut scratch = [0u8; BUF_SIZE];
    loop {
        let pending = {
            let ring = shared.ring.lock().unwrap();
            let ring = shared
                .have_data
                .wait_while(ring, |r| r.is_empty() && !r.stop_me)
                .unwrap();
            if ring.is_empty() {
                // Stop requested and nothing left to flush.
                break;
            }
            let mut n = 0;
            let mut pos = ring.readpos;
            while pos != ring.writepos && n < scratch.len() {
                scratch[n] = ring.buf[pos];
                pos = (pos + 1) % BUF_SIZE;
                n += 1;
            }
            n
        };

        match posix::write(fd, &scratch[..pending]) {
            Ok(n) => {
                let mut ring = shared.ring.lock().unwrap();
                ring.readpos = (ring.readpos + n) % BUF_SIZE;
                shared.have_space.notify_all();
            }
            Err(Error::Sys(errno)) => {
                let mut ring = shared.ring.lock().unwrap();
                ring.error = Some(errno);
                shared.have_space.notify_all();
                break;
            }
            Err(_) => break,
        }
    }
    debug!("writer thread for fd={} exiting", fd);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_buffers_and_reports_eof() {
        let [r, w] = posix::pipe(1).unwrap();
        let reader = Reader::new(FdHolder::new(r));
        posix::write(w, b"hello").unwrap();
        assert!(reader.wait_data(Duration::from_secs(5)));
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(reader.read(&mut buf), Err(Error::Sys(libc::EAGAIN)));
        posix::close_fd(w).unwrap();
        assert!(reader.wait_data(Duration::from_secs(5)));
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn reader_survives_drop_and_drains_late_data() {
        let [r, w] = posix::pipe(1).unwrap();
        let holder = FdHolder::new(r);
        {
            let reader = Reader::new(holder.clone());
            posix::write(w, b"late").unwrap();
            assert!(reader.wait_data(Duration::from_secs(5)));
        }
        // The handle is gone but the holder still pins the fd.
        posix::close_fd(w).unwrap();
        drop(holder);
    }

    #[test]
    fn writer_flushes_ring_to_fd() {
        let [r, w] = posix::pipe(0).unwrap();
        let writer = Writer::new(FdHolder::new(w));
        assert_eq!(writer.write(b"payload").unwrap(), 7);
        assert!(writer.wait_empty(Duration::from_secs(5)));
        let mut buf = [0u8; 16];
        assert_eq!(posix::read(r, &mut buf).unwrap(), 7);
        assert_eq!(&buf[..7], b"payload");
        drop(writer);
        assert_eq!(posix::read(r, &mut buf).unwrap(), 0);
        posix::close_fd(r).unwrap();
    }

    #[test]
    fn ring_wraps_around() {
        let [r, w] = posix::pipe(0).unwrap();
        let writer = Writer::new(FdHolder::new(w));
        let chunk = [0xabu8; 1500];
        let mut sent = 0;
        let mut received = 0;
        let mut buf = [0u8; 4096];
        while sent < 3 * BUF_SIZE {
            match writer.write(&chunk) {
                Ok(n) => sent += n,
                Err(Error::Sys(e)) if e == libc::EAGAIN => {
                    received += posix::read(r, &mut buf).unwrap();
                }
                Err(e) => panic!("write failed: {e}"),
            }
        }
        assert!(writer.wait_empty(Duration::from_secs(5)));
        drop(writer);
        loop {
            match posix::read(r, &mut buf) {
                Ok(0) => break,
                Ok(n) => received += n,
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert_eq!(received, sent);
        posix::close_fd(r).unwrap();
    }
}
