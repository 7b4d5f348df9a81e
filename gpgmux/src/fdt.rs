//! The file-descriptor table.
//!
//! A process-wide registry associating every pipe or socket used by an
//! in-flight operation with its owning context (by serial number), an
//! I/O callback and the idle → active → done lifecycle.  The wait
//! loops select over snapshots of this table and dispatch ready
//! callbacks through it.
//!
//! Lock discipline: one mutex serialises all structural changes;
//! callbacks always run outside the lock.  An entry may only outlive a
//! lock release while its slot is pinned, either by `closing` (a close
//! notify handler is running) or by `io_cb_running`; pinned slots are
//! never reused, which is what makes the index stable across the
//! release.

use std::os::unix::io::RawFd;
use std::sync::Mutex;

use bitflags::bitflags;
use log::{debug, trace, warn};
use once_cell::sync::Lazy;

use crate::context;
use crate::error::{Error, Result};
use crate::sys::{self, IoSelectFd};
use crate::wait::{self, Event};

/// The table is grown in fixed chunks; a linear scan is fine for the
/// handful of descriptors a context keeps open.
const GROW_CHUNK: usize = 64;

bitflags! {
    /// Selectors for [`get_fds`] and [`get_count`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdtFlags: u32 {
        const ACTIVE = 1;
        const DONE = 2;
        const FOR_READ = 4;
        const FOR_WRITE = 8;
        const SIGNALED = 16;
        const NOT_SIGNALED = 32;
        /// Additionally clear each entry's signaled bit while copying
        /// it out.
        const CLEAR = 64;
        const NOT_DONE = 128;
    }
}

/// Result of one I/O callback invocation: `Ok(None)` on success,
/// `Ok(Some(err))` for an operational error that ends the command but
/// leaves the session usable, `Err` for a session-fatal error.
pub type IoCbOutcome = Result<Option<Error>>;

pub type IoCb = Box<dyn FnMut(RawFd) -> IoCbOutcome + Send>;

type CloseNotify = Box<dyn FnOnce(RawFd) + Send>;

#[derive(Debug, Clone, Copy)]
pub enum Direction {
    Write = 0,
    Read = 1,
}

#[derive(Default)]
struct Entry {
    /// -1 marks a free slot.
    fd: RawFd,
    /// Serial of the owning context; 0 when unowned.
    owner: u64,
    active: bool,
    done: bool,
    for_read: bool,
    for_write: bool,
    signaled: bool,
    /// A close handler is running; the slot index is pinned.
    closing: bool,
    /// The I/O callback is running; the slot index is pinned.
    io_cb_running: bool,
    io_cb: Option<IoCb>,
    done_status: Option<Error>,
    done_op_err: Option<Error>,
    close_notify: Option<CloseNotify>,
}

impl Entry {
    fn free() -> Entry {
        Entry { fd: -1, ..Default::default() }
    }
}

struct Table {
    entries: Vec<Entry>,
    /// Completion records whose entries are already gone.  A done
    /// status must survive the teardown of the fds that carried it so
    /// that the wait loops can still harvest the completed context.
    pending_done: Vec<(u64, Option<Error>, Option<Error>)>,
}

static FDT: Lazy<Mutex<Table>> =
    Lazy::new(|| Mutex::new(Table { entries: Vec::new(), pending_done: Vec::new() }));

fn find(entries: &[Entry], fd: RawFd) -> Option<usize> {
    entries.iter().position(|e| e.fd == fd)
}

/// Insert FD as an idle entry.  `DupKey` if the fd is already present.
pub fn insert(fd: RawFd) -> Result<()> {
    if fd < 0 {
        return Err(Error::InvValue);
    }
    let mut table = FDT.lock().unwrap();
    if find(&table.entries, fd).is_some() {
        return Err(Error::DupKey);
    }
    let idx = match table.entries.iter().position(|e| e.fd == -1 && !e.closing) {
        Some(idx) => idx,
        None => {
            let idx = table.entries.len();
            table.entries.extend((0..GROW_CHUNK).map(|_| Entry::free()));
            idx
        }
    };
    table.entries[idx] = Entry { fd, ..Entry::free() };
    trace!("fdt: insert fd={} at slot {}", fd, idx);
    Ok(())
}

/// Attach a close-notify handler to FD.  `DupValue` if one is present.
pub fn add_close_notify<F>(fd: RawFd, handler: F) -> Result<()>
where
    F: FnOnce(RawFd) + Send + 'static,
{
    if fd < 0 {
        return Err(Error::InvValue);
    }
    let mut table = FDT.lock().unwrap();
    let idx = find(&table.entries, fd).ok_or(Error::NoKey)?;
    let entry = &mut table.entries[idx];
    if entry.close_notify.is_some() {
        return Err(Error::DupValue);
    }
    entry.close_notify = Some(Box::new(handler));
    Ok(())
}

/// Set or remove the I/O callback of FD.
///
/// Setting requires the slot to have no callback yet (`DupValue`
/// otherwise) and records OWNER and the direction of interest.
/// Removal is requested with `cb` of `None` and cross-checks OWNER.
pub fn set_io_cb(fd: RawFd, owner: u64, direction: Direction, cb: Option<IoCb>) -> Result<()> {
    if fd < 0 || owner == 0 {
        return Err(Error::InvValue);
    }
    let mut table = FDT.lock().unwrap();
    match cb {
        Some(cb) => {
            let idx = find(&table.entries, fd).ok_or(Error::NoKey)?;
            let entry = &mut table.entries[idx];
            if entry.io_cb.is_some() || entry.io_cb_running {
                return Err(Error::DupValue);
            }
            entry.owner = owner;
            entry.for_read = matches!(direction, Direction::Read);
            entry.for_write = matches!(direction, Direction::Write);
            entry.signaled = false;
            entry.io_cb = Some(cb);
            trace!("fdt: io cb set for fd={} ctx={} dir={:?}", fd, owner, direction);
        }
        None => {
            let idx = table
                .entries
                .iter()
                .position(|e| e.fd == fd && e.owner == owner)
                .ok_or(Error::NoKey)?;
            let entry = &mut table.entries[idx];
            entry.for_read = false;
            entry.for_write = false;
            entry.signaled = false;
            entry.io_cb = None;
            entry.owner = 0;
            trace!("fdt: io cb removed for fd={} ctx={}", fd, owner);
        }
    }
    Ok(())
}

/// Flip all of OWNER's registered entries from idle to active.
pub fn set_active(owner: u64) -> Result<()> {
    if owner == 0 {
        return Err(Error::InvValue);
    }
    let mut table = FDT.lock().unwrap();
    for entry in &mut table.entries {
        if entry.fd != -1 && entry.owner == owner && (entry.io_cb.is_some() || entry.io_cb_running)
        {
            entry.active = true;
            entry.done = false;
        }
    }
    Ok(())
}

/// Flip OWNER's active entries to done and record the status pair.  If
/// the owner has no entries left (they were torn down before the
/// completion was delivered), the record is queued so that
/// [`get_done`] still reports it.
pub fn set_done(owner: u64, status: Option<Error>, op_err: Option<Error>) -> Result<()> {
    if owner == 0 {
        return Err(Error::InvValue);
    }
    let mut table = FDT.lock().unwrap();
    let mut hits = 0;
    for entry in &mut table.entries {
        if entry.fd != -1 && entry.owner == owner && entry.active {
            entry.active = false;
            entry.done = true;
            entry.done_status = status;
            entry.done_op_err = op_err;
            hits += 1;
        }
    }
    if hits == 0 && !table.pending_done.iter().any(|(o, _, _)| *o == owner) {
        table.pending_done.push((owner, status, op_err));
    }
    debug!("fdt: ctx={} done (entries={}, status={:?})", owner, hits, status);
    Ok(())
}

/// Copy the signaled bits of a select result into the table.  Signaled
/// bits are never cleared here; consumers clear them.
pub fn set_signaled(fds: &[IoSelectFd]) {
    if fds.is_empty() {
        return;
    }
    let mut count = 0;
    let mut table = FDT.lock().unwrap();
    for entry in &mut table.entries {
        if entry.fd == -1 {
            continue;
        }
        if let Some(slot) = fds.iter().find(|s| s.fd == entry.fd) {
            if slot.signaled && !entry.signaled {
                entry.signaled = true;
                count += 1;
            }
        }
    }
    trace!("fdt: {} fds newly signaled", count);
}

fn matches_flags(entry: &Entry, flags: FdtFlags) -> bool {
    if flags.contains(FdtFlags::ACTIVE) && !entry.active {
        return false;
    }
    if flags.contains(FdtFlags::DONE) && !entry.done {
        return false;
    }
    if flags.contains(FdtFlags::NOT_DONE) && entry.done {
        return false;
    }
    if flags.contains(FdtFlags::FOR_READ) && !entry.for_read {
        return false;
    }
    if flags.contains(FdtFlags::FOR_WRITE) && !entry.for_write {
        return false;
    }
    if flags.contains(FdtFlags::SIGNALED) && !entry.signaled {
        return false;
    }
    if flags.contains(FdtFlags::NOT_SIGNALED) && entry.signaled {
        return false;
    }
    true
}

/// Snapshot the fds of OWNER (0 = all) matching FLAGS as a select set.
/// Entries currently running a callback or closing are skipped.
pub fn get_fds(owner: u64, flags: FdtFlags) -> Vec<IoSelectFd> {
    let mut table = FDT.lock().unwrap();
    let mut out = Vec::new();
    for entry in &mut table.entries {
        if entry.fd == -1 || (owner != 0 && entry.owner != owner) {
            continue;
        }
        if !matches_flags(entry, flags) {
            continue;
        }
        if entry.io_cb_running || entry.closing {
            continue;
        }
        out.push(IoSelectFd {
            fd: entry.fd,
            for_read: entry.for_read,
            for_write: entry.for_write,
            signaled: if flags.contains(FdtFlags::CLEAR) { false } else { entry.signaled },
        });
        if flags.contains(FdtFlags::CLEAR) {
            entry.signaled = false;
        }
    }
    out
}

/// Count OWNER's entries matching FLAGS (0 = all owners).
pub fn get_count(owner: u64, flags: FdtFlags) -> usize {
    let table = FDT.lock().unwrap();
    table
        .entries
        .iter()
        .filter(|e| e.fd != -1 && (owner == 0 || e.owner == owner))
        .filter(|e| matches_flags(e, flags))
        .count()
}

/// Outcome of a [`run_io_cbs`] sweep.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Serial of the last context whose callback ran.
    pub serial: u64,
    /// Session-fatal error; the owning context has been cancelled.
    pub err: Option<Error>,
    /// Operational error; the current command was cancelled but the
    /// session survives.
    pub op_err: Option<Error>,
}

/// Run the signaled callbacks of OWNER (0 = any), one at a time, each
/// outside the table lock.  A callback error cancels the owning
/// session; an operational error cancels only the command.  When a
/// context runs out of registered callbacks a DONE event is delivered
/// for it.
pub fn run_io_cbs(owner: u64) -> RunReport {
    let mut report = RunReport::default();

    loop {
        // Pick the next signaled entry and pin it.
        let (fd, serial, mut cb) = {
            let mut table = FDT.lock().unwrap();
            let found = table.entries.iter_mut().find(|e| {
                e.fd != -1
                    && (owner == 0 || e.owner == owner)
                    && e.signaled
                    && e.io_cb.is_some()
                    && !e.closing
                    && !e.io_cb_running
            });
            match found {
                Some(entry) => {
                    entry.signaled = false;
                    entry.io_cb_running = true;
                    (entry.fd, entry.owner, entry.io_cb.take().unwrap())
                }
                None => break,
            }
        };
        report.serial = serial;

        // Dispatch with the lock released.  A soft cancel is observed
        // here, before the callback gets a chance to run.
        let outcome = match context::get_ctx(serial) {
            None => {
                warn!("fdt: ctx={} vanished; dropping callback for fd={}", serial, fd);
                let mut table = FDT.lock().unwrap();
                if let Some(idx) = find(&table.entries, fd) {
                    table.entries[idx].io_cb_running = false;
                }
                continue;
            }
            Some(ctx) if ctx.is_canceled() => Err(Error::Canceled),
            Some(_) => cb(fd),
        };
        if let Err(err) = &outcome {
            debug!("fdt: io cb for fd={} failed: {}", fd, err);
        }

        // Unpin, restore the callback unless it was removed from
        // within, and count what is left for this context.
        let cb_count = {
            let mut table = FDT.lock().unwrap();
            if let Some(idx) = find(&table.entries, fd) {
                let entry = &mut table.entries[idx];
                entry.io_cb_running = false;
                if entry.owner == serial && entry.io_cb.is_none() {
                    entry.io_cb = Some(cb);
                }
            }
            table
                .entries
                .iter()
                .filter(|e| e.fd != -1 && e.owner == serial)
                .count()
        };

        match outcome {
            Err(err) => {
                let _ = context::cancel_with_err(serial, Some(err), None);
                report.err = Some(err);
                return report;
            }
            Ok(Some(op_err)) => {
                // This relies on operational errors being reported
                // only after the command has really finished;
                // otherwise pending I/O would spill into the next
                // command on the session.
                let _ = context::cancel_with_err(serial, None, Some(op_err));
                report.op_err = Some(op_err);
                return report;
            }
            Ok(None) => {
                if cb_count == 0 {
                    if let Some(ctx) = context::get_ctx(serial) {
                        wait::io_event(&ctx, &Event::Done { err: None, op_err: None });
                    }
                }
            }
        }
    }
    report
}

/// Harvest a completed context: pop the first done record matching
/// OWNER (0 = any) and clear the done marks that carried it.  Returns
/// the serial and the recorded status pair.
pub fn get_done(owner: u64) -> Option<(u64, Option<Error>, Option<Error>)> {
    let mut table = FDT.lock().unwrap();

    let hit = table
        .entries
        .iter()
        .position(|e| e.fd != -1 && (owner == 0 || e.owner == owner) && e.done);
    if let Some(idx) = hit {
        let serial = table.entries[idx].owner;
        let status = table.entries[idx].done_status;
        let op_err = table.entries[idx].done_op_err;
        table.entries[idx].done = false;
        if owner != 0 {
            // All fds of one owner share the same status.
            for entry in &mut table.entries {
                if entry.fd != -1 && entry.owner == owner {
                    entry.done = false;
                }
            }
        }
        return Some((serial, status, op_err));
    }

    let idx = table
        .pending_done
        .iter()
        .position(|(o, _, _)| owner == 0 || *o == owner)?;
    let record = table.pending_done.remove(idx);
    Some(record)
}

/// Remove FD from the table, running its close-notify handler first.
/// While the handler runs the slot stays pinned; the handler may use
/// the table but must assume FD is already gone from it.
pub fn remove(fd: RawFd) -> Result<()> {
    if fd < 0 {
        return Err(Error::InvValue);
    }
    let handler = {
        let mut table = FDT.lock().unwrap();
        let idx = find(&table.entries, fd).ok_or(Error::NoKey)?;
        let owner = table.entries[idx].owner;
        trace!(
            "fdt: removing fd={} owner={} (closing={})",
            fd,
            owner,
            table.entries[idx].closing
        );
        if table.entries[idx].done {
            // Keep the completion record reachable for get_done.
            let record = (owner, table.entries[idx].done_status, table.entries[idx].done_op_err);
            table.entries[idx].done = false;
            if !table.pending_done.iter().any(|(o, _, _)| *o == owner) {
                table.pending_done.push(record);
            }
        }
        let entry = &mut table.entries[idx];
        let handler = entry.close_notify.take();
        if handler.is_some() {
            entry.closing = true;
        } else if !entry.closing {
            *entry = Entry::free();
        }
        handler
    };

    if let Some(handler) = handler {
        handler(fd);
        let mut table = FDT.lock().unwrap();
        if let Some(idx) = find(&table.entries, fd) {
            table.entries[idx] = Entry::free();
        }
    }
    Ok(())
}

/// Close and remove every fd owned by SERIAL, running both the table's
/// close-notify handlers and the system level ones.  Used by the
/// cancellation path.
pub fn close_owner_fds(serial: u64) {
    loop {
        let fd = {
            let table = FDT.lock().unwrap();
            table
                .entries
                .iter()
                .find(|e| e.fd != -1 && e.owner == serial && !e.closing)
                .map(|e| e.fd)
        };
        let Some(fd) = fd else { break };
        if let Err(err) = remove(fd) {
            warn!("fdt: removing fd={} of ctx={} failed: {}", fd, serial, err);
        }
        if let Err(err) = sys::close_fd(fd) {
            warn!("fdt: closing fd={} of ctx={} failed: {}", fd, serial, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn new_pipe() -> [RawFd; 2] {
        sys::pipe(1).unwrap()
    }

    #[test]
    fn insert_remove_insert_cycle() {
        let [r, w] = new_pipe();
        insert(r).unwrap();
        assert_eq!(insert(r), Err(Error::DupKey));
        remove(r).unwrap();
        insert(r).unwrap();
        remove(r).unwrap();
        assert_eq!(remove(r), Err(Error::NoKey));
        sys::close_fd(r).unwrap();
        sys::close_fd(w).unwrap();
    }

    #[test]
    fn io_cb_registration_rules() {
        let [r, w] = new_pipe();
        insert(r).unwrap();
        let owner = 7_700_001;
        set_io_cb(r, owner, Direction::Read, Some(Box::new(|_| Ok(None)))).unwrap();
        assert_eq!(
            set_io_cb(r, owner, Direction::Read, Some(Box::new(|_| Ok(None)))),
            Err(Error::DupValue)
        );
        // Wrong owner on removal is a cross-check failure.
        assert_eq!(set_io_cb(r, owner + 1, Direction::Read, None), Err(Error::NoKey));
        set_io_cb(r, owner, Direction::Read, None).unwrap();
        assert_eq!(set_io_cb(r, owner, Direction::Read, None), Err(Error::NoKey));
        remove(r).unwrap();
        sys::close_fd(r).unwrap();
        sys::close_fd(w).unwrap();
    }

    #[test]
    fn active_and_done_are_exclusive() {
        let [r, w] = new_pipe();
        insert(r).unwrap();
        let owner = 7_700_002;
        set_io_cb(r, owner, Direction::Read, Some(Box::new(|_| Ok(None)))).unwrap();
        set_active(owner).unwrap();
        assert_eq!(get_count(owner, FdtFlags::ACTIVE), 1);
        assert_eq!(get_count(owner, FdtFlags::DONE), 0);
        set_done(owner, Some(Error::General), None).unwrap();
        assert_eq!(get_count(owner, FdtFlags::ACTIVE), 0);
        assert_eq!(get_count(owner, FdtFlags::DONE), 1);
        let (serial, status, op_err) = get_done(owner).unwrap();
        assert_eq!(serial, owner);
        assert_eq!(status, Some(Error::General));
        assert_eq!(op_err, None);
        assert!(get_done(owner).is_none());
        remove(r).unwrap();
        sys::close_fd(r).unwrap();
        sys::close_fd(w).unwrap();
    }

    #[test]
    fn done_survives_entry_removal() {
        let [r, w] = new_pipe();
        insert(r).unwrap();
        let owner = 7_700_003;
        set_io_cb(r, owner, Direction::Read, Some(Box::new(|_| Ok(None)))).unwrap();
        set_active(owner).unwrap();
        set_done(owner, Some(Error::Canceled), None).unwrap();
        remove(r).unwrap();
        let (serial, status, _) = get_done(owner).unwrap();
        assert_eq!(serial, owner);
        assert_eq!(status, Some(Error::Canceled));
        sys::close_fd(r).unwrap();
        sys::close_fd(w).unwrap();
    }

    #[test]
    fn done_without_entries_is_queued() {
        let owner = 7_700_004;
        set_done(owner, Some(Error::UnsupportedProtocol), None).unwrap();
        let (serial, status, _) = get_done(owner).unwrap();
        assert_eq!(serial, owner);
        assert_eq!(status, Some(Error::UnsupportedProtocol));
        assert!(get_done(owner).is_none());
    }

    #[test]
    fn directions_are_exclusive_in_snapshots() {
        let [r, w] = new_pipe();
        insert(r).unwrap();
        insert(w).unwrap();
        let owner = 7_700_005;
        set_io_cb(r, owner, Direction::Read, Some(Box::new(|_| Ok(None)))).unwrap();
        set_io_cb(w, owner, Direction::Write, Some(Box::new(|_| Ok(None)))).unwrap();
        let fds = get_fds(owner, FdtFlags::empty());
        assert_eq!(fds.len(), 2);
        for slot in &fds {
            assert!(slot.for_read != slot.for_write);
        }
        remove(r).unwrap();
        remove(w).unwrap();
        sys::close_fd(r).unwrap();
        sys::close_fd(w).unwrap();
    }

    #[test]
    fn close_notify_pins_the_slot() {
        let [r, w] = new_pipe();
        insert(r).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        add_close_notify(r, move |fd| {
            // Recursive removal of the same fd must be harmless; the
            // outer frame wins.
            assert_eq!(remove(fd), Ok(()));
            ran2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(add_close_notify(r, |_| {}), Err(Error::DupValue));
        remove(r).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(remove(r), Err(Error::NoKey));
        sys::close_fd(r).unwrap();
        sys::close_fd(w).unwrap();
    }

    #[test]
    fn signaled_bits_copied_and_cleared_on_demand() {
        let [r, w] = new_pipe();
        insert(r).unwrap();
        let owner = 7_700_006;
        set_io_cb(r, owner, Direction::Read, Some(Box::new(|_| Ok(None)))).unwrap();
        let mut sel = [IoSelectFd::read(r)];
        sel[0].signaled = true;
        set_signaled(&sel);
        assert_eq!(get_count(owner, FdtFlags::SIGNALED), 1);
        // Plain snapshot keeps the bit, CLEAR strips it.
        let fds = get_fds(owner, FdtFlags::SIGNALED);
        assert!(fds[0].signaled);
        assert_eq!(get_count(owner, FdtFlags::SIGNALED), 1);
        let fds = get_fds(owner, FdtFlags::CLEAR);
        assert!(!fds[0].signaled);
        assert_eq!(get_count(owner, FdtFlags::SIGNALED), 0);
        remove(r).unwrap();
        sys::close_fd(r).unwrap();
        sys::close_fd(w).unwrap();
    }
}
