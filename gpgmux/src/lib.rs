//! gpgmux drives OpenPGP and S/MIME backend engines on behalf of an
//! application.  It hides the pipe-level protocol with those helpers
//! behind contexts, keys and typed operation results, and supports
//! both blocking calls and an event-driven asynchronous mode.
//!
//! The crate is the concurrency and I/O substrate of that model: the
//! process-wide fd table, the wait loops layered over it, the context
//! lifecycle with its per-operation data multiplex, the status-line
//! parsers every operation shares, and the platform I/O the engines
//! run on.  The engine drivers themselves (command line construction,
//! wire protocols) live behind the [`engine::Engine`] trait.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod fdt;
pub mod key;
pub mod notation;
pub mod ops;
pub mod status;
pub mod sys;
pub mod types;
pub mod util;
pub mod wait;

pub use context::{Context, StartMode};
pub use error::{Error, Result};
pub use key::{Key, KeySignature, RevocationKey, Subkey, TofuInfo, UserId};
pub use notation::{NotationFlags, SignatureNotation};
pub use status::StatusCode;
pub use types::{
    KeyOrigin, KeylistMode, PinentryMode, Protocol, SigMode, SigSummary, TofuPolicy, Validity,
};
pub use wait::{sync_wait, wait_ext, wait_one, wait_one_ext, Event, LoopPolicy, WaitResult};

/// Prepare the process-wide state: the signal disposition for broken
/// engine pipes and the configuration.  Called implicitly by
/// [`Context::new`]; applications that tweak global flags should call
/// it once afterwards.
pub fn init() {
    sys::io_subsystem_init();
    config::debug_spec();
}

#[cfg(test)]
mod tests {
    //! Whole-lifecycle coverage: a stub engine whose "operation" is a
    //! plain pipe, driven through reset, the global loop and both
    //! cancellation shapes.

    use std::os::unix::io::RawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::engine::{Engine, EngineFactory, EngineInfo, StatusHandler};
    use crate::fdt::{Direction, FdtFlags};
    use crate::wait::{Event, IoCbTag, IoCbs};
    use crate::*;

    struct StubEngine {
        protocol: Protocol,
        cbs: Mutex<Option<IoCbs>>,
        tags: Mutex<Vec<IoCbTag>>,
    }

    impl StubEngine {
        fn new(protocol: Protocol) -> Arc<StubEngine> {
            Arc::new(StubEngine {
                protocol,
                cbs: Mutex::new(None),
                tags: Mutex::new(Vec::new()),
            })
        }

        /// Begin an "operation" whose only I/O is reading the given
        /// pipe end.  The callback consumes one chunk per dispatch and
        /// unregisters itself at end of stream, the way an engine's
        /// status reader does.
        fn start_pipe_op(&self, fd: RawFd, serial: u64, counter: Arc<AtomicUsize>) {
            fdt::insert(fd).unwrap();
            let cbs = self.cbs.lock().unwrap();
            let cbs = cbs.as_ref().expect("reset installed the io cbs");
            let tag = (cbs.add)(
                fd,
                Direction::Read,
                Box::new(move |fd| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let mut buf = [0u8; 7];
                    match sys::read(fd, &mut buf) {
                        Ok(0) => {
                            let _ = fdt::set_io_cb(fd, serial, Direction::Read, None);
                            Ok(None)
                        }
                        Ok(_) => Ok(None),
                        Err(err) => Err(err),
                    }
                }),
            )
            .unwrap();
            self.tags.lock().unwrap().push(tag);
            (cbs.event)(&Event::Start);
        }
    }

    impl Engine for StubEngine {
        fn protocol(&self) -> Protocol {
            self.protocol
        }

        fn cancel(&self) -> Result<()> {
            Ok(())
        }

        fn set_status_handler(&self, _handler: StatusHandler) {}

        fn set_io_cbs(&self, cbs: IoCbs) {
            *self.cbs.lock().unwrap() = Some(cbs);
        }
    }

    fn stub_factory(engine: Arc<StubEngine>) -> EngineFactory {
        Arc::new(move |_info: &EngineInfo| Ok(engine.clone() as Arc<dyn Engine>))
    }

    /// Each caller passes its own protocol so that parallel tests do
    /// not overwrite each other's factory registration.
    fn stub_context(protocol: Protocol) -> (Arc<Context>, Arc<StubEngine>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let ctx = Context::new();
        ctx.set_protocol(protocol).unwrap();
        ctx.set_engine_info(protocol, "stub", None).unwrap();
        let engine = StubEngine::new(protocol);
        engine::register_engine_factory(protocol, stub_factory(engine.clone()));
        (ctx, engine)
    }

    #[test]
    fn global_loop_drives_finite_operation_to_done() {
        let (ctx, engine) = stub_context(Protocol::G13);
        ctx.reset(StartMode::Async, false).unwrap();

        let [r, w] = sys::pipe(1).unwrap();
        let dispatches = Arc::new(AtomicUsize::new(0));
        engine.start_pipe_op(r, ctx.serial(), dispatches.clone());

        // A finite engine: two chunks, then end of stream.
        sys::write(w, b"chunk-1").unwrap();
        sys::write(w, b"chunk-2").unwrap();
        sys::close_fd(w).unwrap();

        let mut rounds = 0;
        let done = loop {
            rounds += 1;
            assert!(rounds < 32, "the loop must make progress");
            let result = wait_ext(Some(&ctx), false);
            assert!(result.status.is_none(), "unexpected error: {:?}", result.status);
            assert!(result.op_err.is_none());
            if let Some(done) = result.ctx {
                break done;
            }
        };
        assert_eq!(done.serial(), ctx.serial());
        // One dispatch per chunk plus the end of stream.
        assert!(dispatches.load(Ordering::SeqCst) >= 3);
        assert!(dispatches.load(Ordering::SeqCst) < 32);

        fdt::remove(r).unwrap();
        sys::close_fd(r).unwrap();
    }

    #[test]
    fn sync_cancel_closes_fds_and_reports_canceled() {
        let (ctx, engine) = stub_context(Protocol::Assuan);
        ctx.reset(StartMode::Async, false).unwrap();

        let [r, w] = sys::pipe(1).unwrap();
        engine.start_pipe_op(r, ctx.serial(), Arc::new(AtomicUsize::new(0)));
        assert_eq!(fdt::get_count(ctx.serial(), FdtFlags::ACTIVE), 1);

        ctx.cancel().unwrap();

        // Every fd of the context is gone and the completion record
        // carries the cancellation.
        assert_eq!(fdt::get_count(ctx.serial(), FdtFlags::empty()), 0);
        let (serial, status, op_err) = fdt::get_done(ctx.serial()).unwrap();
        assert_eq!(serial, ctx.serial());
        assert_eq!(status, Some(Error::Canceled));
        assert_eq!(op_err, None);
        sys::close_fd(w).unwrap();
    }

    #[test]
    fn async_cancel_is_picked_up_by_the_next_wait_cycle() {
        let (ctx, engine) = stub_context(Protocol::Spawn);
        ctx.reset(StartMode::Async, false).unwrap();

        let [r, w] = sys::pipe(1).unwrap();
        let dispatches = Arc::new(AtomicUsize::new(0));
        engine.start_pipe_op(r, ctx.serial(), dispatches.clone());

        ctx.cancel_async();
        sys::write(w, b"pending").unwrap();

        let result = wait_ext(Some(&ctx), true);
        assert_eq!(result.status, Some(Error::Canceled));
        assert_eq!(result.ctx.map(|c| c.serial()), Some(ctx.serial()));
        // The callback never ran; the cancel was observed first.
        assert_eq!(dispatches.load(Ordering::SeqCst), 0);
        assert_eq!(fdt::get_count(ctx.serial(), FdtFlags::empty()), 0);
        sys::close_fd(w).unwrap();
    }

    #[test]
    fn reset_without_engine_info_is_unsupported() {
        let ctx = Context::new();
        ctx.set_protocol(Protocol::UiServer).unwrap();
        assert_eq!(
            ctx.reset(StartMode::Sync, false).unwrap_err(),
            Error::UnsupportedProtocol
        );
    }
}
