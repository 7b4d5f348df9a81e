//! Contexts: the unit of one sequential crypto operation at a time.
//!
//! A context carries the protocol selection, the option flags and
//! strings the engines consume, the signer and notation lists, the
//! user callbacks, and the chain of per-operation data slots.  Every
//! context gets a process-unique serial number at creation; the fd
//! table refers to owning contexts only by serial, and a registry of
//! weak references resolves serials back to live contexts.
//!
//! Lock discipline: the small runtime flags (`canceled`,
//! `redraw_suggested`) have their own lock because they are read on
//! the dispatch path; neither it nor the main option lock is ever held
//! across a callback or engine invocation.

use std::any::Any;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, trace, warn};
use once_cell::sync::Lazy;

use crate::config;
use crate::engine::{self, Engine, EngineFlags, EngineInfo, LocaleCategory};
use crate::error::{Error, Result};
use crate::fdt;
use crate::key::Key;
use crate::notation::{NotationFlags, SignatureNotation};
use crate::ops::OpDataKind;
use crate::types::{KeylistMode, PinentryMode, Protocol};
use crate::wait::{self, Event, LoopPolicy, UserIoCbs};

/// Serials are never reused; 0 stands for "any owner" in the fd table.
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

static REGISTRY: Lazy<Mutex<HashMap<u64, Weak<Context>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Resolve a serial to a live context.
pub fn get_ctx(serial: u64) -> Option<Arc<Context>> {
    let mut registry = REGISTRY.lock().unwrap();
    match registry.get(&serial) {
        Some(weak) => match weak.upgrade() {
            Some(ctx) => Some(ctx),
            None => {
                registry.remove(&serial);
                None
            }
        },
        None => None,
    }
}

pub type PassphraseCb =
    Arc<Mutex<Box<dyn FnMut(Option<&str>, Option<&str>, bool, RawFd) -> Result<()> + Send>>>;
pub type ProgressCb = Arc<Mutex<Box<dyn FnMut(&str, i32, u64, u64) + Send>>>;
pub type StatusCb = Arc<Mutex<Box<dyn FnMut(&str, &str) -> Result<()> + Send>>>;

/// How an operation is started; combined with the keep-engine bit by
/// session transports that must preserve the backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Asynchronous; global event loop unless user callbacks are set.
    Async,
    /// Blocking; always the private loop.
    Sync,
    /// Asynchronous but never the global loop (key listings).
    AsyncPrivate,
}

struct RuntimeFlags {
    canceled: bool,
    redraw_suggested: bool,
}

pub(crate) struct OpDataSlot {
    kind: OpDataKind,
    hook: Arc<dyn Any + Send + Sync>,
}

#[derive(Default)]
struct CtxInner {
    protocol: Protocol,
    sub_protocol: Protocol,
    engine_info: Vec<EngineInfo>,

    armor: bool,
    textmode: bool,
    offline: bool,
    full_status: bool,
    raw_description: bool,
    export_session_keys: bool,
    include_key_block: bool,
    auto_key_import: bool,
    auto_key_retrieve: bool,
    no_symkey_cache: bool,
    ignore_mdc_error: bool,
    no_auto_check_trustdb: bool,
    proc_all_sigs: bool,
    extended_edit: bool,

    include_certs: i32,
    keylist_mode: KeylistMode,
    pinentry_mode: PinentryMode,

    sender: Option<String>,
    override_session_key: Option<String>,
    request_origin: Option<String>,
    auto_key_locate: Option<String>,
    lc_ctype: Option<String>,
    lc_messages: Option<String>,
    trust_model: Option<String>,
    cert_expire: Option<String>,
    key_origin: Option<String>,
    import_filter: Option<String>,
    import_options: Option<String>,
    known_notations: Option<String>,

    signers: Vec<Arc<Key>>,
    sig_notations: Vec<SignatureNotation>,
    op_data: Vec<OpDataSlot>,

    loop_policy: LoopPolicy,
    user_io_cbs: Option<UserIoCbs>,

    passphrase_cb: Option<PassphraseCb>,
    progress_cb: Option<ProgressCb>,
    status_cb: Option<StatusCb>,
}

pub struct Context {
    serial: u64,
    flags: Mutex<RuntimeFlags>,
    engine: Mutex<Option<Arc<dyn Engine>>>,
    inner: Mutex<CtxInner>,
}

impl Context {
    pub fn new() -> Arc<Context> {
        crate::sys::io_subsystem_init();
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        let ctx = Arc::new(Context {
            serial,
            flags: Mutex::new(RuntimeFlags { canceled: false, redraw_suggested: false }),
            engine: Mutex::new(None),
            inner: Mutex::new(CtxInner {
                sub_protocol: Protocol::Default,
                include_certs: config::INCLUDE_CERTS_DEFAULT,
                keylist_mode: KeylistMode::LOCAL,
                engine_info: config::engine_infos(),
                ..Default::default()
            }),
        });
        REGISTRY.lock().unwrap().insert(serial, Arc::downgrade(&ctx));
        debug!("ctx={} created", serial);
        ctx
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn is_canceled(&self) -> bool {
        self.flags.lock().unwrap().canceled
    }

    /// Soft cancel: takes effect at the next io-callback dispatch.
    pub fn cancel_async(&self) {
        self.flags.lock().unwrap().canceled = true;
    }

    pub fn redraw_suggested(&self) -> bool {
        self.flags.lock().unwrap().redraw_suggested
    }

    pub(crate) fn suggest_redraw(&self) {
        self.flags.lock().unwrap().redraw_suggested = true;
    }

    pub fn engine(&self) -> Option<Arc<dyn Engine>> {
        self.engine.lock().unwrap().clone()
    }

    // --- protocol -----------------------------------------------------

    pub fn protocol(&self) -> Protocol {
        self.inner.lock().unwrap().protocol
    }

    /// Select the protocol.  Switching protocols shuts down a running
    /// engine; a matching one is created at the next reset.
    pub fn set_protocol(&self, protocol: Protocol) -> Result<()> {
        if matches!(protocol, Protocol::Default | Protocol::Unknown) {
            return Err(Error::InvValue);
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.protocol != protocol {
            inner.protocol = protocol;
            drop(inner);
            let mut engine = self.engine.lock().unwrap();
            if engine.take().is_some() {
                trace!("ctx={} engine released on protocol switch", self.serial);
            }
        }
        Ok(())
    }

    pub fn sub_protocol(&self) -> Protocol {
        self.inner.lock().unwrap().sub_protocol
    }

    pub fn set_sub_protocol(&self, protocol: Protocol) {
        self.inner.lock().unwrap().sub_protocol = protocol;
    }

    pub fn engine_info(&self) -> Vec<EngineInfo> {
        self.inner.lock().unwrap().engine_info.clone()
    }

    pub fn set_engine_info(
        &self,
        protocol: Protocol,
        file_name: &str,
        home_dir: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let info = EngineInfo {
            protocol,
            file_name: file_name.to_string(),
            home_dir: home_dir.map(str::to_string),
            version: None,
        };
        match inner.engine_info.iter_mut().find(|i| i.protocol == protocol) {
            Some(slot) => *slot = info,
            None => inner.engine_info.push(info),
        }
        Ok(())
    }

    // --- boolean options ----------------------------------------------

    pub fn armor(&self) -> bool {
        self.inner.lock().unwrap().armor
    }

    pub fn set_armor(&self, value: bool) {
        self.inner.lock().unwrap().armor = value;
    }

    pub fn textmode(&self) -> bool {
        self.inner.lock().unwrap().textmode
    }

    pub fn set_textmode(&self, value: bool) {
        self.inner.lock().unwrap().textmode = value;
    }

    pub fn offline(&self) -> bool {
        self.inner.lock().unwrap().offline
    }

    pub fn set_offline(&self, value: bool) {
        self.inner.lock().unwrap().offline = value;
    }

    pub fn full_status(&self) -> bool {
        self.inner.lock().unwrap().full_status
    }

    pub fn set_full_status(&self, value: bool) {
        self.inner.lock().unwrap().full_status = value;
    }

    pub fn raw_description(&self) -> bool {
        self.inner.lock().unwrap().raw_description
    }

    pub fn set_raw_description(&self, value: bool) {
        self.inner.lock().unwrap().raw_description = value;
    }

    pub fn export_session_keys(&self) -> bool {
        self.inner.lock().unwrap().export_session_keys
    }

    pub fn set_export_session_keys(&self, value: bool) {
        self.inner.lock().unwrap().export_session_keys = value;
    }

    pub fn include_key_block(&self) -> bool {
        self.inner.lock().unwrap().include_key_block
    }

    pub fn set_include_key_block(&self, value: bool) {
        self.inner.lock().unwrap().include_key_block = value;
    }

    pub fn auto_key_import(&self) -> bool {
        self.inner.lock().unwrap().auto_key_import
    }

    pub fn set_auto_key_import(&self, value: bool) {
        self.inner.lock().unwrap().auto_key_import = value;
    }

    pub fn auto_key_retrieve(&self) -> bool {
        self.inner.lock().unwrap().auto_key_retrieve
    }

    pub fn set_auto_key_retrieve(&self, value: bool) {
        self.inner.lock().unwrap().auto_key_retrieve = value;
    }

    pub fn no_symkey_cache(&self) -> bool {
        self.inner.lock().unwrap().no_symkey_cache
    }

    pub fn set_no_symkey_cache(&self, value: bool) {
        self.inner.lock().unwrap().no_symkey_cache = value;
    }

    pub fn ignore_mdc_error(&self) -> bool {
        self.inner.lock().unwrap().ignore_mdc_error
    }

    /// Note that this flag resets after each decrypt operation.
    pub fn set_ignore_mdc_error(&self, value: bool) {
        self.inner.lock().unwrap().ignore_mdc_error = value;
    }

    pub fn no_auto_check_trustdb(&self) -> bool {
        self.inner.lock().unwrap().no_auto_check_trustdb
    }

    pub fn set_no_auto_check_trustdb(&self, value: bool) {
        self.inner.lock().unwrap().no_auto_check_trustdb = value;
    }

    pub fn proc_all_sigs(&self) -> bool {
        self.inner.lock().unwrap().proc_all_sigs
    }

    pub fn set_proc_all_sigs(&self, value: bool) {
        self.inner.lock().unwrap().proc_all_sigs = value;
    }

    pub fn extended_edit(&self) -> bool {
        self.inner.lock().unwrap().extended_edit
    }

    pub fn set_extended_edit(&self, value: bool) {
        self.inner.lock().unwrap().extended_edit = value;
    }

    // --- scalar options -----------------------------------------------

    pub fn include_certs(&self) -> i32 {
        self.inner.lock().unwrap().include_certs
    }

    pub fn set_include_certs(&self, value: i32) {
        self.inner.lock().unwrap().include_certs = value;
    }

    pub fn keylist_mode(&self) -> KeylistMode {
        self.inner.lock().unwrap().keylist_mode
    }

    pub fn set_keylist_mode(&self, mode: KeylistMode) {
        self.inner.lock().unwrap().keylist_mode = mode;
    }

    pub fn pinentry_mode(&self) -> PinentryMode {
        self.inner.lock().unwrap().pinentry_mode
    }

    pub fn set_pinentry_mode(&self, mode: PinentryMode) {
        self.inner.lock().unwrap().pinentry_mode = mode;
    }

    // --- string options -----------------------------------------------

    pub fn sender(&self) -> Option<String> {
        self.inner.lock().unwrap().sender.clone()
    }

    pub fn set_sender(&self, value: Option<&str>) {
        self.inner.lock().unwrap().sender = value.map(str::to_string);
    }

    pub fn override_session_key(&self) -> Option<String> {
        self.inner.lock().unwrap().override_session_key.clone()
    }

    pub fn set_override_session_key(&self, value: Option<&str>) {
        self.inner.lock().unwrap().override_session_key = value.map(str::to_string);
    }

    pub fn request_origin(&self) -> Option<String> {
        self.inner.lock().unwrap().request_origin.clone()
    }

    pub fn set_request_origin(&self, value: Option<&str>) {
        self.inner.lock().unwrap().request_origin = value.map(str::to_string);
    }

    pub fn auto_key_locate(&self) -> Option<String> {
        self.inner.lock().unwrap().auto_key_locate.clone()
    }

    pub fn set_auto_key_locate(&self, value: Option<&str>) {
        self.inner.lock().unwrap().auto_key_locate = value.map(str::to_string);
    }

    pub fn locale(&self) -> (Option<String>, Option<String>) {
        let inner = self.inner.lock().unwrap();
        (inner.lc_ctype.clone(), inner.lc_messages.clone())
    }

    pub fn set_locale(&self, category: LocaleCategory, value: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        match category {
            LocaleCategory::CType => inner.lc_ctype = value.map(str::to_string),
            LocaleCategory::Messages => inner.lc_messages = value.map(str::to_string),
        }
    }

    pub fn trust_model(&self) -> Option<String> {
        self.inner.lock().unwrap().trust_model.clone()
    }

    pub fn set_trust_model(&self, value: Option<&str>) {
        self.inner.lock().unwrap().trust_model = value.map(str::to_string);
    }

    pub fn cert_expire(&self) -> Option<String> {
        self.inner.lock().unwrap().cert_expire.clone()
    }

    pub fn set_cert_expire(&self, value: Option<&str>) {
        self.inner.lock().unwrap().cert_expire = value.map(str::to_string);
    }

    pub fn key_origin(&self) -> Option<String> {
        self.inner.lock().unwrap().key_origin.clone()
    }

    pub fn set_key_origin(&self, value: Option<&str>) {
        self.inner.lock().unwrap().key_origin = value.map(str::to_string);
    }

    pub fn import_filter(&self) -> Option<String> {
        self.inner.lock().unwrap().import_filter.clone()
    }

    pub fn set_import_filter(&self, value: Option<&str>) {
        self.inner.lock().unwrap().import_filter = value.map(str::to_string);
    }

    pub fn import_options(&self) -> Option<String> {
        self.inner.lock().unwrap().import_options.clone()
    }

    pub fn set_import_options(&self, value: Option<&str>) {
        self.inner.lock().unwrap().import_options = value.map(str::to_string);
    }

    pub fn known_notations(&self) -> Option<String> {
        self.inner.lock().unwrap().known_notations.clone()
    }

    pub fn set_known_notations(&self, value: Option<&str>) {
        self.inner.lock().unwrap().known_notations = value.map(str::to_string);
    }

    // --- signers and notations ----------------------------------------

    pub fn signers_add(&self, key: Arc<Key>) {
        self.inner.lock().unwrap().signers.push(key);
    }

    pub fn signers_clear(&self) {
        self.inner.lock().unwrap().signers.clear();
    }

    pub fn signers_count(&self) -> usize {
        self.inner.lock().unwrap().signers.len()
    }

    pub fn signers(&self) -> Vec<Arc<Key>> {
        self.inner.lock().unwrap().signers.clone()
    }

    /// Add a signature notation.  With a name this is a notation and
    /// is forced human readable; without a name it is a policy URL
    /// which must not carry the human readable flag.
    pub fn sig_notation_add(
        &self,
        name: Option<&str>,
        value: &str,
        mut flags: NotationFlags,
    ) -> Result<()> {
        if name.is_some() {
            flags |= NotationFlags::HUMAN_READABLE;
        } else {
            flags.remove(NotationFlags::HUMAN_READABLE);
        }
        let notation =
            SignatureNotation::new(name.map(str::as_bytes), value.as_bytes(), flags)?;
        self.inner.lock().unwrap().sig_notations.push(notation);
        Ok(())
    }

    pub fn sig_notation_clear(&self) {
        self.inner.lock().unwrap().sig_notations.clear();
    }

    pub fn sig_notations(&self) -> Vec<SignatureNotation> {
        self.inner.lock().unwrap().sig_notations.clone()
    }

    // --- callbacks ----------------------------------------------------

    pub fn set_passphrase_cb(
        &self,
        cb: Option<Box<dyn FnMut(Option<&str>, Option<&str>, bool, RawFd) -> Result<()> + Send>>,
    ) {
        self.inner.lock().unwrap().passphrase_cb = cb.map(|cb| Arc::new(Mutex::new(cb)));
    }

    pub fn has_passphrase_cb(&self) -> bool {
        self.inner.lock().unwrap().passphrase_cb.is_some()
    }

    pub(crate) fn passphrase_cb(&self) -> Option<PassphraseCb> {
        self.inner.lock().unwrap().passphrase_cb.clone()
    }

    pub fn set_progress_cb(&self, cb: Option<Box<dyn FnMut(&str, i32, u64, u64) + Send>>) {
        self.inner.lock().unwrap().progress_cb = cb.map(|cb| Arc::new(Mutex::new(cb)));
    }

    /// Invoke the progress callback, outside all context locks.
    pub(crate) fn call_progress(&self, what: &str, typ: i32, current: u64, total: u64) {
        let cb = self.inner.lock().unwrap().progress_cb.clone();
        if let Some(cb) = cb {
            (cb.lock().unwrap())(what, typ, current, total);
        }
    }

    pub fn set_status_cb(&self, cb: Option<Box<dyn FnMut(&str, &str) -> Result<()> + Send>>) {
        self.inner.lock().unwrap().status_cb = cb.map(|cb| Arc::new(Mutex::new(cb)));
    }

    pub fn has_status_cb(&self) -> bool {
        self.inner.lock().unwrap().status_cb.is_some()
    }

    /// Forward a status keyword to the application's status callback
    /// unless it already receives the full stream.
    pub(crate) fn call_status_cb(&self, keyword: &str, args: &str) -> Result<()> {
        let (cb, full) = {
            let inner = self.inner.lock().unwrap();
            (inner.status_cb.clone(), inner.full_status)
        };
        match cb {
            Some(cb) if !full => (cb.lock().unwrap())(keyword, args),
            _ => Ok(()),
        }
    }

    pub fn set_user_io_cbs(&self, cbs: Option<UserIoCbs>) {
        self.inner.lock().unwrap().user_io_cbs = cbs;
    }

    pub(crate) fn user_io_cbs(&self) -> Option<UserIoCbs> {
        self.inner.lock().unwrap().user_io_cbs.clone()
    }

    pub(crate) fn loop_policy(&self) -> LoopPolicy {
        self.inner.lock().unwrap().loop_policy
    }

    // --- operation data -----------------------------------------------

    /// Find the op-data slot of KIND, creating a zero-initialised one
    /// when CREATE is set.  A context holds at most one slot per kind;
    /// the result hook is shared, so results stay alive as long as any
    /// caller keeps a reference, surviving the next reset.
    pub fn op_data_lookup<T>(&self, kind: OpDataKind, create: bool) -> Option<Arc<Mutex<T>>>
    where
        T: Default + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.op_data.iter().find(|s| s.kind == kind) {
            match slot.hook.clone().downcast::<Mutex<T>>() {
                Ok(hook) => return Some(hook),
                Err(_) => {
                    warn!("ctx={} op-data type confusion for {:?}", self.serial, kind);
                    return None;
                }
            }
        }
        if !create {
            return None;
        }
        let hook: Arc<Mutex<T>> = Arc::new(Mutex::new(T::default()));
        inner.op_data.insert(0, OpDataSlot { kind, hook: hook.clone() });
        Some(hook)
    }

    /// Drop all op-data slots.  Hooks shared with callers stay alive
    /// through their own references.
    pub fn release_result(&self) {
        self.inner.lock().unwrap().op_data.clear();
    }

    #[cfg(test)]
    pub(crate) fn op_data_count(&self, kind: OpDataKind) -> usize {
        self.inner
            .lock()
            .unwrap()
            .op_data
            .iter()
            .filter(|slot| slot.kind == kind)
            .count()
    }

    // --- lifecycle ----------------------------------------------------

    /// Prepare the context for the next operation: drop the op-data
    /// chain, clear the cancellation and redraw flags, reset or
    /// re-create the engine, and install the wait-loop policy.
    pub fn reset(self: &Arc<Context>, mode: StartMode, keep_engine: bool) -> Result<()> {
        self.release_result();
        {
            let mut flags = self.flags.lock().unwrap();
            flags.canceled = false;
            flags.redraw_suggested = false;
        }

        let mut reuse_engine = false;
        let existing = self.engine();
        let mut engine_slot = existing.clone();
        if existing.is_some() && keep_engine {
            reuse_engine = true;
        } else if let Some(engine) = existing {
            match engine.reset() {
                Ok(()) => {}
                Err(Error::NotImplemented) => engine_slot = None,
                Err(err) => return Err(err),
            }
        }

        if engine_slot.is_none() {
            let info = {
                let inner = self.inner.lock().unwrap();
                let protocol = inner.protocol;
                inner.engine_info.iter().find(|i| i.protocol == protocol).cloned()
            };
            let info = info.ok_or(Error::UnsupportedProtocol)?;
            engine_slot = Some(engine::new_engine(&info)?);
            trace!("ctx={} new engine for {}", self.serial, info.protocol.name());
        }
        *self.engine.lock().unwrap() = engine_slot.clone();
        let engine = engine_slot.ok_or(Error::General)?;

        if !reuse_engine {
            let configure = || -> Result<()> {
                let (lc_ctype, lc_messages) = self.locale();
                match engine.set_locale(LocaleCategory::CType, lc_ctype.as_deref()) {
                    Ok(()) | Err(Error::NotImplemented) => {}
                    Err(err) => return Err(err),
                }
                match engine.set_locale(LocaleCategory::Messages, lc_messages.as_deref()) {
                    Ok(()) | Err(Error::NotImplemented) => {}
                    Err(err) => return Err(err),
                }

                engine.set_engine_flags(&self.engine_flags());

                match engine.set_pinentry_mode(self.pinentry_mode()) {
                    Ok(()) | Err(Error::NotImplemented) => {}
                    Err(err) => return Err(err),
                }

                if self.full_status() {
                    if let Some(cb) = self.inner.lock().unwrap().status_cb.clone() {
                        engine.set_raw_status_cb(Box::new(move |keyword, args| {
                            (cb.lock().unwrap())(keyword, args)
                        }));
                    }
                }
                Ok(())
            };
            if let Err(err) = configure() {
                *self.engine.lock().unwrap() = None;
                return Err(err);
            }
        }

        if self.sub_protocol() != Protocol::Default {
            engine.set_protocol(self.sub_protocol())?;
        }

        let policy = match mode {
            StartMode::Sync => LoopPolicy::Private,
            StartMode::AsyncPrivate => {
                if self.user_io_cbs().is_some() {
                    LoopPolicy::User
                } else {
                    LoopPolicy::Private
                }
            }
            StartMode::Async => {
                if self.user_io_cbs().is_some() {
                    LoopPolicy::User
                } else {
                    LoopPolicy::Global
                }
            }
        };
        self.inner.lock().unwrap().loop_policy = policy;
        engine.set_io_cbs(wait::make_io_cbs(self, policy));
        Ok(())
    }

    fn engine_flags(&self) -> EngineFlags {
        let inner = self.inner.lock().unwrap();
        EngineFlags {
            offline: inner.offline,
            no_symkey_cache: inner.no_symkey_cache,
            ignore_mdc_error: inner.ignore_mdc_error,
            auto_key_import: inner.auto_key_import,
            auto_key_retrieve: inner.auto_key_retrieve,
            include_key_block: inner.include_key_block,
            no_auto_check_trustdb: inner.no_auto_check_trustdb,
            request_origin: inner.request_origin.clone(),
            auto_key_locate: inner.auto_key_locate.clone(),
            trust_model: inner.trust_model.clone(),
            known_notations: inner.known_notations.clone(),
        }
    }

    /// Synchronous cancel: ask the engine to abort and tear down the
    /// operation's fds.
    pub fn cancel(self: &Arc<Context>) -> Result<()> {
        cancel_with_err(self.serial, Some(Error::Canceled), None)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        REGISTRY.lock().unwrap().remove(&self.serial);
        debug!("ctx={} released", self.serial);
    }
}

/// Cancel the context identified by SERIAL.  With a context error this
/// is a session cancel: the engine is aborted and every fd owned by
/// the context is closed through the fd table's close path.  With only
/// an operational error the current command is cancelled but the
/// session stays usable.  Either way a DONE event carrying the error
/// pair is delivered.
pub(crate) fn cancel_with_err(
    serial: u64,
    ctx_err: Option<Error>,
    op_err: Option<Error>,
) -> Result<()> {
    let ctx = get_ctx(serial).ok_or(Error::InvValue)?;
    debug!("ctx={} cancel (err={:?}, op_err={:?})", serial, ctx_err, op_err);

    if let Some(engine) = ctx.engine() {
        let res = if ctx_err.is_some() { engine.cancel() } else { engine.cancel_op() };
        if let Err(err) = res {
            return Err(err);
        }
    }

    wait::io_event(&ctx, &Event::Done { err: ctx_err, op_err });

    if ctx_err.is_some() {
        fdt::close_owner_fds(serial);
    }
    Ok(())
}
