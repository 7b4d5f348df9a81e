//! The engine boundary.
//!
//! An engine drives one backend subprocess (or session) and is opaque
//! to the core: the core resets or cancels it, installs the status and
//! colon-line handlers of the current operation, and hands it the
//! io-callback registration policy of the context's wait loop.  The
//! engine in turn registers its pipe fds through those callbacks and
//! feeds every status line it reads into the installed handler.
//!
//! Concrete engines are registered per protocol in a process-wide
//! factory table; contexts pick the factory matching their protocol at
//! reset time.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use log::debug;
use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::status::StatusCode;
use crate::types::{PinentryMode, Protocol};
use crate::wait::IoCbs;

/// Description of an installed backend program.
#[derive(Debug, Clone)]
pub struct EngineInfo {
    pub protocol: Protocol,
    pub file_name: String,
    pub home_dir: Option<String>,
    pub version: Option<String>,
}

/// Locale categories forwarded to the engine for its pinentry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocaleCategory {
    CType,
    Messages,
}

/// Context options an engine picks up at reset time.
#[derive(Debug, Clone, Default)]
pub struct EngineFlags {
    pub offline: bool,
    pub no_symkey_cache: bool,
    pub ignore_mdc_error: bool,
    pub auto_key_import: bool,
    pub auto_key_retrieve: bool,
    pub include_key_block: bool,
    pub no_auto_check_trustdb: bool,
    pub request_origin: Option<String>,
    pub auto_key_locate: Option<String>,
    pub trust_model: Option<String>,
    pub known_notations: Option<String>,
}

/// Handler receiving one parsed status line at a time.  `Eof` is
/// delivered once when the status channel ends.
pub type StatusHandler = Box<dyn FnMut(StatusCode, &str) -> Result<()> + Send>;

/// Handler for colon separated listing lines; `None` marks the end of
/// the listing.
pub type ColonLineHandler = Box<dyn FnMut(Option<&str>) -> Result<()> + Send>;

/// Handler answering engine inquiries (passphrase entry, edit flows).
/// Writing to the fd sends a line back to the engine; the bool return
/// reports whether the inquiry was handled.
pub type CommandHandler = Box<dyn FnMut(StatusCode, &str, RawFd) -> Result<bool> + Send>;

pub trait Engine: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Reset the engine for the next operation, keeping the process
    /// alive.  Engines that cannot do this report `NotImplemented` and
    /// are torn down and re-created instead.
    fn reset(&self) -> Result<()> {
        Err(Error::NotImplemented)
    }

    /// Session cancel: abort the current operation and close every fd
    /// the engine registered.
    fn cancel(&self) -> Result<()>;

    /// Command cancel for session mode: abort the current command but
    /// keep the session connection.
    fn cancel_op(&self) -> Result<()> {
        Ok(())
    }

    fn set_status_handler(&self, handler: StatusHandler);

    fn set_colon_line_handler(&self, _handler: ColonLineHandler) -> Result<()> {
        Err(Error::NotImplemented)
    }

    fn set_command_handler(&self, _handler: CommandHandler) -> Result<()> {
        Err(Error::NotImplemented)
    }

    /// Install the io-callback registration policy of the owning
    /// context's wait loop.
    fn set_io_cbs(&self, cbs: IoCbs);

    fn set_locale(&self, _category: LocaleCategory, _value: Option<&str>) -> Result<()> {
        Err(Error::NotImplemented)
    }

    fn set_pinentry_mode(&self, _mode: PinentryMode) -> Result<()> {
        Err(Error::NotImplemented)
    }

    fn set_engine_flags(&self, _flags: &EngineFlags) {}

    /// Select a sub-protocol on a multi-protocol engine.
    fn set_protocol(&self, _protocol: Protocol) -> Result<()> {
        Err(Error::NotImplemented)
    }

    /// Forward raw status lines to the application's status callback.
    fn set_raw_status_cb(&self, _cb: Box<dyn FnMut(&str, &str) -> Result<()> + Send>) {}
}

pub type EngineFactory = Arc<dyn Fn(&EngineInfo) -> Result<Arc<dyn Engine>> + Send + Sync>;

static FACTORIES: Lazy<Mutex<HashMap<Protocol, EngineFactory>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Register the engine implementation for a protocol.  The last
/// registration wins.
pub fn register_engine_factory(protocol: Protocol, factory: EngineFactory) {
    debug!("engine: registering factory for {}", protocol.name());
    FACTORIES.lock().unwrap().insert(protocol, factory);
}

/// Create an engine for INFO.  `UnsupportedProtocol` when no factory
/// is registered for its protocol.
pub fn new_engine(info: &EngineInfo) -> Result<Arc<dyn Engine>> {
    let factory = FACTORIES
        .lock()
        .unwrap()
        .get(&info.protocol)
        .cloned()
        .ok_or(Error::UnsupportedProtocol)?;
    factory(info)
}

/// Whether an engine implementation is available for PROTOCOL.
pub fn have_engine(protocol: Protocol) -> bool {
    FACTORIES.lock().unwrap().contains_key(&protocol)
}
