//! Library configuration.
//!
//! Defaults can be overridden three ways, in increasing precedence: a
//! TOML file (path taken from `GPGMUX_CONFIG`, falling back to the
//! packaged default path), one-shot global flags set by the embedding
//! application before anything else, and the `GPGMUX_DEBUG`
//! environment variable for diagnostics.  Backend binaries not named
//! anywhere are discovered on PATH, and the backend's own `gpgconf`
//! is asked for the directory layout, cached for the process lifetime.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;

use log::{debug, warn};
use once_cell::sync::{Lazy, OnceCell};
use serde::Deserialize;

use crate::engine::EngineInfo;
use crate::types::Protocol;
use crate::util;

const DEFAULT_CONFIG_PATH: &str = "/etc/gpgmux/gpgmux.toml";
const ENV_CONFIG_PATH: &str = "GPGMUX_CONFIG";
const ENV_DEBUG: &str = "GPGMUX_DEBUG";

/// Default for the number of certificates to include in CMS
/// signatures: the sender's and everything up to, but excluding, the
/// root.
pub const INCLUDE_CERTS_DEFAULT: i32 = -256;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub engines: EnginesConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct EnginesConfig {
    #[serde(default)]
    pub gpg: Option<String>,
    #[serde(default)]
    pub gpgsm: Option<String>,
    #[serde(default)]
    pub gpgconf: Option<String>,
    #[serde(default)]
    pub home_dir: Option<String>,
}

impl Config {
    /// Load the configuration file.  The path can be overridden with
    /// the `GPGMUX_CONFIG` environment variable.  A missing or broken
    /// file silently yields the defaults.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

static CONFIG: Lazy<Config> = Lazy::new(Config::load);

#[derive(Debug, Default, Clone)]
struct GlobalFlags {
    debug: Option<String>,
    disable_gpgconf: bool,
    require_gnupg: Option<String>,
    gpgconf_name: Option<String>,
    gpg_name: Option<String>,
    inst_type: i32,
}

static GLOBALS: Lazy<Mutex<GlobalFlags>> = Lazy::new(|| Mutex::new(GlobalFlags::default()));

/// Set a global flag.  Must happen before any other use of the
/// library; unknown flag names are rejected.
pub fn set_global_flag(name: &str, value: &str) -> bool {
    let mut globals = GLOBALS.lock().unwrap();
    match name {
        "debug" => globals.debug = Some(value.to_string()),
        "disable-gpgconf" => globals.disable_gpgconf = value != "0",
        "require-gnupg" => globals.require_gnupg = Some(value.to_string()),
        "gpgconf-name" => globals.gpgconf_name = Some(value.to_string()),
        "gpg-name" => globals.gpg_name = Some(value.to_string()),
        "inst-type" => globals.inst_type = value.parse().unwrap_or(0),
        // Accepted for compatibility with installers that configure
        // all platforms alike; meaningless here.
        "w32-inst-dir" => {}
        _ => return false,
    }
    true
}

/// The parsed debug selection: verbosity level and optional sink file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DebugSpec {
    pub level: u32,
    pub sink: Option<String>,
}

/// Parse a `<level>[;<path>]` debug spec.  The sink path is only
/// honoured when the process has not changed identity, so setuid
/// programs cannot be tricked into writing diagnostics anywhere.
pub fn parse_debug_spec(spec: &str, same_uid: bool) -> DebugSpec {
    let (level, path) = match spec.split_once(';') {
        Some((level, path)) => (level, Some(path)),
        None => (spec, None),
    };
    let level = level.trim().parse().unwrap_or(0);
    let sink = match path {
        Some(path) if same_uid && !path.trim().is_empty() => Some(path.trim().to_string()),
        _ => None,
    };
    DebugSpec { level, sink }
}

static DEBUG_SPEC: OnceCell<DebugSpec> = OnceCell::new();

/// The effective debug selection, from the global flag or the
/// environment.
pub fn debug_spec() -> &'static DebugSpec {
    DEBUG_SPEC.get_or_init(|| {
        let from_flag = GLOBALS.lock().unwrap().debug.clone();
        let spec = from_flag.or_else(|| std::env::var(ENV_DEBUG).ok());
        match spec {
            Some(spec) => {
                let same_uid = unsafe { libc::getuid() == libc::geteuid() };
                parse_debug_spec(&spec, same_uid)
            }
            None => DebugSpec::default(),
        }
    })
}

fn find_binary(configured: Option<&str>, name: &str) -> Option<String> {
    if let Some(path) = configured {
        return Some(path.to_string());
    }
    which::which(name).ok().map(|p| p.to_string_lossy().into_owned())
}

fn gpgconf_binary() -> Option<String> {
    let globals = GLOBALS.lock().unwrap();
    if globals.disable_gpgconf {
        return None;
    }
    let configured = globals.gpgconf_name.clone().or_else(|| CONFIG.engines.gpgconf.clone());
    drop(globals);
    find_binary(configured.as_deref(), "gpgconf")
}

/// The directory and component information, lazily obtained from the
/// discovered gpgconf and cached for the process lifetime.
static DIR_INFO: Lazy<Mutex<Option<HashMap<String, String>>>> = Lazy::new(|| Mutex::new(None));

fn load_dir_info() -> HashMap<String, String> {
    let mut info = HashMap::new();

    if let Some(gpgconf) = gpgconf_binary() {
        info.insert("gpgconf-name".to_string(), gpgconf.clone());
        for (args, keyed_by_component) in
            [(&["--list-dirs"][..], false), (&["--list-components"][..], true)]
        {
            let output = match Command::new(&gpgconf).args(args).output() {
                Ok(output) if output.status.success() => output,
                Ok(_) | Err(_) => {
                    warn!("gpgconf {} failed; directory info incomplete", args.join(" "));
                    continue;
                }
            };
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                let mut fields = line.split(':');
                let key = fields.next().unwrap_or("");
                if key.is_empty() {
                    continue;
                }
                if keyed_by_component {
                    // component:description:pathname
                    let path = fields.nth(1).unwrap_or("");
                    if !path.is_empty() {
                        let decoded =
                            util::decode_percent_string(path).unwrap_or_default();
                        info.insert(format!("{}-name", key), decoded);
                    }
                } else {
                    let value = fields.next().unwrap_or("");
                    let decoded = util::decode_percent_string(value).unwrap_or_default();
                    info.insert(key.to_string(), decoded);
                }
            }
        }
    }

    if let Some(home) = &CONFIG.engines.home_dir {
        info.insert("homedir".to_string(), home.clone());
    }
    debug!("directory info cached ({} keys)", info.len());
    info
}

/// Look up a directory-info key (`homedir`, `agent-socket`,
/// `gpg-name`, ...).  The first call prices in a gpgconf invocation.
pub fn dir_info(key: &str) -> Option<String> {
    let mut cache = DIR_INFO.lock().unwrap();
    let info = cache.get_or_insert_with(load_dir_info);
    info.get(key).cloned()
}

/// Default engine set for new contexts.
pub fn engine_infos() -> Vec<EngineInfo> {
    let globals = GLOBALS.lock().unwrap();
    let gpg_configured = globals.gpg_name.clone().or_else(|| CONFIG.engines.gpg.clone());
    drop(globals);

    let home_dir = CONFIG.engines.home_dir.clone();
    let mut infos = Vec::new();

    if let Some(gpg) = find_binary(gpg_configured.as_deref(), "gpg") {
        infos.push(EngineInfo {
            protocol: Protocol::OpenPgp,
            file_name: gpg,
            home_dir: home_dir.clone(),
            version: None,
        });
    }
    if let Some(gpgsm) = find_binary(CONFIG.engines.gpgsm.as_deref(), "gpgsm") {
        infos.push(EngineInfo {
            protocol: Protocol::Cms,
            file_name: gpgsm,
            home_dir: home_dir.clone(),
            version: None,
        });
    }
    if let Some(gpgconf) = gpgconf_binary() {
        infos.push(EngineInfo {
            protocol: Protocol::GpgConf,
            file_name: gpgconf,
            home_dir: home_dir.clone(),
            version: None,
        });
    }
    // The spawn "protocol" runs arbitrary helpers; there is no fixed
    // binary to point at.
    infos.push(EngineInfo {
        protocol: Protocol::Spawn,
        file_name: String::new(),
        home_dir,
        version: None,
    });
    infos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_spec_parsing() {
        assert_eq!(parse_debug_spec("0", true), DebugSpec { level: 0, sink: None });
        assert_eq!(parse_debug_spec("5", true), DebugSpec { level: 5, sink: None });
        assert_eq!(
            parse_debug_spec("9;/tmp/mux.log", true),
            DebugSpec { level: 9, sink: Some("/tmp/mux.log".to_string()) }
        );
        // A setuid process must not honour the sink path.
        assert_eq!(
            parse_debug_spec("9;/tmp/mux.log", false),
            DebugSpec { level: 9, sink: None }
        );
        assert_eq!(parse_debug_spec("junk", true), DebugSpec { level: 0, sink: None });
    }

    #[test]
    fn config_parses_engines_table() {
        let config: Config = toml::from_str(
            r#"
            [engines]
            gpg = "/opt/gnupg/bin/gpg"
            home_dir = "/var/lib/mux"
            "#,
        )
        .unwrap();
        assert_eq!(config.engines.gpg.as_deref(), Some("/opt/gnupg/bin/gpg"));
        assert_eq!(config.engines.home_dir.as_deref(), Some("/var/lib/mux"));
        assert_eq!(config.engines.gpgsm, None);
    }

    #[test]
    fn empty_config_is_fine() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.engines.gpg.is_none());
    }

    #[test]
    fn load_reads_the_file_named_by_the_environment() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engines]\ngpgconf = \"/opt/bin/gpgconf\"").unwrap();
        std::env::set_var(ENV_CONFIG_PATH, file.path());
        let config = Config::load();
        std::env::remove_var(ENV_CONFIG_PATH);
        assert_eq!(config.engines.gpgconf.as_deref(), Some("/opt/bin/gpgconf"));
    }

    #[test]
    fn unknown_global_flags_are_rejected() {
        assert!(set_global_flag("inst-type", "1"));
        assert!(set_global_flag("w32-inst-dir", "C:/gnupg"));
        assert!(!set_global_flag("no-such-flag", "1"));
    }

    #[test]
    fn spawn_engine_is_always_listed() {
        let infos = engine_infos();
        assert!(infos.iter().any(|i| i.protocol == Protocol::Spawn));
    }
}
