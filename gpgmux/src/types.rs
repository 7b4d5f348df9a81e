//! Shared enums and flag sets used across the context, the status
//! handlers and the value objects.

use bitflags::bitflags;

/// Backend protocol spoken by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    OpenPgp,
    Cms,
    GpgConf,
    Assuan,
    G13,
    UiServer,
    Spawn,
    /// Placeholder for "use the context's main protocol".
    Default,
    Unknown,
}

impl Protocol {
    pub fn name(self) -> &'static str {
        match self {
            Protocol::OpenPgp => "OpenPGP",
            Protocol::Cms => "CMS",
            Protocol::GpgConf => "GPGCONF",
            Protocol::Assuan => "Assuan",
            Protocol::G13 => "G13",
            Protocol::UiServer => "UIServer",
            Protocol::Spawn => "Spawn",
            Protocol::Default => "default",
            Protocol::Unknown => "unknown",
        }
    }
}

/// How the engine is told to ask for passphrases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PinentryMode {
    #[default]
    Default,
    Ask,
    Cancel,
    Error,
    Loopback,
}

bitflags! {
    /// Key listing behaviour.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KeylistMode: u32 {
        const LOCAL = 1;
        const EXTERN = 2;
        const SIGS = 4;
        const SIG_NOTATIONS = 8;
        const WITH_SECRET = 16;
        const WITH_TOFU = 32;
        const WITH_KEYGRIP = 64;
        const EPHEMERAL = 128;
        const VALIDATE = 256;
        const FORCE_EXTERN = 512;
        const WITH_V5FPR = 1024;
    }
}

bitflags! {
    /// Summary of a signature verification, distilled from validity,
    /// status and the auxiliary flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SigSummary: u32 {
        const VALID = 0x0001;
        const GREEN = 0x0002;
        const RED = 0x0004;
        const KEY_REVOKED = 0x0010;
        const KEY_EXPIRED = 0x0020;
        const SIG_EXPIRED = 0x0040;
        const KEY_MISSING = 0x0080;
        const CRL_MISSING = 0x0100;
        const CRL_TOO_OLD = 0x0200;
        const BAD_POLICY = 0x0400;
        const SYS_ERROR = 0x0800;
        const TOFU_CONFLICT = 0x1000;
    }
}

/// Computed validity of a key, user id or signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Validity {
    #[default]
    Unknown,
    Undefined,
    Never,
    Marginal,
    Full,
    Ultimate,
}

/// Trust-on-first-use policy attached to a (key, address) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TofuPolicy {
    #[default]
    None,
    Auto,
    Good,
    Unknown,
    Bad,
    Ask,
}

impl TofuPolicy {
    pub fn from_tag(tag: &str) -> TofuPolicy {
        match tag {
            "none" => TofuPolicy::None,
            "auto" => TofuPolicy::Auto,
            "good" => TofuPolicy::Good,
            "bad" => TofuPolicy::Bad,
            "ask" => TofuPolicy::Ask,
            _ => TofuPolicy::Unknown,
        }
    }
}

/// Where a key was first obtained from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyOrigin {
    #[default]
    Unknown,
    KeyServer,
    Dane,
    Wkd,
    Url,
    File,
    SelfGenerated,
    Other,
}

impl KeyOrigin {
    pub fn from_field(field: &str) -> KeyOrigin {
        match field.trim().parse::<u32>().unwrap_or(u32::MAX) {
            0 => KeyOrigin::Unknown,
            1 | 2 => KeyOrigin::KeyServer,
            3 => KeyOrigin::Dane,
            4 => KeyOrigin::Wkd,
            5 => KeyOrigin::Url,
            6 => KeyOrigin::File,
            7 => KeyOrigin::SelfGenerated,
            _ => KeyOrigin::Other,
        }
    }
}

/// Kind of a freshly created signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigMode {
    Normal,
    Detach,
    Clear,
}
