//! Per-operation status machinery.
//!
//! Every operation keeps its state and result in an op-data slot on
//! the context and installs a status handler that is a composition of
//! the primitives in this module and the operation specific parsing in
//! the submodules.

pub mod decrypt;
pub mod encrypt;
pub mod export;
pub mod genkey;
pub mod import;
pub mod keylist;
pub mod passphrase;
pub mod progress;
pub mod sign;
pub mod simple;
pub mod verify;

use crate::error::{Error, Result};
use crate::util;

/// The closed set of op-data kinds.  A context holds at most one slot
/// per kind; kinds without an in-core status handler are still listed
/// so external start wrappers can hook their own data in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpDataKind {
    Decrypt,
    Sign,
    Encrypt,
    Passphrase,
    Import,
    Genkey,
    Keylist,
    Edit,
    Verify,
    Trustlist,
    Assuan,
    VfsMount,
    Passwd,
    Export,
    Keysign,
    TofuPolicy,
    QuerySwdb,
    Setexpire,
    Revsig,
    Setownertrust,
}

/// One invalid recipient or signer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidKey {
    pub fpr: Option<String>,
    pub reason: Option<Error>,
}

/// Lenient decimal prefix parse, the way the engines' consumers have
/// always read these fields: garbage counts as zero.
pub(crate) fn atoi_u32(s: &str) -> u32 {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

/// Parse an INV_RECP or INV_SGNR line: `<reason> [<fpr>]`.  When a
/// KEY_CONSIDERED pair was cached immediately before, its flags refine
/// the catch-all reason 0.
pub fn parse_inv_recp(args: &str, key_considered: Option<(&str, u32)>) -> Result<InvalidKey> {
    let mut parts = args.splitn(2, ' ');
    let reason_field = parts.next().unwrap_or("");
    let reason: u32 = reason_field.parse().map_err(|_| Error::InvEngine)?;

    let reason = match reason {
        0 => {
            if key_considered.map_or(false, |(_, flags)| flags & 2 != 0) {
                Error::SubkeysExpOrRev
            } else {
                Error::General
            }
        }
        1 => Error::NoPubkey,
        2 => Error::AmbiguousName,
        3 => Error::WrongKeyUsage,
        4 => Error::CertRevoked,
        5 => Error::CertExpired,
        6 => Error::NoCrlKnown,
        7 => Error::CrlTooOld,
        8 => Error::NoPolicyMatch,
        9 => Error::NoSeckey,
        10 => Error::PubkeyNotTrusted,
        11 => Error::MissingCert,
        12 => Error::MissingIssuerCert,
        13 => Error::KeyDisabled,
        14 => Error::InvUserId,
        _ => Error::General,
    };

    let fpr = parts.next().map(str::trim).filter(|t| !t.is_empty()).map(str::to_string);
    Ok(InvalidKey { fpr, reason: Some(reason) })
}

/// Parse a KEY_CONSIDERED line: `<fpr> <flags>`.
pub fn parse_key_considered(args: &str) -> Result<(String, u32)> {
    let mut parts = args.split(' ').filter(|p| !p.is_empty());
    let fpr = parts.next().filter(|f| !f.is_empty()).ok_or(Error::InvEngine)?;
    let flags = parts.next().ok_or(Error::InvEngine)?;
    let flags = flags.parse::<u32>().map_err(|_| Error::InvEngine)?;
    Ok((fpr.to_string(), flags))
}

/// Parse a FAILURE line: `<where> <errno>`.  Failures reported by
/// gpg-exit are too troublesome to attribute and are dropped.
pub fn parse_failure(args: &str) -> Result<Option<Error>> {
    if args.starts_with("gpg-exit") {
        return Ok(None);
    }
    let (_, which) = args.split_once(' ').ok_or(Error::InvEngine)?;
    let which = which.split(' ').next().unwrap_or("");
    Ok(Error::from_raw(atoi_u32(which)))
}

/// Parse an ERROR line: `<where> <errno> [<extra>]`.  Returns the
/// location and the mapped error; which locations matter is up to each
/// handler.
pub fn parse_error_line(args: &str) -> Result<(&str, Option<Error>)> {
    let (location, rest) = args.split_once(' ').ok_or(Error::InvEngine)?;
    let which = rest.split(' ').next().unwrap_or("");
    Ok((location, Error::from_raw(atoi_u32(which))))
}

/// Outcome of a PLAINTEXT line: `<hex-type> <timestamp> [<filename>]`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PlaintextInfo {
    pub is_mime: bool,
    pub file_name: Option<String>,
}

/// Parse a PLAINTEXT line.  The type byte 6D marks MIME output; the
/// optional file name is percent decoded.
pub fn parse_plaintext(args: &str) -> Result<PlaintextInfo> {
    let mut info = PlaintextInfo::default();
    let mut fields = args.split(' ').filter(|f| !f.is_empty());

    let Some(file_type) = fields.next() else { return Ok(info) };
    if file_type.as_bytes().first() == Some(&b'6') && file_type.as_bytes().get(1) == Some(&b'D') {
        info.is_mime = true;
    }
    // The second field is the timestamp; the consumer has no use for it.
    let _ = fields.next();
    if let Some(name) = fields.next() {
        info.file_name = Some(util::decode_percent_string(name)?);
    }
    Ok(info)
}
