//! Error codes shared by the library and the backend engines.
//!
//! The engines report errors on their status channel as decimal numbers
//! carrying a source identifier in the high bits; [`Error::from_raw`]
//! strips the source and maps the code part onto this enum.  Codes we
//! have no dedicated variant for are preserved in [`Error::Other`] so
//! that nothing is silently collapsed to a generic error.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Mask for the code part of a raw engine error value.  The remaining
/// high bits identify the reporting component and are not interesting
/// to callers.
const CODE_MASK: u32 = 0xffff;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Error {
    #[error("general error")]
    General,
    #[error("bad signature")]
    BadSignature,
    #[error("no public key")]
    NoPubkey,
    #[error("checksum error")]
    Checksum,
    #[error("bad passphrase")]
    BadPassphrase,
    #[error("no secret key")]
    NoSeckey,
    #[error("bad certificate")]
    BadCert,
    #[error("invalid user id")]
    InvUserId,
    #[error("unexpected data")]
    Unexpected,
    #[error("usable public key required")]
    UnusablePubkey,
    #[error("usable secret key required")]
    UnusableSeckey,
    #[error("invalid value")]
    InvValue,
    #[error("invalid flag")]
    InvFlag,
    #[error("bad certificate chain")]
    BadCertChain,
    #[error("missing certificate")]
    MissingCert,
    #[error("missing issuer certificate")]
    MissingIssuerCert,
    #[error("no data")]
    NoData,
    #[error("not supported")]
    NotSupported,
    #[error("internal error")]
    Internal,
    #[error("not implemented")]
    NotImplemented,
    #[error("conflicting use")]
    Conflict,
    #[error("bad data")]
    BadData,
    #[error("certificate revoked")]
    CertRevoked,
    #[error("no CRL known")]
    NoCrlKnown,
    #[error("CRL too old")]
    CrlTooOld,
    #[error("operation cancelled")]
    Canceled,
    #[error("operation fully cancelled")]
    FullyCanceled,
    #[error("certificate expired")]
    CertExpired,
    #[error("ambiguous name")]
    AmbiguousName,
    #[error("no policy match")]
    NoPolicyMatch,
    #[error("unsupported protocol")]
    UnsupportedProtocol,
    #[error("wrong key usage")]
    WrongKeyUsage,
    #[error("unsupported algorithm")]
    UnsupportedAlgorithm,
    #[error("invalid engine response")]
    InvEngine,
    #[error("public key not trusted")]
    PubkeyNotTrusted,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("key expired")]
    KeyExpired,
    #[error("signature expired")]
    SigExpired,
    #[error("duplicated value")]
    DupValue,
    #[error("duplicated key")]
    DupKey,
    #[error("no key")]
    NoKey,
    #[error("key disabled")]
    KeyDisabled,
    #[error("subkeys expired or revoked")]
    SubkeysExpOrRev,
    #[error("premature end of stream")]
    Eof,
    #[error("system error (errno {0})")]
    Sys(i32),
    #[error("engine error code {0}")]
    Other(u16),
}

impl Error {
    /// Map a raw numeric error value from an ERROR or FAILURE status
    /// line onto an [`Error`].  A code of zero means "no error" and is
    /// reported as `None`.
    pub fn from_raw(raw: u32) -> Option<Error> {
        let code = raw & CODE_MASK;
        Some(match code {
            0 => return None,
            1 => Error::General,
            8 => Error::BadSignature,
            9 => Error::NoPubkey,
            10 => Error::Checksum,
            11 => Error::BadPassphrase,
            17 => Error::NoSeckey,
            36 => Error::BadCert,
            37 => Error::InvUserId,
            38 => Error::Unexpected,
            53 => Error::UnusablePubkey,
            54 => Error::UnusableSeckey,
            55 => Error::InvValue,
            56 => Error::BadCertChain,
            57 => Error::MissingCert,
            58 => Error::NoData,
            60 => Error::NotSupported,
            63 => Error::Internal,
            69 => Error::NotImplemented,
            70 => Error::Conflict,
            84 => Error::UnsupportedAlgorithm,
            89 => Error::BadData,
            94 => Error::CertRevoked,
            95 => Error::NoCrlKnown,
            96 => Error::CrlTooOld,
            99 => Error::Canceled,
            101 => Error::CertExpired,
            107 => Error::AmbiguousName,
            116 => Error::NoPolicyMatch,
            121 => Error::UnsupportedProtocol,
            125 => Error::WrongKeyUsage,
            150 => Error::InvEngine,
            151 => Error::PubkeyNotTrusted,
            152 => Error::DecryptFailed,
            153 => Error::KeyExpired,
            154 => Error::SigExpired,
            157 => Error::DupValue,
            185 => Error::MissingIssuerCert,
            189 => Error::DupKey,
            198 => Error::FullyCanceled,
            252 => Error::KeyDisabled,
            16383 => Error::Eof,
            other => Error::Other(other as u16),
        })
    }

    /// Parse the decimal error number used on status lines.  Returns
    /// `None` for `0`, a parse failure maps to [`Error::InvEngine`].
    pub fn parse_field(field: &str) -> Result<Option<Error>> {
        match field.parse::<u32>() {
            Ok(raw) => Ok(Error::from_raw(raw)),
            Err(_) => Err(Error::InvEngine),
        }
    }

    /// The last OS error, as reported by errno.
    pub fn last_os_error() -> Error {
        Error::Sys(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Sys(err.raw_os_error().unwrap_or(0))
    }
}
