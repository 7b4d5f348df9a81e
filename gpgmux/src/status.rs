//! The status-line tag table.
//!
//! Engines talk to us with `TAG args` lines on their status channel.
//! The tag set is fixed; lookup is a binary search over a table that is
//! kept lexicographically sorted ('_' sorts after any letter, which is
//! plain byte order in ASCII, so `str` comparison does the right
//! thing).  Unknown tags are ignored by the dispatch.

/// Status codes delivered to the per-operation handlers.  `Eof` is
/// synthesized by the engine when the status channel closes; it has no
/// wire representation and therefore no table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum StatusCode {
    Eof,
    Abort,
    AlreadySigned,
    Attribute,
    BackupKeyCreated,
    BadPassphrase,
    Badarmor,
    Badmdc,
    Badsig,
    BeginDecryption,
    BeginEncryption,
    BeginSigning,
    BeginStream,
    Cardctrl,
    DecryptionComplianceMode,
    DecryptionFailed,
    DecryptionInfo,
    DecryptionOkay,
    DeleteProblem,
    EncTo,
    EndDecryption,
    EndEncryption,
    EndStream,
    Enter,
    Errmdc,
    Error,
    Errsig,
    Expkeysig,
    Expsig,
    Failure,
    FileDone,
    FileError,
    FileStart,
    GetBool,
    GetHidden,
    GetLine,
    GoodPassphrase,
    Goodmdc,
    Goodsig,
    GotIt,
    ImportOk,
    ImportProblem,
    ImportRes,
    Imported,
    InquireMaxlen,
    InvRecp,
    InvSgnr,
    KeyConsidered,
    KeyCreated,
    KeyNotCreated,
    Keyexpired,
    Keyrevoked,
    Leave,
    MissingPassphrase,
    Mountpoint,
    NeedPassphrase,
    NeedPassphrasePin,
    NeedPassphraseSym,
    Newsig,
    NoPubkey,
    NoRecp,
    NoSeckey,
    NoSgnr,
    Nodata,
    NotationData,
    NotationFlags,
    NotationName,
    PinentryLaunched,
    PkaTrustBad,
    PkaTrustGood,
    Plaintext,
    PlaintextLength,
    PolicyUrl,
    Progress,
    Revkeysig,
    RsaOrIdea,
    ScOpFailure,
    ScOpSuccess,
    SessionKey,
    ShmGet,
    ShmGetBool,
    ShmGetHidden,
    ShmInfo,
    SigCreated,
    SigId,
    SigSubpacket,
    Sigexpired,
    Success,
    TofuStats,
    TofuStatsLong,
    TofuUser,
    Truncated,
    TrustFully,
    TrustMarginal,
    TrustNever,
    TrustUltimate,
    TrustUndefined,
    Unexpected,
    UseridHint,
    Validsig,
    VerificationComplianceMode,
}

/// Sorted by tag name.  A unit test asserts the ordering so a careless
/// insertion shows up immediately.
static STATUS_TABLE: &[(&str, StatusCode)] = &[
    ("ABORT", StatusCode::Abort),
    ("ALREADY_SIGNED", StatusCode::AlreadySigned),
    ("ATTRIBUTE", StatusCode::Attribute),
    ("BACKUP_KEY_CREATED", StatusCode::BackupKeyCreated),
    ("BADARMOR", StatusCode::Badarmor),
    ("BADMDC", StatusCode::Badmdc),
    ("BADSIG", StatusCode::Badsig),
    ("BAD_PASSPHRASE", StatusCode::BadPassphrase),
    ("BEGIN_DECRYPTION", StatusCode::BeginDecryption),
    ("BEGIN_ENCRYPTION", StatusCode::BeginEncryption),
    ("BEGIN_SIGNING", StatusCode::BeginSigning),
    ("BEGIN_STREAM", StatusCode::BeginStream),
    ("CARDCTRL", StatusCode::Cardctrl),
    ("DECRYPTION_COMPLIANCE_MODE", StatusCode::DecryptionComplianceMode),
    ("DECRYPTION_FAILED", StatusCode::DecryptionFailed),
    ("DECRYPTION_INFO", StatusCode::DecryptionInfo),
    ("DECRYPTION_OKAY", StatusCode::DecryptionOkay),
    ("DELETE_PROBLEM", StatusCode::DeleteProblem),
    ("ENC_TO", StatusCode::EncTo),
    ("END_DECRYPTION", StatusCode::EndDecryption),
    ("END_ENCRYPTION", StatusCode::EndEncryption),
    ("END_STREAM", StatusCode::EndStream),
    ("ENTER", StatusCode::Enter),
    ("ERRMDC", StatusCode::Errmdc),
    ("ERROR", StatusCode::Error),
    ("ERRSIG", StatusCode::Errsig),
    ("EXPKEYSIG", StatusCode::Expkeysig),
    ("EXPSIG", StatusCode::Expsig),
    ("FAILURE", StatusCode::Failure),
    ("FILE_DONE", StatusCode::FileDone),
    ("FILE_ERROR", StatusCode::FileError),
    ("FILE_START", StatusCode::FileStart),
    ("GET_BOOL", StatusCode::GetBool),
    ("GET_HIDDEN", StatusCode::GetHidden),
    ("GET_LINE", StatusCode::GetLine),
    ("GOODMDC", StatusCode::Goodmdc),
    ("GOODSIG", StatusCode::Goodsig),
    ("GOOD_PASSPHRASE", StatusCode::GoodPassphrase),
    ("GOT_IT", StatusCode::GotIt),
    ("IMPORTED", StatusCode::Imported),
    ("IMPORT_OK", StatusCode::ImportOk),
    ("IMPORT_PROBLEM", StatusCode::ImportProblem),
    ("IMPORT_RES", StatusCode::ImportRes),
    ("INQUIRE_MAXLEN", StatusCode::InquireMaxlen),
    ("INV_RECP", StatusCode::InvRecp),
    ("INV_SGNR", StatusCode::InvSgnr),
    ("KEYEXPIRED", StatusCode::Keyexpired),
    ("KEYREVOKED", StatusCode::Keyrevoked),
    ("KEY_CONSIDERED", StatusCode::KeyConsidered),
    ("KEY_CREATED", StatusCode::KeyCreated),
    ("KEY_NOT_CREATED", StatusCode::KeyNotCreated),
    ("LEAVE", StatusCode::Leave),
    ("MISSING_PASSPHRASE", StatusCode::MissingPassphrase),
    ("MOUNTPOINT", StatusCode::Mountpoint),
    ("NEED_PASSPHRASE", StatusCode::NeedPassphrase),
    ("NEED_PASSPHRASE_PIN", StatusCode::NeedPassphrasePin),
    ("NEED_PASSPHRASE_SYM", StatusCode::NeedPassphraseSym),
    ("NEWSIG", StatusCode::Newsig),
    ("NODATA", StatusCode::Nodata),
    ("NOTATION_DATA", StatusCode::NotationData),
    ("NOTATION_FLAGS", StatusCode::NotationFlags),
    ("NOTATION_NAME", StatusCode::NotationName),
    ("NO_PUBKEY", StatusCode::NoPubkey),
    ("NO_RECP", StatusCode::NoRecp),
    ("NO_SECKEY", StatusCode::NoSeckey),
    ("NO_SGNR", StatusCode::NoSgnr),
    ("PINENTRY_LAUNCHED", StatusCode::PinentryLaunched),
    ("PKA_TRUST_BAD", StatusCode::PkaTrustBad),
    ("PKA_TRUST_GOOD", StatusCode::PkaTrustGood),
    ("PLAINTEXT", StatusCode::Plaintext),
    ("PLAINTEXT_LENGTH", StatusCode::PlaintextLength),
    ("POLICY_URL", StatusCode::PolicyUrl),
    ("PROGRESS", StatusCode::Progress),
    ("REVKEYSIG", StatusCode::Revkeysig),
    ("RSA_OR_IDEA", StatusCode::RsaOrIdea),
    ("SC_OP_FAILURE", StatusCode::ScOpFailure),
    ("SC_OP_SUCCESS", StatusCode::ScOpSuccess),
    ("SESSION_KEY", StatusCode::SessionKey),
    ("SHM_GET", StatusCode::ShmGet),
    ("SHM_GET_BOOL", StatusCode::ShmGetBool),
    ("SHM_GET_HIDDEN", StatusCode::ShmGetHidden),
    ("SHM_INFO", StatusCode::ShmInfo),
    ("SIGEXPIRED", StatusCode::Sigexpired),
    ("SIG_CREATED", StatusCode::SigCreated),
    ("SIG_ID", StatusCode::SigId),
    ("SIG_SUBPACKET", StatusCode::SigSubpacket),
    ("SUCCESS", StatusCode::Success),
    ("TOFU_STATS", StatusCode::TofuStats),
    ("TOFU_STATS_LONG", StatusCode::TofuStatsLong),
    ("TOFU_USER", StatusCode::TofuUser),
    ("TRUNCATED", StatusCode::Truncated),
    ("TRUST_FULLY", StatusCode::TrustFully),
    ("TRUST_MARGINAL", StatusCode::TrustMarginal),
    ("TRUST_NEVER", StatusCode::TrustNever),
    ("TRUST_ULTIMATE", StatusCode::TrustUltimate),
    ("TRUST_UNDEFINED", StatusCode::TrustUndefined),
    ("UNEXPECTED", StatusCode::Unexpected),
    ("USERID_HINT", StatusCode::UseridHint),
    ("VALIDSIG", StatusCode::Validsig),
    ("VERIFICATION_COMPLIANCE_MODE", StatusCode::VerificationComplianceMode),
];

impl StatusCode {
    /// Look up a tag name.  Unknown tags yield `None` and are skipped
    /// by the caller.
    pub fn from_name(name: &str) -> Option<StatusCode> {
        STATUS_TABLE
            .binary_search_by(|(tag, _)| (*tag).cmp(name))
            .ok()
            .map(|idx| STATUS_TABLE[idx].1)
    }

    /// The wire name of this code; `Eof` has none.
    pub fn name(self) -> Option<&'static str> {
        STATUS_TABLE
            .iter()
            .find(|(_, code)| *code == self)
            .map(|(tag, _)| *tag)
    }
}

/// Split a raw status line into its tag and argument part.  A stray CR
/// before the line end is stripped; the tag must be a known one.
pub fn parse_status_line(line: &str) -> Option<(StatusCode, &str)> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let (tag, args) = match line.split_once(' ') {
        Some((tag, args)) => (tag, args),
        None => (line, ""),
    };
    StatusCode::from_name(tag).map(|code| (code, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn table_is_sorted() {
        for pair in STATUS_TABLE.windows(2) {
            assert!(pair[0].0 < pair[1].0, "{} !< {}", pair[0].0, pair[1].0);
        }
    }

    #[test]
    fn lookup_is_a_bijection() {
        let mut codes = HashSet::new();
        for (name, code) in STATUS_TABLE {
            assert_eq!(StatusCode::from_name(name), Some(*code));
            assert_eq!(code.name(), Some(*name));
            assert!(codes.insert(*code), "duplicate code for {}", name);
        }
        assert_eq!(codes.len(), STATUS_TABLE.len());
        assert_eq!(StatusCode::from_name("NO_SUCH_TAG"), None);
        assert_eq!(StatusCode::Eof.name(), None);
    }

    #[test]
    fn line_splitting() {
        assert_eq!(
            parse_status_line("GOODSIG ABCD1234 alice"),
            Some((StatusCode::Goodsig, "ABCD1234 alice"))
        );
        assert_eq!(parse_status_line("NEWSIG"), Some((StatusCode::Newsig, "")));
        assert_eq!(parse_status_line("NEWSIG\r"), Some((StatusCode::Newsig, "")));
        assert_eq!(parse_status_line("BOGUS args"), None);
    }
}
