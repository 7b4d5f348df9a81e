//! Signing status handling: created signatures and invalid signers.

use std::sync::Arc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::ops::{self, passphrase, progress, InvalidKey, OpDataKind};
use crate::status::StatusCode;
use crate::types::{Protocol, SigMode};
use crate::util;

/// One SIG_CREATED record.
#[derive(Debug, Clone)]
pub struct NewSignature {
    pub mode: SigMode,
    pub pubkey_algo: i32,
    pub hash_algo: i32,
    pub sig_class: u32,
    pub timestamp: i64,
    pub fpr: String,
}

#[derive(Debug, Clone, Default)]
pub struct SignResult {
    pub invalid_signers: Vec<InvalidKey>,
    pub signatures: Vec<NewSignature>,
}

#[derive(Default)]
pub struct SignOp {
    pub result: SignResult,
    failure_code: Option<Error>,
    key_considered: Option<(String, u32)>,
    /// A combined sign+encrypt run on CMS has no use for INV_RECP
    /// lines once an INV_SGNR was seen.
    ignore_inv_recp: bool,
    inv_sgnr_seen: bool,
    sig_created_seen: bool,
}

pub fn init_result(ctx: &Arc<Context>) -> Result<()> {
    let ignore_inv_recp = ctx.protocol() == Protocol::Cms;
    let hook =
        ctx.op_data_lookup::<SignOp>(OpDataKind::Sign, true).ok_or(Error::InvValue)?;
    let mut opd = hook.lock().unwrap();
    opd.ignore_inv_recp = ignore_inv_recp;
    opd.inv_sgnr_seen = false;
    opd.sig_created_seen = false;
    Ok(())
}

/// SIG_CREATED: `<kind> <pkalgo> <hashalgo> <class> <timestamp> <fpr>`.
fn parse_sig_created(args: &str) -> Result<NewSignature> {
    let fields = util::split_fields(args);
    let kind = *fields.first().ok_or(Error::InvEngine)?;
    let mode = match kind {
        "S" => SigMode::Normal,
        "D" => SigMode::Detach,
        "C" => SigMode::Clear,
        _ => return Err(Error::InvEngine),
    };

    let pubkey_algo =
        fields.get(1).and_then(|f| f.parse().ok()).ok_or(Error::InvEngine)?;
    let hash_algo = fields.get(2).and_then(|f| f.parse().ok()).ok_or(Error::InvEngine)?;

    let class_field = *fields.get(3).ok_or(Error::InvEngine)?;
    // The class arrives as "00", "0x1f" or bare "1F"; the bare 1F form
    // maps to an otherwise unused class value so it is not mistaken
    // for class 1.
    let sig_class = if let Some(hex) = class_field.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).map_err(|_| Error::InvEngine)?
    } else if class_field.eq_ignore_ascii_case("1f") {
        131
    } else {
        class_field.parse().map_err(|_| Error::InvEngine)?
    };

    let timestamp = util::parse_timestamp(fields.get(4).ok_or(Error::InvEngine)?)
        .map_err(|_| Error::InvEngine)?;
    let fpr = fields.get(5).filter(|f| !f.is_empty()).ok_or(Error::InvEngine)?;

    Ok(NewSignature { mode, pubkey_algo, hash_algo, sig_class, timestamp, fpr: fpr.to_string() })
}

pub fn status_handler(ctx: &Arc<Context>, code: StatusCode, args: &str) -> Result<()> {
    passphrase::status_handler(ctx, code, args)?;

    let hook = ctx.op_data_lookup::<SignOp>(OpDataKind::Sign, false).ok_or(Error::InvValue)?;
    let mut opd = hook.lock().unwrap();

    match code {
        StatusCode::SigCreated => {
            opd.sig_created_seen = true;
            let sig = parse_sig_created(args)?;
            opd.result.signatures.push(sig);
        }

        StatusCode::KeyConsidered => {
            opd.key_considered = Some(ops::parse_key_considered(args)?);
        }

        StatusCode::InvRecp | StatusCode::InvSgnr => {
            if code == StatusCode::InvRecp && opd.inv_sgnr_seen && opd.ignore_inv_recp {
                return Ok(());
            }
            if code == StatusCode::InvSgnr {
                opd.inv_sgnr_seen = true;
            }
            let cached = opd.key_considered.take();
            let invalid = ops::parse_inv_recp(
                args,
                cached.as_ref().map(|(fpr, flags)| (fpr.as_str(), *flags)),
            )?;
            opd.result.invalid_signers.push(invalid);
        }

        StatusCode::Failure => {
            if let Some(code) = ops::parse_failure(args)? {
                if opd.failure_code.is_none() || opd.failure_code == Some(Error::General) {
                    opd.failure_code = Some(code);
                }
            }
        }

        StatusCode::Eof => {
            // The UI server protocol sends no signature information at
            // all, so its silence is not an error.
            if !opd.result.invalid_signers.is_empty() {
                return Err(Error::UnusableSeckey);
            }
            if !opd.sig_created_seen && ctx.protocol() != Protocol::UiServer {
                return Err(opd.failure_code.unwrap_or(Error::General));
            }
        }

        StatusCode::InquireMaxlen => {
            drop(opd);
            ctx.call_status_cb("INQUIRE_MAXLEN", args)?;
        }

        _ => {}
    }
    Ok(())
}

pub fn composed_status_handler(ctx: &Arc<Context>, code: StatusCode, args: &str) -> Result<()> {
    progress::status_handler(ctx, code, args)?;
    status_handler(ctx, code, args)
}

/// Snapshot the signing result.  If not every configured signer
/// produced a signature or an invalid-signer record, the message is
/// incomplete and even the created signatures are not safe to use:
/// they are all demoted into the invalid-signers list.
pub fn result(ctx: &Arc<Context>) -> Option<SignResult> {
    let hook = ctx.op_data_lookup::<SignOp>(OpDataKind::Sign, false)?;
    let mut result = hook.lock().unwrap().result.clone();

    let signers = ctx.signers_count();
    if signers > 0 && result.signatures.len() + result.invalid_signers.len() != signers {
        for sig in result.signatures.drain(..) {
            result.invalid_signers.push(InvalidKey {
                fpr: Some(sig.fpr),
                reason: Some(Error::General),
            });
        }
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;

    fn signer_key(fpr: &str) -> Arc<Key> {
        let mut key = Key::new();
        key.fpr = Some(fpr.to_string());
        Arc::new(key)
    }

    #[test]
    fn sig_created_line_is_parsed_fully() {
        let sig = parse_sig_created("S 1 8 00 1704067200 FPRONE").unwrap();
        assert_eq!(sig.mode, SigMode::Normal);
        assert_eq!(sig.pubkey_algo, 1);
        assert_eq!(sig.hash_algo, 8);
        assert_eq!(sig.sig_class, 0);
        assert_eq!(sig.timestamp, 1704067200);
        assert_eq!(sig.fpr, "FPRONE");

        assert_eq!(parse_sig_created("D 1 8 01 0 F").unwrap().mode, SigMode::Detach);
        assert_eq!(parse_sig_created("C 1 8 01 0 F").unwrap().mode, SigMode::Clear);
        assert!(parse_sig_created("X 1 8 01 0 F").is_err());
    }

    #[test]
    fn two_signers_one_bad_passphrase_demotes_created() {
        let ctx = Context::new();
        ctx.signers_add(signer_key("FPRONE"));
        ctx.signers_add(signer_key("FPRTWO"));
        init_result(&ctx).unwrap();

        let lines: &[(StatusCode, &str)] = &[
            (StatusCode::UseridHint, "AAAA user1"),
            (StatusCode::GoodPassphrase, ""),
            (StatusCode::SigCreated, "S 1 8 00 1704067200 FPRONE"),
            (StatusCode::UseridHint, "BBBB user2"),
            (StatusCode::BadPassphrase, "BBBB"),
            (StatusCode::MissingPassphrase, ""),
        ];
        for (code, args) in lines {
            status_handler(&ctx, *code, args).unwrap();
        }
        // The passphrase tracker aborts the run at the end of stream.
        assert_eq!(status_handler(&ctx, StatusCode::Eof, ""), Err(Error::BadPassphrase));

        let result = result(&ctx).unwrap();
        assert_eq!(result.signatures.len(), 0);
        assert_eq!(result.invalid_signers.len(), 1);
        assert_eq!(result.invalid_signers[0].fpr.as_deref(), Some("FPRONE"));
        assert_eq!(result.invalid_signers[0].reason, Some(Error::General));
    }

    #[test]
    fn complete_signer_set_keeps_signatures() {
        let ctx = Context::new();
        ctx.signers_add(signer_key("FPRONE"));
        init_result(&ctx).unwrap();
        status_handler(&ctx, StatusCode::SigCreated, "S 1 8 00 1704067200 FPRONE").unwrap();
        status_handler(&ctx, StatusCode::Eof, "").unwrap();
        let result = result(&ctx).unwrap();
        assert_eq!(result.signatures.len(), 1);
        assert!(result.invalid_signers.is_empty());
    }

    #[test]
    fn invalid_signer_reported_as_unusable_seckey() {
        let ctx = Context::new();
        ctx.signers_add(signer_key("FPRONE"));
        init_result(&ctx).unwrap();
        status_handler(&ctx, StatusCode::InvSgnr, "9 FPRONE").unwrap();
        assert_eq!(status_handler(&ctx, StatusCode::Eof, ""), Err(Error::UnusableSeckey));
        let result = result(&ctx).unwrap();
        assert_eq!(result.invalid_signers[0].reason, Some(Error::NoSeckey));
    }

    #[test]
    fn cms_suppresses_inv_recp_after_inv_sgnr() {
        let ctx = Context::new();
        ctx.set_protocol(Protocol::Cms).unwrap();
        init_result(&ctx).unwrap();
        status_handler(&ctx, StatusCode::InvSgnr, "9 AAAA").unwrap();
        status_handler(&ctx, StatusCode::InvRecp, "1 BBBB").unwrap();
        let result = result(&ctx).unwrap();
        // Only the signer made it into the list.
        assert_eq!(result.invalid_signers.len(), 1);
        assert_eq!(result.invalid_signers[0].fpr.as_deref(), Some("AAAA"));
    }
}
