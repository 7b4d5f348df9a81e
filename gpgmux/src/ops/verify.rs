//! Signature verification status machine.
//!
//! Verification produces one record per signature.  NEWSIG opens a
//! record (or reuses an empty one), the GOODSIG family fills in the
//! status, VALIDSIG the fingerprint and algorithms, TRUST_* the
//! validity, and the notation and TOFU lines annotate further.  The
//! summary bitmask is distilled when a record is closed.

use std::sync::Arc;

use log::trace;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::key::{Key, TofuInfo};
use crate::notation::{NotationFlags, SignatureNotation};
use crate::ops::{self, progress, OpDataKind};
use crate::status::StatusCode;
use crate::types::{Protocol, SigSummary, Validity};
use crate::util;

#[derive(Debug, Clone, Default)]
pub struct Signature {
    pub summary: SigSummary,
    /// Fingerprint or key id of the signer.
    pub fpr: Option<String>,
    /// None is a good signature.
    pub status: Option<Error>,
    pub notations: Vec<SignatureNotation>,
    pub timestamp: i64,
    pub exp_timestamp: i64,
    pub wrong_key_usage: bool,
    /// 0 = not queried, 1 = bad, 2 = good.
    pub pka_trust: u8,
    pub chain_model: bool,
    pub is_de_vs: bool,
    pub validity: Validity,
    pub validity_reason: Option<Error>,
    pub pubkey_algo: i32,
    pub hash_algo: i32,
    pub pka_address: Option<String>,
    /// Key material gathered from TOFU_USER lines.
    pub key: Option<Key>,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyResult {
    pub signatures: Vec<Signature>,
    pub file_name: Option<String>,
    pub is_mime: bool,
}

#[derive(Default)]
pub struct VerifyOp {
    pub result: VerifyResult,
    failure_code: Option<Error>,
    /// Index of the signature under construction.
    current: Option<usize>,
    did_prepare_new_sig: bool,
    only_newsig_seen: bool,
    plaintext_seen: u32,
    conflict_user_seen: bool,
}

/// Create the verify op-data slot.
pub fn init_result(ctx: &Arc<Context>) -> Result<()> {
    ctx.op_data_lookup::<VerifyOp>(OpDataKind::Verify, true).ok_or(Error::InvValue)?;
    Ok(())
}

/// Distill the summary bitmask from validity, status and the
/// auxiliary flags.  VALID is only set when the summary is exactly
/// GREEN.
fn calc_sig_summary(sig: &mut Signature) {
    let mut sum = SigSummary::empty();

    let benign = matches!(sig.status, None | Some(Error::SigExpired) | Some(Error::KeyExpired));
    if matches!(sig.validity, Validity::Full | Validity::Ultimate) {
        if benign {
            sum |= SigSummary::GREEN;
        }
    } else if sig.validity == Validity::Never {
        if benign {
            sum |= SigSummary::RED;
        }
    } else if sig.status == Some(Error::BadSignature) {
        sum |= SigSummary::RED;
    }

    match sig.status {
        Some(Error::SigExpired) => sum |= SigSummary::SIG_EXPIRED,
        Some(Error::KeyExpired) => sum |= SigSummary::KEY_EXPIRED,
        Some(Error::NoPubkey) => sum |= SigSummary::KEY_MISSING,
        Some(Error::CertRevoked) => sum |= SigSummary::KEY_REVOKED,
        Some(Error::BadSignature) | None => {}
        Some(_) => sum |= SigSummary::SYS_ERROR,
    }

    match sig.validity_reason {
        Some(Error::CrlTooOld) => {
            if sig.validity == Validity::Unknown {
                sum |= SigSummary::CRL_TOO_OLD;
            }
        }
        Some(Error::CertRevoked) => sum |= SigSummary::KEY_REVOKED,
        _ => {}
    }

    if sig.wrong_key_usage {
        sum |= SigSummary::BAD_POLICY;
    }

    if sum == SigSummary::GREEN {
        sum |= SigSummary::VALID;
    }
    sig.summary = sum;
}

/// Open a signature record for the data that follows, reusing the
/// previous record if it only ever saw a NEWSIG.
fn prepare_new_sig(opd: &mut VerifyOp) {
    if opd.only_newsig_seen {
        if let Some(idx) = opd.current {
            opd.result.signatures[idx] = Signature::default();
            opd.did_prepare_new_sig = true;
            opd.only_newsig_seen = false;
            return;
        }
    }
    opd.result.signatures.push(Signature::default());
    opd.current = Some(opd.result.signatures.len() - 1);
    opd.did_prepare_new_sig = true;
    opd.only_newsig_seen = false;
}

/// Handle the GOODSIG/EXPSIG/EXPKEYSIG/BADSIG/ERRSIG/REVKEYSIG family.
fn parse_new_sig(
    opd: &mut VerifyOp,
    code: StatusCode,
    args: &str,
    _protocol: Protocol,
) -> Result<()> {
    if !opd.did_prepare_new_sig {
        prepare_new_sig(opd);
    }
    opd.did_prepare_new_sig = false;

    let idx = opd.current.ok_or(Error::InvEngine)?;
    let sig = &mut opd.result.signatures[idx];

    let fields = util::split_fields(args);
    let keyid = fields.first().copied().unwrap_or("");
    let mut got_fpr = false;

    match code {
        StatusCode::Goodsig => sig.status = None,
        StatusCode::Expsig => sig.status = Some(Error::SigExpired),
        StatusCode::Expkeysig => sig.status = Some(Error::KeyExpired),
        StatusCode::Badsig => sig.status = Some(Error::BadSignature),
        StatusCode::Revkeysig => sig.status = Some(Error::CertRevoked),
        StatusCode::Errsig => {
            // <keyid> <pkalgo> <hashalgo> <class> <timestamp> <rc> [<fpr>]
            let parsed = (|| -> Result<()> {
                let pkalgo = fields.get(1).ok_or(Error::General)?;
                sig.pubkey_algo = pkalgo.parse().map_err(|_| Error::General)?;
                let hashalgo = fields.get(2).ok_or(Error::General)?;
                sig.hash_algo = hashalgo.parse().map_err(|_| Error::General)?;
                // Field 3 is the sig class; not interesting here.
                let timestamp = fields.get(4).ok_or(Error::General)?;
                sig.timestamp = util::parse_timestamp(timestamp).map_err(|_| Error::InvEngine)?;
                let rc = fields.get(5).ok_or(Error::General)?;
                sig.status = Error::from_raw(rc.parse().map_err(|_| Error::General)?);
                if let Some(&fpr) = fields.get(6) {
                    if fpr != "-" {
                        sig.fpr = Some(fpr.to_string());
                        got_fpr = true;
                    }
                }
                Ok(())
            })();
            match parsed {
                Ok(()) => {}
                Err(Error::InvEngine) => return Err(Error::InvEngine),
                Err(_) => sig.status = Some(Error::General),
            }
        }
        _ => return Err(Error::General),
    }

    if !keyid.is_empty() && !got_fpr {
        sig.fpr = Some(keyid.to_string());
    }
    Ok(())
}

/// VALIDSIG: `<fpr> <date> <timestamp> <exp> <version> <reserved>
/// <pkalgo> <hashalgo> ...`.  The fingerprint replaces the key id
/// taken from the earlier GOODSIG.
fn parse_valid_sig(sig: &mut Signature, args: &str) -> Result<()> {
    let fields = util::split_fields(args);
    let fpr = fields.first().filter(|f| !f.is_empty()).ok_or(Error::General)?;
    sig.fpr = Some(fpr.to_string());

    if let Some(timestamp) = fields.get(2) {
        sig.timestamp = util::parse_timestamp(timestamp).map_err(|_| Error::InvEngine)?;
    }
    if let Some(exp) = fields.get(3) {
        sig.exp_timestamp = util::parse_timestamp(exp).map_err(|_| Error::InvEngine)?;
    }
    // Fields 4 and 5 are the signature version and a reserved slot.
    if let Some(pkalgo) = fields.get(6) {
        sig.pubkey_algo = pkalgo.parse().map_err(|_| Error::InvEngine)?;
    }
    if let Some(hashalgo) = fields.get(7) {
        sig.hash_algo = hashalgo.parse().map_err(|_| Error::InvEngine)?;
    }
    Ok(())
}

fn parse_notation(sig: &mut Signature, code: StatusCode, args: &str) -> Result<()> {
    match code {
        StatusCode::NotationName | StatusCode::PolicyUrl => {
            let args = args.split(' ').next().unwrap_or("");
            if sig.notations.iter().any(|n| !n.is_policy_url() && n.value.is_empty()) {
                // A previous notation name never got its data; the
                // backend misbehaves.
                return Err(Error::InvEngine);
            }
            if code == StatusCode::NotationName {
                let name = util::decode_percent(args, false)?;
                let mut notation =
                    SignatureNotation { name: Some(name), ..Default::default() };
                // Default for engines that do not emit NOTATION_FLAGS.
                notation.set_flags(NotationFlags::HUMAN_READABLE);
                sig.notations.push(notation);
            } else {
                let value = util::decode_percent(args, false)?;
                sig.notations.push(SignatureNotation {
                    name: None,
                    value,
                    ..Default::default()
                });
            }
        }
        StatusCode::NotationFlags => {
            let notation = match sig.notations.last_mut() {
                Some(n) if n.name.is_some() => n,
                _ => return Err(Error::InvEngine),
            };
            let fields = util::split_fields(args);
            if fields.len() < 2 {
                return Err(Error::InvEngine);
            }
            let mut flags = NotationFlags::empty();
            if ops::atoi_u32(fields[0]) != 0 {
                flags |= NotationFlags::CRITICAL;
            }
            if ops::atoi_u32(fields[1]) != 0 {
                flags |= NotationFlags::HUMAN_READABLE;
            }
            notation.set_flags(flags);
        }
        StatusCode::NotationData => {
            let notation = match sig.notations.last_mut() {
                Some(n) if n.name.is_some() => n,
                _ => return Err(Error::InvEngine),
            };
            notation.value.extend(util::decode_percent(args, false)?);
        }
        _ => return Err(Error::InvEngine),
    }
    Ok(())
}

fn parse_trust(sig: &mut Signature, code: StatusCode, args: &str) {
    sig.validity = match code {
        StatusCode::TrustNever => Validity::Never,
        StatusCode::TrustMarginal => Validity::Marginal,
        StatusCode::TrustFully | StatusCode::TrustUltimate => Validity::Full,
        _ => Validity::Unknown,
    };

    sig.validity_reason = None;
    sig.chain_model = false;
    let fields = util::split_fields(args);
    if let Some(reason) = fields.first() {
        sig.validity_reason = Error::from_raw(ops::atoi_u32(reason));
        if fields.get(1) == Some(&"chain") {
            sig.chain_model = true;
        }
    }
}

/// TOFU_USER: `<fpr> <addr-spec>`.  Builds up the signature's key
/// object; conflicting fingerprints are reported as `DupValue` so the
/// caller can suppress the statistics that follow.
fn parse_tofu_user(sig: &mut Signature, args: &str, protocol: Protocol) -> Result<()> {
    let (fpr, rest) = args.split_once(' ').ok_or(Error::InvEngine)?;
    if fpr.is_empty() {
        return Err(Error::InvEngine);
    }
    let address = rest.split(' ').next().unwrap_or("");
    if address.is_empty() {
        return Err(Error::InvEngine);
    }
    let address = util::decode_percent_string(address)?;

    match &mut sig.key {
        Some(key) => {
            if key.fpr.as_deref() != Some(fpr) {
                // Newer engines emit one TOFU_USER line per
                // conflicting key; only the first is kept.
                return Err(Error::DupValue);
            }
        }
        None => {
            let mut key = Key::new();
            key.fpr = Some(fpr.to_string());
            key.protocol = protocol;
            sig.key = Some(key);
        }
    }

    let key = sig.key.as_mut().ok_or(Error::Internal)?;
    key.append_name(&address, false);
    if let Some(uid) = key.last_uid_mut() {
        uid.tofu = Some(TofuInfo::default());
    }
    Ok(())
}

/// TOFU_STATS: `<validity> <sign-count> <encr-count> [<policy>
/// [<tm1> <tm2> [<tm3> <tm4>]]]`.
fn parse_tofu_stats(sig: &mut Signature, args: &str) -> Result<()> {
    let ti = sig
        .key
        .as_mut()
        .and_then(|k| k.last_uid_mut())
        .and_then(|u| u.tofu.as_mut())
        .ok_or(Error::InvEngine)?;
    if ti.signfirst != 0 || ti.signcount != 0 || ti.validity != 0 || ti.policy != Default::default()
    {
        return Err(Error::InvEngine);
    }

    let fields = util::split_fields(args);
    if fields.len() < 3 {
        return Err(Error::InvEngine);
    }

    let validity = util::parse_u64_field(fields[0])?;
    if validity > 7 {
        return Err(Error::InvEngine);
    }
    ti.validity = validity as u32;
    ti.signcount = util::parse_u64_field(fields[1])?.min(u16::MAX as u64) as u16;
    ti.encrcount = util::parse_u64_field(fields[2])?.min(u16::MAX as u64) as u16;

    let Some(policy) = fields.get(3) else { return Ok(()) };
    ti.policy = crate::types::TofuPolicy::from_tag(policy);

    if fields.len() == 4 {
        return Ok(());
    }
    // First and last seen timestamps come in pairs or not at all.
    if fields.len() < 6 {
        return Err(Error::InvEngine);
    }
    ti.signfirst = util::parse_u64_field(fields[4])?;
    ti.signlast = util::parse_u64_field(fields[5])?;
    if fields.len() > 7 {
        ti.encrfirst = util::parse_u64_field(fields[6])?;
        ti.encrlast = util::parse_u64_field(fields[7])?;
    }
    Ok(())
}

fn parse_tofu_stats_long(sig: &mut Signature, args: &str, raw: bool) -> Result<()> {
    let ti = sig
        .key
        .as_mut()
        .and_then(|k| k.last_uid_mut())
        .and_then(|u| u.tofu.as_mut())
        .ok_or(Error::InvEngine)?;
    if ti.description.is_some() {
        return Err(Error::InvEngine);
    }
    let mut description = util::decode_percent_string(args)?;
    if !raw {
        // The engine joins words with non-breaking markers.
        description = description.replace('~', " ");
    }
    ti.description = Some(description);
    Ok(())
}

/// ERROR lines during verification.  Only a few locations carry
/// meaning; anything else is informational.
fn parse_error(sig: Option<&mut Signature>, args: &str) -> Result<()> {
    let (location, err) = ops::parse_error_line(args)?;
    if location == "proc_pkt.plaintext" && err == Some(Error::BadData) {
        // A second plaintext packet; the operation cannot be trusted.
        return Err(Error::BadData);
    }
    if let Some(sig) = sig {
        if location == "verify.findkey" {
            sig.status = err;
        } else if location == "verify.keyusage" && err == Some(Error::WrongKeyUsage) {
            sig.wrong_key_usage = true;
        }
    }
    Ok(())
}

/// The verify status handler proper.
pub fn status_handler(ctx: &Arc<Context>, code: StatusCode, args: &str) -> Result<()> {
    let hook = ctx
        .op_data_lookup::<VerifyOp>(OpDataKind::Verify, false)
        .ok_or(Error::InvValue)?;
    let mut guard = hook.lock().unwrap();
    let opd = &mut *guard;

    match code {
        StatusCode::Newsig => {
            if let Some(idx) = opd.current {
                calc_sig_summary(&mut opd.result.signatures[idx]);
            }
            prepare_new_sig(opd);
            opd.only_newsig_seen = true;
            opd.conflict_user_seen = false;
        }

        StatusCode::Goodsig
        | StatusCode::Expsig
        | StatusCode::Expkeysig
        | StatusCode::Badsig
        | StatusCode::Errsig
        | StatusCode::Revkeysig => {
            if let Some(idx) = opd.current {
                if !opd.did_prepare_new_sig {
                    calc_sig_summary(&mut opd.result.signatures[idx]);
                }
            }
            opd.only_newsig_seen = false;
            parse_new_sig(opd, code, args, ctx.protocol())?;
        }

        StatusCode::Validsig => {
            opd.only_newsig_seen = false;
            let idx = opd.current.ok_or(Error::InvEngine)?;
            parse_valid_sig(&mut opd.result.signatures[idx], args)?;
        }

        StatusCode::Nodata => {
            opd.only_newsig_seen = false;
            match opd.current {
                None => return Err(Error::NoData),
                Some(idx) => opd.result.signatures[idx].status = Some(Error::NoData),
            }
        }

        StatusCode::Unexpected => {
            opd.only_newsig_seen = false;
            match opd.current {
                None => return Err(Error::BadData),
                Some(idx) => opd.result.signatures[idx].status = Some(Error::NoData),
            }
        }

        StatusCode::NotationName
        | StatusCode::NotationFlags
        | StatusCode::NotationData
        | StatusCode::PolicyUrl => {
            opd.only_newsig_seen = false;
            let idx = opd.current.ok_or(Error::InvEngine)?;
            parse_notation(&mut opd.result.signatures[idx], code, args)?;
        }

        StatusCode::TrustUndefined
        | StatusCode::TrustNever
        | StatusCode::TrustMarginal
        | StatusCode::TrustFully
        | StatusCode::TrustUltimate => {
            opd.only_newsig_seen = false;
            let idx = opd.current.ok_or(Error::InvEngine)?;
            parse_trust(&mut opd.result.signatures[idx], code, args);
        }

        StatusCode::PkaTrustBad | StatusCode::PkaTrustGood => {
            opd.only_newsig_seen = false;
            let idx = opd.current.ok_or(Error::InvEngine)?;
            let sig = &mut opd.result.signatures[idx];
            // One PKA status per signature, or the backend misbehaves.
            if sig.pka_trust != 0 || sig.pka_address.is_some() {
                return Err(Error::InvEngine);
            }
            sig.pka_trust = if code == StatusCode::PkaTrustGood { 2 } else { 1 };
            sig.pka_address = Some(args.split(' ').next().unwrap_or("").to_string());
        }

        StatusCode::TofuUser => {
            opd.only_newsig_seen = false;
            let idx = opd.current.ok_or(Error::InvEngine)?;
            match parse_tofu_user(&mut opd.result.signatures[idx], args, ctx.protocol()) {
                // A duplicated TOFU_USER announces a conflicting key;
                // its statistics are dropped to keep the result tied
                // to one key.
                Err(Error::DupValue) => opd.conflict_user_seen = true,
                Err(err) => return Err(err),
                Ok(()) => opd.conflict_user_seen = false,
            }
        }

        StatusCode::TofuStats => {
            opd.only_newsig_seen = false;
            if !opd.conflict_user_seen {
                let idx = opd.current.ok_or(Error::InvEngine)?;
                parse_tofu_stats(&mut opd.result.signatures[idx], args)?;
            }
        }

        StatusCode::TofuStatsLong => {
            opd.only_newsig_seen = false;
            if !opd.conflict_user_seen {
                let idx = opd.current.ok_or(Error::InvEngine)?;
                parse_tofu_stats_long(
                    &mut opd.result.signatures[idx],
                    args,
                    ctx.raw_description(),
                )?;
            }
        }

        StatusCode::Error => {
            opd.only_newsig_seen = false;
            // Informational unless a signature is in flight.
            match opd.current {
                Some(idx) => parse_error(Some(&mut opd.result.signatures[idx]), args)?,
                None => parse_error(None, args)?,
            }
        }

        StatusCode::Failure => {
            if let Some(code) = ops::parse_failure(args)? {
                if opd.failure_code.is_none() {
                    opd.failure_code = Some(code);
                }
            }
        }

        StatusCode::Eof => {
            if let Some(idx) = opd.current {
                if !opd.did_prepare_new_sig {
                    calc_sig_summary(&mut opd.result.signatures[idx]);
                }
                if opd.only_newsig_seen {
                    // A trailing NEWSIG with no follow-up carries no
                    // information; drop the blank record.
                    opd.result.signatures.remove(idx);
                    opd.current = None;
                }
            }
            opd.only_newsig_seen = false;
            if let Some(code) = opd.failure_code {
                return Err(code);
            }
        }

        StatusCode::Plaintext => {
            opd.plaintext_seen += 1;
            if opd.plaintext_seen > 1 {
                return Err(Error::BadData);
            }
            let info = ops::parse_plaintext(args)?;
            opd.result.file_name = info.file_name;
            opd.result.is_mime = info.is_mime;
        }

        StatusCode::VerificationComplianceMode => {
            if let Some(idx) = opd.current {
                if util::compliance_de_vs(args) {
                    opd.result.signatures[idx].is_de_vs = true;
                }
            }
        }

        _ => {}
    }
    Ok(())
}

/// The handler installed for a plain verify operation.
pub fn composed_status_handler(ctx: &Arc<Context>, code: StatusCode, args: &str) -> Result<()> {
    progress::status_handler(ctx, code, args)?;
    status_handler(ctx, code, args)
}

/// Snapshot the verification result.  Signatures that never got a
/// summary (a NEWSIG followed only by an ERROR line) are patched up
/// from their status.
pub fn result(ctx: &Arc<Context>) -> Option<VerifyResult> {
    let hook = ctx.op_data_lookup::<VerifyOp>(OpDataKind::Verify, false)?;
    let mut result = hook.lock().unwrap().result.clone();
    for sig in &mut result.signatures {
        if sig.summary.is_empty() {
            match sig.status {
                Some(Error::KeyExpired) => sig.summary |= SigSummary::KEY_EXPIRED,
                Some(Error::NoPubkey) => sig.summary |= SigSummary::KEY_MISSING,
                _ => {}
            }
        }
        trace!(
            "verify result: fpr={:?} summary={:?} status={:?}",
            sig.fpr,
            sig.summary,
            sig.status
        );
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(ctx: &Arc<Context>, lines: &[(StatusCode, &str)]) -> Result<()> {
        for (code, args) in lines {
            status_handler(ctx, *code, args)?;
        }
        Ok(())
    }

    fn ctx_with_verify() -> Arc<Context> {
        let ctx = Context::new();
        init_result(&ctx).unwrap();
        ctx
    }

    #[test]
    fn good_fully_trusted_signature_is_green_and_valid() {
        let ctx = ctx_with_verify();
        feed(
            &ctx,
            &[
                (StatusCode::Newsig, ""),
                (StatusCode::Goodsig, "ABCD1234 alice"),
                (
                    StatusCode::Validsig,
                    "ABCD1234ABCD1234ABCD1234ABCD1234ABCD1234 2024-01-01 1704067200 0 4 0 1 8",
                ),
                (StatusCode::TrustFully, "0 classic"),
                (StatusCode::Eof, ""),
            ],
        )
        .unwrap();

        let result = result(&ctx).unwrap();
        assert_eq!(result.signatures.len(), 1);
        let sig = &result.signatures[0];
        assert_eq!(sig.fpr.as_deref(), Some("ABCD1234ABCD1234ABCD1234ABCD1234ABCD1234"));
        assert_eq!(sig.status, None);
        assert_eq!(sig.validity, Validity::Full);
        assert_eq!(sig.timestamp, 1704067200);
        assert_eq!(sig.pubkey_algo, 1);
        assert_eq!(sig.hash_algo, 8);
        assert_eq!(sig.summary, SigSummary::GREEN | SigSummary::VALID);
    }

    #[test]
    fn summary_table_over_validity_and_status() {
        // (trust line, sig status line, expected summary)
        let cases: &[(Option<StatusCode>, StatusCode, SigSummary)] = &[
            (Some(StatusCode::TrustFully), StatusCode::Goodsig, SigSummary::GREEN.union(SigSummary::VALID)),
            (Some(StatusCode::TrustUltimate), StatusCode::Goodsig, SigSummary::GREEN.union(SigSummary::VALID)),
            (
                Some(StatusCode::TrustFully),
                StatusCode::Expsig,
                SigSummary::GREEN.union(SigSummary::SIG_EXPIRED),
            ),
            (
                Some(StatusCode::TrustFully),
                StatusCode::Expkeysig,
                SigSummary::GREEN.union(SigSummary::KEY_EXPIRED),
            ),
            (
                Some(StatusCode::TrustNever),
                StatusCode::Goodsig,
                SigSummary::RED,
            ),
            (Some(StatusCode::TrustMarginal), StatusCode::Goodsig, SigSummary::empty()),
            (Some(StatusCode::TrustUndefined), StatusCode::Goodsig, SigSummary::empty()),
            (None, StatusCode::Badsig, SigSummary::RED),
            (Some(StatusCode::TrustNever), StatusCode::Badsig, SigSummary::RED),
        ];

        for (trust, sig_status, expected) in cases {
            let ctx = ctx_with_verify();
            status_handler(&ctx, StatusCode::Newsig, "").unwrap();
            status_handler(&ctx, *sig_status, "ABCD1234 someone").unwrap();
            if let Some(trust) = trust {
                status_handler(&ctx, *trust, "0").unwrap();
            }
            status_handler(&ctx, StatusCode::Eof, "").unwrap();
            let result = result(&ctx).unwrap();
            assert_eq!(
                result.signatures[0].summary, *expected,
                "case {:?}/{:?}",
                trust, sig_status
            );
            assert_eq!(
                result.signatures[0].summary.contains(SigSummary::VALID),
                *expected == SigSummary::GREEN | SigSummary::VALID,
                "VALID iff summary is exactly GREEN ({:?}/{:?})",
                trust,
                sig_status
            );
        }
    }

    #[test]
    fn errsig_carries_algos_timestamp_and_code() {
        let ctx = ctx_with_verify();
        feed(
            &ctx,
            &[
                (StatusCode::Newsig, ""),
                (StatusCode::Errsig, "AABBCCDD 1 8 00 1704067200 9 -"),
                (StatusCode::Eof, ""),
            ],
        )
        .unwrap();
        let sig = &result(&ctx).unwrap().signatures[0];
        assert_eq!(sig.status, Some(Error::NoPubkey));
        assert_eq!(sig.pubkey_algo, 1);
        assert_eq!(sig.hash_algo, 8);
        assert_eq!(sig.timestamp, 1704067200);
        assert_eq!(sig.fpr.as_deref(), Some("AABBCCDD"));
        assert!(sig.summary.contains(SigSummary::KEY_MISSING));
    }

    #[test]
    fn errsig_issuer_fpr_wins_over_keyid() {
        let ctx = ctx_with_verify();
        feed(
            &ctx,
            &[
                (StatusCode::Newsig, ""),
                (
                    StatusCode::Errsig,
                    "AABBCCDD 1 8 00 1704067200 9 AABBCCDDAABBCCDDAABBCCDDAABBCCDDAABBCCDD",
                ),
            ],
        )
        .unwrap();
        let sig = &result(&ctx).unwrap().signatures[0];
        assert_eq!(sig.fpr.as_deref(), Some("AABBCCDDAABBCCDDAABBCCDDAABBCCDDAABBCCDD"));
    }

    #[test]
    fn trailing_blank_newsig_is_dropped() {
        let ctx = ctx_with_verify();
        feed(
            &ctx,
            &[
                (StatusCode::Newsig, ""),
                (StatusCode::Goodsig, "ABCD1234 alice"),
                (StatusCode::TrustFully, "0"),
                (StatusCode::Newsig, ""),
                (StatusCode::Eof, ""),
            ],
        )
        .unwrap();
        assert_eq!(result(&ctx).unwrap().signatures.len(), 1);
    }

    #[test]
    fn second_plaintext_is_fatal() {
        let ctx = ctx_with_verify();
        status_handler(&ctx, StatusCode::Plaintext, "62 0 file").unwrap();
        assert_eq!(
            status_handler(&ctx, StatusCode::Plaintext, "62 0 file"),
            Err(Error::BadData)
        );
    }

    #[test]
    fn notations_collect_name_flags_and_data() {
        let ctx = ctx_with_verify();
        feed(
            &ctx,
            &[
                (StatusCode::Newsig, ""),
                (StatusCode::Goodsig, "ABCD1234 alice"),
                (StatusCode::NotationName, "pref@example.org"),
                (StatusCode::NotationFlags, "1 1"),
                (StatusCode::NotationData, "part%20one"),
                (StatusCode::NotationData, "%20part%20two"),
                (StatusCode::PolicyUrl, "https://example.org/policy"),
                (StatusCode::Eof, ""),
            ],
        )
        .unwrap();
        let sig = &result(&ctx).unwrap().signatures[0];
        assert_eq!(sig.notations.len(), 2);
        let notation = &sig.notations[0];
        assert_eq!(notation.name_str(), Some("pref@example.org"));
        assert_eq!(notation.value_str(), Some("part one part two"));
        assert!(notation.critical);
        assert!(notation.human_readable);
        let policy = &sig.notations[1];
        assert!(policy.is_policy_url());
        assert_eq!(policy.value_str(), Some("https://example.org/policy"));
    }

    #[test]
    fn tofu_conflict_suppresses_following_stats() {
        let ctx = ctx_with_verify();
        feed(
            &ctx,
            &[
                (StatusCode::Newsig, ""),
                (StatusCode::Goodsig, "ABCD1234 alice"),
                (StatusCode::TofuUser, "ABCD1234ABCD1234 alice@example.org"),
                (StatusCode::TofuStats, "2 7 3 auto 1600000000 1700000000"),
                // A different fingerprint announces a conflict.
                (StatusCode::TofuUser, "FFFF0000FFFF0000 alice@example.org"),
                (StatusCode::TofuStats, "0 99 99"),
                (StatusCode::Eof, ""),
            ],
        )
        .unwrap();
        let sig = &result(&ctx).unwrap().signatures[0];
        let key = sig.key.as_ref().unwrap();
        assert_eq!(key.fpr.as_deref(), Some("ABCD1234ABCD1234"));
        assert_eq!(key.uids.len(), 1);
        let tofu = key.uids[0].tofu.as_ref().unwrap();
        assert_eq!(tofu.validity, 2);
        assert_eq!(tofu.signcount, 7);
        assert_eq!(tofu.encrcount, 3);
        assert_eq!(tofu.policy, crate::types::TofuPolicy::Auto);
        assert_eq!(tofu.signfirst, 1600000000);
        assert_eq!(tofu.signlast, 1700000000);
    }

    #[test]
    fn findkey_error_patches_summary_in_result() {
        let ctx = ctx_with_verify();
        feed(
            &ctx,
            &[
                (StatusCode::Newsig, ""),
                (StatusCode::Error, "verify.findkey 9"),
                (StatusCode::Eof, ""),
            ],
        )
        .unwrap();
        let result = result(&ctx).unwrap();
        // The ERROR line keeps the record alive and the missing
        // summary is patched from the status when the result is read.
        assert_eq!(result.signatures.len(), 1);
        assert_eq!(result.signatures[0].status, Some(Error::NoPubkey));
        assert!(result.signatures[0].summary.contains(SigSummary::KEY_MISSING));
    }

    #[test]
    fn wrong_key_usage_sets_bad_policy() {
        let ctx = ctx_with_verify();
        feed(
            &ctx,
            &[
                (StatusCode::Newsig, ""),
                (StatusCode::Goodsig, "ABCD1234 alice"),
                (StatusCode::Error, "verify.keyusage 125"),
                (StatusCode::TrustFully, "0"),
                (StatusCode::Eof, ""),
            ],
        )
        .unwrap();
        let sig = &result(&ctx).unwrap().signatures[0];
        assert!(sig.wrong_key_usage);
        assert!(sig.summary.contains(SigSummary::BAD_POLICY));
        assert!(!sig.summary.contains(SigSummary::VALID));
    }

    #[test]
    fn failure_line_wins_at_eof() {
        let ctx = ctx_with_verify();
        status_handler(&ctx, StatusCode::Failure, "verify 89").unwrap();
        assert_eq!(status_handler(&ctx, StatusCode::Eof, ""), Err(Error::BadData));
    }
}
