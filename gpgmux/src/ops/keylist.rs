//! Key listing: the colon-record state machine and the NEXT_KEY
//! streaming queue.
//!
//! The engine's listing output arrives line by line.  Records mutate a
//! key under construction; a new primary record (or the end of the
//! stream) finishes the key, computes its capability summary and
//! emits it as a NEXT_KEY event, which queues it for
//! [`keylist_next`].  The parser is deliberately tolerant: unknown
//! record types and unparsable numeric fields are skipped, not fatal.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::trace;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::key::{Key, Subkey, TofuInfo};
use crate::notation;
use crate::ops::{self, import, OpDataKind};
use crate::status::StatusCode;
use crate::types::{KeyOrigin, Protocol, TofuPolicy, Validity};
use crate::util;
use crate::wait::{self, Event};

#[derive(Debug, Clone, Default)]
pub struct KeylistResult {
    pub truncated: bool,
}

#[derive(Default)]
pub struct KeylistOp {
    pub result: KeylistResult,
    /// Error reported by the engine's key database search.
    keydb_search_err: Option<Error>,
    failure_code: Option<Error>,
    tmp_key: Option<Key>,
    /// Signature and trust records only attach right after a uid.
    tmp_uid_valid: bool,
    /// Subpackets only attach right after a signature.
    tmp_keysig_valid: bool,
    key_cond: Arc<AtomicBool>,
    key_queue: VecDeque<Arc<Key>>,
}

pub fn init_result(ctx: &Arc<Context>) -> Result<()> {
    ctx.op_data_lookup::<KeylistOp>(OpDataKind::Keylist, true).ok_or(Error::InvValue)?;
    // Locate modes import keys as a side effect.
    import::init_result(ctx)
}

/// Status lines of a key listing; the colon records arrive separately
/// through [`colon_line_handler`].
pub fn status_handler(ctx: &Arc<Context>, code: StatusCode, args: &str) -> Result<()> {
    let hook = ctx
        .op_data_lookup::<KeylistOp>(OpDataKind::Keylist, false)
        .ok_or(Error::InvValue)?;
    let mut opd = hook.lock().unwrap();

    match code {
        StatusCode::Truncated => {
            opd.result.truncated = true;
        }

        StatusCode::Error => {
            let (location, err) = ops::parse_error_line(args)?;
            if opd.keydb_search_err.is_none() && location == "keydb_search" {
                opd.keydb_search_err = err;
            }
        }

        StatusCode::Failure => {
            if let Some(code) = ops::parse_failure(args)? {
                if opd.failure_code.is_none() || opd.failure_code == Some(Error::General) {
                    opd.failure_code = Some(code);
                }
                if code == Error::General && args.starts_with("option-parser") {
                    return Err(Error::InvEngine);
                }
            }
        }

        StatusCode::ImportOk | StatusCode::ImportProblem | StatusCode::ImportRes => {
            drop(opd);
            return import::status_handler(ctx, code, args);
        }

        _ => {}
    }
    Ok(())
}

fn set_subkey_trust_info(subkey: &mut Subkey, src: &str) {
    for c in src.chars().take_while(|c| !c.is_ascii_digit()) {
        match c {
            'e' => subkey.expired = true,
            'r' => subkey.revoked = true,
            'd' => subkey.disabled = true,
            'i' => subkey.invalid = true,
            _ => {}
        }
    }
}

fn set_mainkey_trust_info(key: &mut Key, src: &str) {
    if let Some(subkey) = key.subkeys.first_mut() {
        set_subkey_trust_info(subkey, src);
    }
    for c in src.chars().take_while(|c| !c.is_ascii_digit()) {
        match c {
            'e' => key.expired = true,
            'r' => key.revoked = true,
            'd' => key.disabled = true,
            'i' => key.invalid = true,
            _ => {}
        }
    }
}

fn set_userid_flags(key: &mut Key, src: &str) {
    let Some(uid) = key.uids.last_mut() else { return };
    for c in src.chars().take_while(|c| !c.is_ascii_digit()) {
        match c {
            'r' => uid.revoked = true,
            'i' => uid.invalid = true,
            'n' => uid.validity = Validity::Never,
            'm' => uid.validity = Validity::Marginal,
            'f' => uid.validity = Validity::Full,
            'u' => uid.validity = Validity::Ultimate,
            _ => {}
        }
    }
}

fn set_subkey_capability(subkey: &mut Subkey, src: &str) {
    for c in src.chars() {
        match c {
            'e' => subkey.can_encrypt = true,
            's' => subkey.can_sign = true,
            'c' => subkey.can_certify = true,
            'a' => subkey.can_authenticate = true,
            'r' => subkey.can_renc = true,
            't' => subkey.can_timestamp = true,
            'g' => subkey.is_group_owned = true,
            'q' => subkey.is_qualified = true,
            'd' => subkey.disabled = true,
            _ => {}
        }
    }
}

fn set_mainkey_capability(key: &mut Key, src: &str) {
    if let Some(subkey) = key.subkeys.first_mut() {
        set_subkey_capability(subkey, src);
    }
    for c in src.chars() {
        match c {
            'd' | 'D' => key.disabled = true,
            'e' | 'E' => key.can_encrypt = true,
            's' | 'S' => key.can_sign = true,
            'c' | 'C' => key.can_certify = true,
            'a' | 'A' => key.can_authenticate = true,
            'q' | 'Q' => key.is_qualified = true,
            _ => {}
        }
    }
}

fn set_ownertrust(key: &mut Key, src: &str) {
    for c in src.chars().take_while(|c| !c.is_ascii_digit()) {
        key.owner_trust = match c {
            'n' => Validity::Never,
            'm' => Validity::Marginal,
            'f' => Validity::Full,
            'u' => Validity::Ultimate,
            _ => Validity::Unknown,
        };
    }
}

/// Field 15 of a secret key record holds the smartcard reference: `#`
/// is an offline stub, a hex string a card serial number, `+` plain
/// secret key material.
fn parse_sec_field15(key: &mut Key, subkey_idx: usize, field: &str) {
    let Some(subkey) = key.subkeys.get_mut(subkey_idx) else { return };
    let mut chars = field.chars();
    match chars.next() {
        None => {}
        Some('#') => {
            subkey.secret = false;
            key.secret = true;
        }
        Some(c) if c.is_ascii_hexdigit() => {
            key.secret = true;
            subkey.secret = true;
            subkey.is_cardkey = true;
            subkey.card_number = Some(field.to_string());
        }
        Some('+') => {
            key.secret = true;
            subkey.secret = true;
        }
        Some(_) => {}
    }
}

/// A `tfs` record right after a uid.
fn parse_tfs_record(uid_tofu: &mut Option<TofuInfo>, fields: &[&str]) -> Result<()> {
    // Only the first record counts, should future engines emit more.
    if uid_tofu.is_some() {
        return Ok(());
    }
    if fields.len() < 8 || fields.get(1) != Some(&"1") {
        return Err(Error::InvEngine);
    }

    let mut ti = TofuInfo::default();
    let validity = util::parse_u64_field(fields[2])?;
    if validity > 7 {
        return Err(Error::InvEngine);
    }
    ti.validity = validity as u32;
    ti.signcount = util::parse_u64_field(fields[3])?.min(u16::MAX as u64) as u16;
    ti.encrcount = util::parse_u64_field(fields[4])?.min(u16::MAX as u64) as u16;
    ti.policy = TofuPolicy::from_tag(fields[5]);
    ti.signfirst = util::parse_u64_field(fields[6])?;
    ti.signlast = util::parse_u64_field(fields[7])?;
    if fields.len() > 9 {
        ti.encrfirst = util::parse_u64_field(fields[8])?;
        ti.encrlast = util::parse_u64_field(fields[9])?;
    }
    *uid_tofu = Some(ti);
    Ok(())
}

/// Take the key under construction out of the state and derive its
/// capability summary from the sub-keys.
fn take_finished_key(opd: &mut KeylistOp) -> Option<Key> {
    let mut key = opd.tmp_key.take()?;
    opd.tmp_uid_valid = false;
    opd.tmp_keysig_valid = false;

    for subkey in &key.subkeys {
        if subkey.can_encrypt {
            key.has_encrypt = true;
        }
        if subkey.can_sign {
            key.has_sign = true;
        }
        if subkey.can_certify {
            key.has_certify = true;
        }
        if subkey.can_authenticate {
            key.has_authenticate = true;
        }
    }
    Some(key)
}

/// Emit a finished key as NEXT_KEY.  Must be called without the
/// op-data lock held: the event lands back in [`event_cb`].
fn emit_key(ctx: &Arc<Context>, key: Key) {
    trace!("ctx={} finished key {:?}", ctx.serial(), key.fpr);
    wait::io_event(ctx, &Event::NextKey(Arc::new(key)));
}

/// Handle one colon separated line of the listing; `None` marks the
/// end of the listing and flushes the final key.
pub fn colon_line_handler(ctx: &Arc<Context>, line: Option<&str>) -> Result<()> {
    let hook = ctx
        .op_data_lookup::<KeylistOp>(OpDataKind::Keylist, false)
        .ok_or(Error::InvValue)?;
    let mut guard = hook.lock().unwrap();
    let opd = &mut *guard;

    let Some(line) = line else {
        let finished = take_finished_key(opd);
        drop(guard);
        if let Some(key) = finished {
            emit_key(ctx, key);
        }
        return Ok(());
    };

    let fields: Vec<&str> = line.split(':').collect();
    let rectype = fields[0];
    let have_key = opd.tmp_key.is_some();

    // Signature and trust records only belong to the uid immediately
    // before them; subpackets only to the signature immediately before.
    if !matches!(rectype, "sig" | "rev" | "tfs" | "spk") {
        opd.tmp_uid_valid = false;
    }
    if rectype != "spk" {
        opd.tmp_keysig_valid = false;
    }

    let field = |idx: usize| -> &str { fields.get(idx).copied().unwrap_or("") };

    let mut finished: Option<Key> = None;

    match rectype {
        "pub" | "sec" | "crt" | "crs" => {
            finished = take_finished_key(opd);

            let mut key = Key::new();
            key.keylist_mode = ctx.keylist_mode();
            key.protocol = ctx.protocol();
            let subkey = key.add_subkey();
            if rectype == "sec" || rectype == "crs" {
                subkey.secret = true;
                key.secret = true;
            }
            if rectype == "crt" || rectype == "crs" {
                key.protocol = Protocol::Cms;
            }

            set_mainkey_trust_info(&mut key, field(1));
            if let Ok(length) = field(2).parse::<u32>() {
                if length > 1 {
                    key.subkeys[0].length = length;
                }
            }
            if let Ok(algo) = field(3).parse::<i32>() {
                if (1..128).contains(&algo) {
                    key.subkeys[0].pubkey_algo = algo;
                }
            }
            if field(4).len() <= 16 {
                key.subkeys[0].keyid = field(4).to_string();
            }
            key.subkeys[0].timestamp = util::parse_timestamp_lenient(field(5));
            key.subkeys[0].expires = util::parse_timestamp_lenient(field(6));
            if (rectype == "crt" || rectype == "crs") && !field(7).is_empty() {
                key.issuer_serial = Some(field(7).to_string());
            }
            set_ownertrust(&mut key, field(8));
            if (rectype == "crt" || rectype == "crs") && !field(9).is_empty() {
                key.issuer_name = Some(util::decode_c_string(field(9)));
            }
            set_mainkey_capability(&mut key, field(11));
            if !field(14).is_empty()
                && (key.secret
                    || key.keylist_mode.contains(crate::types::KeylistMode::WITH_SECRET))
            {
                parse_sec_field15(&mut key, 0, field(14));
            }
            if !field(16).is_empty() {
                key.subkeys[0].curve = Some(field(16).to_string());
            }
            if !field(17).is_empty() && util::compliance_de_vs(field(17)) {
                key.subkeys[0].is_de_vs = true;
            }
            if fields.len() >= 20 {
                key.last_update = util::parse_timestamp_ul(field(18));
                key.origin = KeyOrigin::from_field(field(19));
            }
            opd.tmp_key = Some(key);
        }

        "sub" | "ssb" if have_key => {
            let key = opd.tmp_key.as_mut().unwrap();
            let idx = key.subkeys.len();
            let subkey = key.add_subkey();
            if rectype == "ssb" {
                subkey.secret = true;
            }
            set_subkey_trust_info(subkey, field(1));
            if let Ok(length) = field(2).parse::<u32>() {
                if length > 1 {
                    subkey.length = length;
                }
            }
            if let Ok(algo) = field(3).parse::<i32>() {
                if (1..128).contains(&algo) {
                    subkey.pubkey_algo = algo;
                }
            }
            if field(4).len() == 16 {
                subkey.keyid = field(4).to_string();
            }
            subkey.timestamp = util::parse_timestamp_lenient(field(5));
            subkey.expires = util::parse_timestamp_lenient(field(6));
            set_subkey_capability(subkey, field(11));
            if !field(16).is_empty() {
                subkey.curve = Some(field(16).to_string());
            }
            if !field(17).is_empty() && util::compliance_de_vs(field(17)) {
                subkey.is_de_vs = true;
            }
            let with_secret =
                key.keylist_mode.contains(crate::types::KeylistMode::WITH_SECRET);
            if !field(14).is_empty() && (key.secret || with_secret) {
                parse_sec_field15(key, idx, field(14));
            }
        }

        "uid" if have_key => {
            if fields.len() >= 10 {
                let key = opd.tmp_key.as_mut().unwrap();
                key.append_name(field(9), true);
                set_userid_flags(key, field(1));
                if !field(7).is_empty() {
                    if let Some(uid) = key.last_uid_mut() {
                        uid.uidhash = Some(field(7).to_string());
                    }
                }
                if fields.len() >= 20 {
                    if let Some(uid) = key.last_uid_mut() {
                        uid.last_update = util::parse_timestamp_ul(field(18));
                        uid.origin = KeyOrigin::from_field(field(19));
                    }
                }
                opd.tmp_uid_valid = true;
            }
        }

        "tfs" if have_key => {
            if opd.tmp_uid_valid {
                let key = opd.tmp_key.as_mut().unwrap();
                if let Some(uid) = key.last_uid_mut() {
                    parse_tfs_record(&mut uid.tofu, &fields)?;
                }
            }
        }

        "fpr" if have_key => {
            let key = opd.tmp_key.as_mut().unwrap();
            if fields.len() >= 10 && !field(9).is_empty() {
                // All sub-keys carry fingerprints; this one belongs to
                // the most recent.
                let fpr = field(9).to_string();
                let is_primary = key.subkeys.len() == 1;
                if let Some(subkey) = key.subkeys.last_mut() {
                    if subkey.fpr.is_none() {
                        subkey.fpr = Some(fpr.clone());
                    }
                }
                if is_primary {
                    match &key.fpr {
                        Some(existing) if *existing != fpr => return Err(Error::Internal),
                        Some(_) => {}
                        None => key.fpr = Some(fpr),
                    }
                }
            }
            if fields.len() >= 13 && key.chain_id.is_none() && !field(12).is_empty() {
                key.chain_id = Some(field(12).to_string());
            }
        }

        "fp2" if have_key => {
            if fields.len() >= 10 && !field(9).is_empty() {
                let key = opd.tmp_key.as_mut().unwrap();
                if let Some(subkey) = key.subkeys.last_mut() {
                    if subkey.v5fpr.is_none() {
                        subkey.v5fpr = Some(field(9).to_string());
                    }
                }
            }
        }

        "grp" if have_key => {
            if fields.len() >= 10 && !field(9).is_empty() {
                let key = opd.tmp_key.as_mut().unwrap();
                if let Some(subkey) = key.subkeys.last_mut() {
                    if subkey.keygrip.is_none() {
                        subkey.keygrip = Some(field(9).to_string());
                    }
                }
            }
        }

        "sig" | "rev" if have_key => {
            if !opd.tmp_uid_valid {
                return Ok(());
            }
            let key = opd.tmp_key.as_mut().unwrap();
            let uid_src = if fields.len() >= 10 { Some(field(9)) } else { None };
            let status_field = field(1).to_string();
            let algo_field = field(3).to_string();
            let keyid_field = field(4).to_string();
            let ts_field = field(5).to_string();
            let exp_field = field(6).to_string();
            let trust_field = field(7).to_string();
            let scope_field = field(8).to_string();
            let class_field = field(10).to_string();
            let nfields = fields.len();

            let Some(keysig) = key.add_sig(uid_src) else { return Ok(()) };
            keysig.status = match status_field.chars().next() {
                Some('!') | None => None,
                Some('-') => Some(Error::BadSignature),
                Some('?') => Some(Error::NoPubkey),
                Some('%') => Some(Error::General),
                Some(_) => None,
            };
            if let Ok(algo) = algo_field.parse::<i32>() {
                if (1..128).contains(&algo) {
                    keysig.pubkey_algo = algo;
                }
            }
            if keyid_field.len() == 16 {
                keysig.keyid = keyid_field;
            }
            keysig.timestamp = util::parse_timestamp_lenient(&ts_field);
            keysig.expires = util::parse_timestamp_lenient(&exp_field);
            if nfields >= 8 && !trust_field.is_empty() {
                let mut parts = trust_field.splitn(2, ' ');
                let depth = parts.next().and_then(|p| p.parse::<u32>().ok());
                let value = parts.next().and_then(|p| p.trim().parse::<u32>().ok());
                if let (Some(depth), Some(value)) = (depth, value) {
                    if (1..256).contains(&depth) {
                        keysig.trust_depth = depth;
                    }
                    if (1..256).contains(&value) {
                        keysig.trust_value = value;
                    }
                }
            }
            if nfields >= 9 && !scope_field.is_empty() {
                keysig.trust_scope = Some(util::decode_c_string(&scope_field));
            }
            if nfields >= 11 && class_field.len() >= 2 {
                if let Some(sig_class) = util::hex_to_byte(class_field.as_bytes()) {
                    keysig.sig_class = sig_class as u32;
                    if sig_class == 0x30 {
                        keysig.revoked = true;
                    }
                }
                if class_field.as_bytes().get(2) == Some(&b'x') {
                    keysig.exportable = true;
                }
            }
            opd.tmp_keysig_valid = true;
        }

        "spk" if have_key => {
            if !opd.tmp_keysig_valid || fields.len() < 5 {
                return Ok(());
            }
            let pkt_type = ops::atoi_u32(field(1));
            let pkt_flags = ops::atoi_u32(field(2));
            let len = ops::atoi_u32(field(3)) as usize;
            let notation = notation::parse_subpacket(pkt_type, pkt_flags, len, field(4))?;
            if let Some(notation) = notation {
                let key = opd.tmp_key.as_mut().unwrap();
                if let Some(keysig) =
                    key.uids.last_mut().and_then(|uid| uid.signatures.last_mut())
                {
                    keysig.notations.push(notation);
                }
            }
        }

        "rvk" if have_key => {
            if fields.len() >= 10 && !field(9).is_empty() {
                let algo_field = field(3).to_string();
                let class_field = field(10).to_string();
                let key = opd.tmp_key.as_mut().unwrap();
                let revkey = key.add_rev_key(field(9));
                if let Ok(algo) = algo_field.parse::<i32>() {
                    if (1..128).contains(&algo) {
                        revkey.pubkey_algo = algo;
                    }
                }
                if class_field.len() >= 2 {
                    if let Some(class) = util::hex_to_byte(class_field.as_bytes()) {
                        revkey.key_class = class as u32;
                    }
                    if class_field.as_bytes().get(2) == Some(&b's') {
                        revkey.sensitive = true;
                    }
                }
            }
        }

        _ => {
            // Unknown record types are ignored.
        }
    }

    drop(guard);
    if let Some(key) = finished {
        emit_key(ctx, key);
    }
    Ok(())
}

/// NEXT_KEY delivery from the wait loop: queue the key and satisfy the
/// condition [`keylist_next`] waits on.
pub(crate) fn event_cb(ctx: &Arc<Context>, key: Arc<Key>) {
    let Some(hook) = ctx.op_data_lookup::<KeylistOp>(OpDataKind::Keylist, false) else {
        return;
    };
    let mut opd = hook.lock().unwrap();
    opd.key_queue.push_back(key);
    opd.key_cond.store(true, Ordering::Release);
}

/// Return the next key of the listing, driving the context's loop
/// while the queue is empty.  `Eof` when the listing is exhausted.
pub fn keylist_next(ctx: &Arc<Context>) -> Result<Arc<Key>> {
    let hook = ctx
        .op_data_lookup::<KeylistOp>(OpDataKind::Keylist, false)
        .ok_or(Error::InvValue)?;

    let cond = {
        let mut opd = hook.lock().unwrap();
        if let Some(key) = opd.key_queue.pop_front() {
            if opd.key_queue.is_empty() {
                opd.key_cond.store(false, Ordering::Release);
            }
            return Ok(key);
        }
        opd.key_cond.clone()
    };

    wait::sync_wait(ctx, Some(&cond))?;

    let mut opd = hook.lock().unwrap();
    if !cond.load(Ordering::Acquire) {
        return Err(opd.keydb_search_err.unwrap_or(Error::Eof));
    }
    opd.key_cond.store(false, Ordering::Release);
    opd.key_queue.pop_front().ok_or(Error::General)
}

/// Finish a listing; surfaces a FAILURE recorded along the way.
pub fn keylist_end(ctx: &Arc<Context>) -> Result<()> {
    let hook = ctx
        .op_data_lookup::<KeylistOp>(OpDataKind::Keylist, false)
        .ok_or(Error::InvValue)?;
    let failure = hook.lock().unwrap().failure_code;
    match failure {
        Some(code) => Err(code),
        None => Ok(()),
    }
}

pub fn result(ctx: &Arc<Context>) -> Option<KeylistResult> {
    let hook = ctx.op_data_lookup::<KeylistOp>(OpDataKind::Keylist, false)?;
    let result = hook.lock().unwrap().result.clone();
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_lines(ctx: &Arc<Context>, lines: &[&str]) {
        for line in lines {
            colon_line_handler(ctx, Some(line)).unwrap();
        }
        colon_line_handler(ctx, None).unwrap();
    }

    fn pop_key(ctx: &Arc<Context>) -> Arc<Key> {
        keylist_next(ctx).expect("a key should be queued")
    }

    #[test]
    fn one_pub_key_with_uid_and_sub() {
        let ctx = Context::new();
        init_result(&ctx).unwrap();
        feed_lines(
            &ctx,
            &[
                "pub:u:4096:1:ABCD1234ABCD1234:1577836800:1735689600::u:::scESC::::::23:",
                "fpr:::::::::ABCD1234ABCD1234ABCD1234ABCD1234ABCD1234:",
                "uid:u::::1577836800::AAAA::Alice <a@example.org>::::::::::0:",
                "sub:u:4096:1:FEED0000FEED0000:1577836800:1735689600:::::e::::::23:",
            ],
        );

        let key = pop_key(&ctx);
        assert_eq!(key.protocol, Protocol::OpenPgp);
        assert_eq!(key.owner_trust, Validity::Ultimate);
        assert_eq!(key.fpr.as_deref(), Some("ABCD1234ABCD1234ABCD1234ABCD1234ABCD1234"));
        assert!(key.has_encrypt);
        assert!(key.has_sign);
        assert!(key.has_certify);
        assert!(!key.has_authenticate);

        assert_eq!(key.subkeys.len(), 2);
        let primary = &key.subkeys[0];
        assert_eq!(primary.length, 4096);
        assert_eq!(primary.pubkey_algo, 1);
        assert_eq!(primary.keyid, "ABCD1234ABCD1234");
        assert_eq!(primary.timestamp, 1577836800);
        assert_eq!(primary.expires, 1735689600);
        assert!(primary.is_de_vs);
        let sub = &key.subkeys[1];
        assert!(sub.can_encrypt);
        assert!(sub.is_de_vs);

        assert_eq!(key.uids.len(), 1);
        let uid = &key.uids[0];
        assert_eq!(uid.name, "Alice");
        assert_eq!(uid.email, "a@example.org");
        assert_eq!(uid.validity, Validity::Ultimate);
        assert_eq!(uid.uidhash.as_deref(), Some("AAAA"));

        // The listing is exhausted.
        assert!(keylist_next(&ctx).is_err());
    }

    #[test]
    fn secret_listing_and_card_stub() {
        let ctx = Context::new();
        init_result(&ctx).unwrap();
        feed_lines(
            &ctx,
            &[
                "sec:u:255:22:1111222233334444:1577836800:::u:::cSC:::#:::ed25519:::0:",
                "ssb:u:255:18:5555666677778888:1577836800::::::e:::D2760001240103:::cv25519:",
            ],
        );
        let key = pop_key(&ctx);
        assert!(key.secret);
        // The primary is an offline stub, the sub-key is on a card.
        assert!(!key.subkeys[0].secret);
        assert_eq!(key.subkeys[0].curve.as_deref(), Some("ed25519"));
        assert!(key.subkeys[1].secret);
        assert!(key.subkeys[1].is_cardkey);
        assert_eq!(key.subkeys[1].card_number.as_deref(), Some("D2760001240103"));
    }

    #[test]
    fn signatures_attach_to_the_preceding_uid_only() {
        let ctx = Context::new();
        init_result(&ctx).unwrap();
        feed_lines(
            &ctx,
            &[
                "pub:u:4096:1:ABCD1234ABCD1234:1577836800:::u:::scESC:",
                "uid:u::::1577836800::HASH::Alice <a@example.org>:",
                "sig:::1:ABCD1234ABCD1234:1577836800::::Alice <a@example.org>:13x:",
                "rev:::1:9999888877776666:1577936800::::Revoker <r@example.org>:30x:",
                // The fpr record invalidates the uid pointer; this sig
                // is dropped on the floor.
                "fpr:::::::::ABCD1234ABCD1234ABCD1234ABCD1234ABCD1234:",
                "sig:::1:ABCD1234ABCD1234:1577836800::::Nobody <n@example.org>:13x:",
            ],
        );
        let key = pop_key(&ctx);
        let sigs = &key.uids[0].signatures;
        assert_eq!(sigs.len(), 2);
        assert_eq!(sigs[0].keyid, "ABCD1234ABCD1234");
        assert_eq!(sigs[0].sig_class, 0x13);
        assert!(sigs[0].exportable);
        assert!(!sigs[0].revoked);
        assert_eq!(sigs[1].sig_class, 0x30);
        assert!(sigs[1].revoked);
    }

    #[test]
    fn tfs_record_fills_tofu_info() {
        let ctx = Context::new();
        init_result(&ctx).unwrap();
        feed_lines(
            &ctx,
            &[
                "pub:u:4096:1:ABCD1234ABCD1234:1577836800:::u:::scESC:",
                "uid:u::::1577836800::HASH::alice@example.org:",
                "tfs:1:2:7:3:auto:1600000000:1700000000:",
            ],
        );
        let key = pop_key(&ctx);
        let tofu = key.uids[0].tofu.as_ref().unwrap();
        assert_eq!(tofu.validity, 2);
        assert_eq!(tofu.signcount, 7);
        assert_eq!(tofu.encrcount, 3);
        assert_eq!(tofu.policy, TofuPolicy::Auto);
    }

    #[test]
    fn unknown_records_and_bad_numbers_are_ignored() {
        let ctx = Context::new();
        init_result(&ctx).unwrap();
        feed_lines(
            &ctx,
            &[
                "pub:u:notanumber:9999:SHORT:badtime::::::scESC:",
                "xxx:some:garbage:",
                "uid:u::::::::Alice <a@example.org>:",
            ],
        );
        let key = pop_key(&ctx);
        assert_eq!(key.subkeys[0].length, 0);
        assert_eq!(key.subkeys[0].pubkey_algo, 0);
        assert_eq!(key.subkeys[0].timestamp, -1);
        assert_eq!(key.uids.len(), 1);
    }

    #[test]
    fn two_keys_stream_in_order() {
        let ctx = Context::new();
        init_result(&ctx).unwrap();
        feed_lines(
            &ctx,
            &[
                "pub:u:4096:1:AAAA00000000AAAA:1577836800:::u:::scESC:",
                "pub:u:4096:1:BBBB00000000BBBB:1577836800:::f:::scE:",
            ],
        );
        let first = pop_key(&ctx);
        let second = pop_key(&ctx);
        assert_eq!(first.subkeys[0].keyid, "AAAA00000000AAAA");
        assert_eq!(second.subkeys[0].keyid, "BBBB00000000BBBB");
        assert_eq!(second.owner_trust, Validity::Full);
        assert!(keylist_next(&ctx).is_err());
    }

    #[test]
    fn keydb_search_error_reported_at_exhaustion() {
        let ctx = Context::new();
        init_result(&ctx).unwrap();
        status_handler(&ctx, StatusCode::Error, "keydb_search 9").unwrap();
        colon_line_handler(&ctx, None).unwrap();
        assert_eq!(keylist_next(&ctx).unwrap_err(), Error::NoPubkey);
    }

    #[test]
    fn truncated_listing_is_flagged() {
        let ctx = Context::new();
        init_result(&ctx).unwrap();
        status_handler(&ctx, StatusCode::Truncated, "").unwrap();
        assert!(result(&ctx).unwrap().truncated);
    }
}
