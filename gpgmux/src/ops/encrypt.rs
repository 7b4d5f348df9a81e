//! Encryption status handling: invalid recipient tracking.

use std::sync::Arc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::ops::{self, passphrase, progress, InvalidKey, OpDataKind};
use crate::status::StatusCode;

#[derive(Debug, Clone, Default)]
pub struct EncryptResult {
    pub invalid_recipients: Vec<InvalidKey>,
}

#[derive(Default)]
pub struct EncryptOp {
    pub result: EncryptResult,
    failure_code: Option<Error>,
    /// The last KEY_CONSIDERED pair, consumed by the next INV_RECP.
    key_considered: Option<(String, u32)>,
    /// Archive runs emit SUCCESS; everything else counts as success
    /// from the start.
    success_seen: bool,
}

/// Create the encrypt op-data slot.  Archive style runs must see a
/// SUCCESS line before the end of stream counts as success.
pub fn init_result(ctx: &Arc<Context>, success_required: bool) -> Result<()> {
    let hook = ctx
        .op_data_lookup::<EncryptOp>(OpDataKind::Encrypt, true)
        .ok_or(Error::InvValue)?;
    hook.lock().unwrap().success_seen = !success_required;
    Ok(())
}

pub fn status_handler(ctx: &Arc<Context>, code: StatusCode, args: &str) -> Result<()> {
    let hook = ctx
        .op_data_lookup::<EncryptOp>(OpDataKind::Encrypt, false)
        .ok_or(Error::InvValue)?;
    let mut opd = hook.lock().unwrap();

    match code {
        StatusCode::Failure => {
            if let Some(code) = ops::parse_failure(args)? {
                if opd.failure_code.is_none() || opd.failure_code == Some(Error::General) {
                    opd.failure_code = Some(code);
                }
            }
        }

        StatusCode::Eof => {
            if !opd.result.invalid_recipients.is_empty() {
                return Err(Error::UnusablePubkey);
            }
            if let Some(code) = opd.failure_code {
                return Err(code);
            }
            if !opd.success_seen {
                return Err(Error::Eof);
            }
        }

        StatusCode::KeyConsidered => {
            // Emitted during key lookup; remembered so the next
            // INV_RECP can refine its reason code.
            opd.key_considered = Some(ops::parse_key_considered(args)?);
        }

        StatusCode::InvRecp => {
            let cached = opd.key_considered.take();
            let invalid = ops::parse_inv_recp(
                args,
                cached.as_ref().map(|(fpr, flags)| (fpr.as_str(), *flags)),
            )?;
            opd.result.invalid_recipients.push(invalid);
        }

        StatusCode::NoRecp => {
            // Cannot happen: at least one recipient is required.
            return Err(Error::General);
        }

        StatusCode::Success => {
            opd.success_seen = true;
        }

        _ => {}
    }
    Ok(())
}

/// Handler for public key encryption.
pub fn composed_status_handler(ctx: &Arc<Context>, code: StatusCode, args: &str) -> Result<()> {
    progress::status_handler(ctx, code, args)?;
    status_handler(ctx, code, args)
}

/// Handler for symmetric encryption, which may prompt for the
/// passphrase.
pub fn sym_status_handler(ctx: &Arc<Context>, code: StatusCode, args: &str) -> Result<()> {
    progress::status_handler(ctx, code, args)?;
    passphrase::status_handler(ctx, code, args)?;
    status_handler(ctx, code, args)
}

pub fn result(ctx: &Arc<Context>) -> Option<EncryptResult> {
    let hook = ctx.op_data_lookup::<EncryptOp>(OpDataKind::Encrypt, false)?;
    let result = hook.lock().unwrap().result.clone();
    Some(result)
}
