//! Key export status handling.
//!
//! Export shares the passphrase machinery (secret export may prompt)
//! and watches a small set of ERROR locations.  Unlike encrypt and
//! sign it does not consult KEY_CONSIDERED for its INV_RECP lines;
//! the reason codes are taken as they come.

use std::sync::Arc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::ops::{self, passphrase, InvalidKey, OpDataKind};
use crate::status::StatusCode;

#[derive(Debug, Clone, Default)]
pub struct ExportResult {
    pub invalid_keys: Vec<InvalidKey>,
}

#[derive(Default)]
pub struct ExportOp {
    pub result: ExportResult,
    failure_code: Option<Error>,
    error: Option<Error>,
}

pub fn init_result(ctx: &Arc<Context>) -> Result<()> {
    ctx.op_data_lookup::<ExportOp>(OpDataKind::Export, true).ok_or(Error::InvValue)?;
    Ok(())
}

pub fn status_handler(ctx: &Arc<Context>, code: StatusCode, args: &str) -> Result<()> {
    passphrase::status_handler(ctx, code, args)?;

    let hook =
        ctx.op_data_lookup::<ExportOp>(OpDataKind::Export, false).ok_or(Error::InvValue)?;
    let mut opd = hook.lock().unwrap();

    match code {
        StatusCode::Error => {
            let (location, err) = ops::parse_error_line(args)?;
            if opd.error.is_none()
                && (location == "keyserver_send" || location == "export_keys.secret")
            {
                opd.error = err;
            }
        }

        StatusCode::InvRecp => {
            let invalid = ops::parse_inv_recp(args, None)?;
            opd.result.invalid_keys.push(invalid);
        }

        StatusCode::Failure => {
            opd.failure_code = ops::parse_failure(args)?;
        }

        StatusCode::Eof => {
            if let Some(err) = opd.error {
                return Err(err);
            }
            if !opd.result.invalid_keys.is_empty() {
                return Err(Error::UnusablePubkey);
            }
            if let Some(code) = opd.failure_code {
                return Err(code);
            }
        }

        _ => {}
    }
    Ok(())
}

pub fn result(ctx: &Arc<Context>) -> Option<ExportResult> {
    let hook = ctx.op_data_lookup::<ExportOp>(OpDataKind::Export, false)?;
    let result = hook.lock().unwrap().result.clone();
    Some(result)
}
