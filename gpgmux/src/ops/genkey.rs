//! Key generation status handling.

use std::sync::Arc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::ops::{self, progress, OpDataKind};
use crate::status::StatusCode;

#[derive(Debug, Clone, Default)]
pub struct GenkeyResult {
    /// A primary key was created.
    pub primary: bool,
    /// A sub-key was created.
    pub sub: bool,
    /// A user id was added.
    pub uid: bool,
    pub fpr: Option<String>,
}

/// What kind of generation run this is; adding a uid or an additional
/// decryption subkey produces no KEY_CREATED line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenkeyMode {
    #[default]
    Key,
    AddUid,
    AddAdsk,
}

#[derive(Default)]
pub struct GenkeyOp {
    pub result: GenkeyResult,
    failure_code: Option<Error>,
    error_code: Option<Error>,
    mode: GenkeyMode,
}

pub fn init_result(ctx: &Arc<Context>, mode: GenkeyMode) -> Result<()> {
    let hook =
        ctx.op_data_lookup::<GenkeyOp>(OpDataKind::Genkey, true).ok_or(Error::InvValue)?;
    hook.lock().unwrap().mode = mode;
    Ok(())
}

pub fn status_handler(ctx: &Arc<Context>, code: StatusCode, args: &str) -> Result<()> {
    progress::status_handler(ctx, code, args)?;

    let hook =
        ctx.op_data_lookup::<GenkeyOp>(OpDataKind::Genkey, false).ok_or(Error::InvValue)?;
    let mut opd = hook.lock().unwrap();

    match code {
        StatusCode::KeyCreated => {
            // `B` both, `P` primary, `S` sub, followed by the
            // fingerprint and optionally a handle.
            let mut chars = args.chars();
            let kind = chars.next().unwrap_or(' ');
            if kind == 'B' || kind == 'P' {
                opd.result.primary = true;
                opd.result.uid = true;
            }
            if kind == 'B' || kind == 'S' {
                opd.result.sub = true;
            }
            if chars.next() == Some(' ') {
                let fpr = args[2..].split(' ').next().unwrap_or("");
                if !fpr.is_empty() {
                    opd.result.fpr = Some(fpr.to_string());
                }
            }
        }

        StatusCode::Error => {
            let (_, err) = ops::parse_error_line(args)?;
            if opd.error_code.is_none() {
                opd.error_code = err;
            }
        }

        StatusCode::Failure => {
            if let Some(code) = ops::parse_failure(args)? {
                if opd.failure_code.is_none() || opd.failure_code == Some(Error::General) {
                    opd.failure_code = Some(code);
                }
            }
        }

        StatusCode::Eof => {
            if let Some(err) = opd.error_code {
                return Err(err);
            }
            if opd.mode == GenkeyMode::Key && !opd.result.primary && !opd.result.sub {
                return Err(Error::General);
            }
            if let Some(code) = opd.failure_code {
                return Err(code);
            }
            if opd.mode == GenkeyMode::AddUid {
                // No status line announces a new uid; success implies it.
                opd.result.uid = true;
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

pub fn result(ctx: &Arc<Context>) -> Option<GenkeyResult> {
    let hook = ctx.op_data_lookup::<GenkeyOp>(OpDataKind::Genkey, false)?;
    let result = hook.lock().unwrap().result.clone();
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_keys_created_with_fingerprint() {
        let ctx = Context::new();
        init_result(&ctx, GenkeyMode::Key).unwrap();
        status_handler(&ctx, StatusCode::KeyCreated, "B ABCD1234ABCD1234").unwrap();
        status_handler(&ctx, StatusCode::Eof, "").unwrap();
        let result = result(&ctx).unwrap();
        assert!(result.primary);
        assert!(result.sub);
        assert!(result.uid);
        assert_eq!(result.fpr.as_deref(), Some("ABCD1234ABCD1234"));
    }

    #[test]
    fn nothing_created_is_an_error() {
        let ctx = Context::new();
        init_result(&ctx, GenkeyMode::Key).unwrap();
        assert_eq!(status_handler(&ctx, StatusCode::Eof, ""), Err(Error::General));
    }

    #[test]
    fn first_error_wins_over_failure() {
        let ctx = Context::new();
        init_result(&ctx, GenkeyMode::Key).unwrap();
        status_handler(&ctx, StatusCode::Error, "internal 63").unwrap();
        status_handler(&ctx, StatusCode::Error, "later 99").unwrap();
        status_handler(&ctx, StatusCode::Failure, "genkey 1").unwrap();
        assert_eq!(status_handler(&ctx, StatusCode::Eof, ""), Err(Error::Internal));
    }

    #[test]
    fn adduid_mode_sets_uid_on_success() {
        let ctx = Context::new();
        init_result(&ctx, GenkeyMode::AddUid).unwrap();
        status_handler(&ctx, StatusCode::Eof, "").unwrap();
        assert!(result(&ctx).unwrap().uid);
    }
}
