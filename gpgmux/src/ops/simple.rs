//! The small operations that share one status shape: delete, set
//! expiration, revoke signature, TOFU policy, and passphrase change.
//! Each tracks the first relevant ERROR and the first FAILURE and
//! surfaces whichever is set when the stream ends.

use std::sync::Arc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::ops::{self, passphrase, OpDataKind};
use crate::status::StatusCode;
use crate::types::Protocol;

#[derive(Default)]
pub struct SimpleOp {
    failure_code: Option<Error>,
    error_code: Option<Error>,
    success_seen: bool,
    error_seen: bool,
}

fn lookup(ctx: &Arc<Context>, kind: OpDataKind) -> Result<Arc<std::sync::Mutex<SimpleOp>>> {
    ctx.op_data_lookup::<SimpleOp>(kind, false).ok_or(Error::InvValue)
}

pub fn init_result(ctx: &Arc<Context>, kind: OpDataKind) -> Result<()> {
    ctx.op_data_lookup::<SimpleOp>(kind, true).ok_or(Error::InvValue)?;
    Ok(())
}

/// The common ERROR/FAILURE/EOF discipline.  `error_filter` decides
/// whether an ERROR at the given location belongs to the operation.
fn track(
    ctx: &Arc<Context>,
    kind: OpDataKind,
    code: StatusCode,
    args: &str,
    error_filter: fn(&str) -> bool,
) -> Result<()> {
    let hook = lookup(ctx, kind)?;
    let mut opd = hook.lock().unwrap();

    match code {
        StatusCode::Error => {
            let (location, err) = ops::parse_error_line(args)?;
            if error_filter(location) {
                if err.is_some() {
                    opd.error_seen = true;
                }
                if opd.error_code.is_none() {
                    opd.error_code = err;
                }
            }
        }

        StatusCode::Success => {
            opd.success_seen = true;
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
            if let Some(code) = opd.failure_code {
                return Err(code);
            }
        }

        _ => {}
    }
    Ok(())
}

/// Key deletion.  DELETE_PROBLEM codes are fatal right away.
pub fn delete_status_handler(_ctx: &Arc<Context>, code: StatusCode, args: &str) -> Result<()> {
    match code {
        StatusCode::DeleteProblem => {
            let problem: u32 = args
                .split(' ')
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or(Error::InvEngine)?;
            match problem {
                0 => Ok(()),
                1 => Err(Error::NoPubkey),
                2 => Err(Error::Conflict),
                3 => Err(Error::AmbiguousName),
                _ => Err(Error::General),
            }
        }
        StatusCode::Error => {
            // A cancellation of the confirmation dialog is the only
            // location we care about.
            let (location, err) = ops::parse_error_line(args)?;
            if location == "delete_key.secret"
                && matches!(err, Some(Error::Canceled) | Some(Error::FullyCanceled))
            {
                return Err(err.unwrap_or(Error::Canceled));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

pub fn setexpire_status_handler(ctx: &Arc<Context>, code: StatusCode, args: &str) -> Result<()> {
    passphrase::status_handler(ctx, code, args)?;
    track(ctx, OpDataKind::Setexpire, code, args, |_| true)
}

pub fn revsig_status_handler(ctx: &Arc<Context>, code: StatusCode, args: &str) -> Result<()> {
    passphrase::status_handler(ctx, code, args)?;
    track(ctx, OpDataKind::Revsig, code, args, |_| true)
}

pub fn tofu_policy_status_handler(
    ctx: &Arc<Context>,
    code: StatusCode,
    args: &str,
) -> Result<()> {
    track(ctx, OpDataKind::TofuPolicy, code, args, |_| true)
}

/// Passphrase change.  Old OpenPGP engines lacked the command and
/// reported neither ERROR nor SUCCESS; that silence is mapped to
/// `NotSupported`.
pub fn passwd_status_handler(ctx: &Arc<Context>, code: StatusCode, args: &str) -> Result<()> {
    passphrase::status_handler(ctx, code, args)?;

    let hook = lookup(ctx, OpDataKind::Passwd)?;
    let mut opd = hook.lock().unwrap();

    match code {
        StatusCode::Error => {
            let (location, err) = ops::parse_error_line(args)?;
            if location == "keyedit.passwd" {
                if err.is_some() {
                    opd.error_seen = true;
                }
                if opd.error_code.is_none() {
                    opd.error_code = err;
                }
            }
        }

        StatusCode::Success => {
            opd.success_seen = true;
        }

        StatusCode::Failure => {
            if let Some(code) = ops::parse_failure(args)? {
                if opd.failure_code.is_none() || opd.failure_code == Some(Error::General) {
                    opd.failure_code = Some(code);
                }
            }
        }

        StatusCode::Eof => {
            if ctx.protocol() == Protocol::OpenPgp && !opd.error_seen && !opd.success_seen {
                return Err(Error::NotSupported);
            }
            if let Some(err) = opd.error_code {
                return Err(err);
            }
            if let Some(code) = opd.failure_code {
                return Err(code);
            }
        }

        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_problem_codes() {
        let ctx = Context::new();
        assert_eq!(delete_status_handler(&ctx, StatusCode::DeleteProblem, "0"), Ok(()));
        assert_eq!(
            delete_status_handler(&ctx, StatusCode::DeleteProblem, "1"),
            Err(Error::NoPubkey)
        );
        assert_eq!(
            delete_status_handler(&ctx, StatusCode::DeleteProblem, "2"),
            Err(Error::Conflict)
        );
        assert_eq!(
            delete_status_handler(&ctx, StatusCode::DeleteProblem, "3"),
            Err(Error::AmbiguousName)
        );
        assert_eq!(
            delete_status_handler(&ctx, StatusCode::DeleteProblem, "7"),
            Err(Error::General)
        );
        assert_eq!(
            delete_status_handler(&ctx, StatusCode::Error, "delete_key.secret 99"),
            Err(Error::Canceled)
        );
        assert_eq!(delete_status_handler(&ctx, StatusCode::Error, "other.place 99"), Ok(()));
    }

    #[test]
    fn setexpire_reports_first_error_then_failure() {
        let ctx = Context::new();
        init_result(&ctx, OpDataKind::Setexpire).unwrap();
        setexpire_status_handler(&ctx, StatusCode::Error, "setexpire 55").unwrap();
        setexpire_status_handler(&ctx, StatusCode::Failure, "keyedit 1").unwrap();
        assert_eq!(
            setexpire_status_handler(&ctx, StatusCode::Eof, ""),
            Err(Error::InvValue)
        );
    }

    #[test]
    fn revsig_failure_without_error() {
        let ctx = Context::new();
        init_result(&ctx, OpDataKind::Revsig).unwrap();
        revsig_status_handler(&ctx, StatusCode::Failure, "revsig 11").unwrap();
        assert_eq!(revsig_status_handler(&ctx, StatusCode::Eof, ""), Err(Error::BadPassphrase));
    }

    #[test]
    fn passwd_synthesizes_not_supported_on_silence() {
        let ctx = Context::new();
        init_result(&ctx, OpDataKind::Passwd).unwrap();
        assert_eq!(passwd_status_handler(&ctx, StatusCode::Eof, ""), Err(Error::NotSupported));

        let ctx = Context::new();
        init_result(&ctx, OpDataKind::Passwd).unwrap();
        passwd_status_handler(&ctx, StatusCode::Success, "").unwrap();
        assert_eq!(passwd_status_handler(&ctx, StatusCode::Eof, ""), Ok(()));

        // The CMS engine answers unknown commands properly, so no
        // synthesis happens there.
        let ctx = Context::new();
        ctx.set_protocol(Protocol::Cms).unwrap();
        init_result(&ctx, OpDataKind::Passwd).unwrap();
        assert_eq!(passwd_status_handler(&ctx, StatusCode::Eof, ""), Ok(()));
    }

    #[test]
    fn tofu_policy_plain_tracking() {
        let ctx = Context::new();
        init_result(&ctx, OpDataKind::TofuPolicy).unwrap();
        tofu_policy_status_handler(&ctx, StatusCode::Eof, "").unwrap();
    }
}
