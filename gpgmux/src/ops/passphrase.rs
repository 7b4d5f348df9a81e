//! Passphrase state shared by the operations that may prompt, and the
//! command handler bridging the engine's inquiries to the user's
//! passphrase callback.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::ops::OpDataKind;
use crate::status::StatusCode;

#[derive(Default)]
pub struct PassphraseOp {
    no_passphrase: bool,
    uid_hint: Option<String>,
    passphrase_info: Option<String>,
    bad_passphrase: u32,
    maxlen: Option<String>,
}

/// Track the passphrase related status lines.  At the end of the
/// operation a missing or rejected passphrase surfaces as
/// `BadPassphrase`.
pub fn status_handler(ctx: &Arc<Context>, code: StatusCode, args: &str) -> Result<()> {
    let hook = ctx
        .op_data_lookup::<PassphraseOp>(OpDataKind::Passphrase, true)
        .ok_or(Error::InvValue)?;
    let mut opd = hook.lock().unwrap();

    match code {
        StatusCode::InquireMaxlen => {
            opd.maxlen = Some(args.to_string());
        }
        StatusCode::UseridHint => {
            opd.uid_hint = Some(args.to_string());
        }
        StatusCode::BadPassphrase => {
            opd.bad_passphrase += 1;
            opd.no_passphrase = false;
        }
        StatusCode::GoodPassphrase => {
            opd.bad_passphrase = 0;
            opd.no_passphrase = false;
        }
        StatusCode::NeedPassphrase
        | StatusCode::NeedPassphraseSym
        | StatusCode::NeedPassphrasePin => {
            opd.passphrase_info = Some(args.to_string());
        }
        StatusCode::MissingPassphrase => {
            opd.no_passphrase = true;
        }
        StatusCode::Eof => {
            if opd.no_passphrase || opd.bad_passphrase > 0 {
                return Err(Error::BadPassphrase);
            }
        }
        StatusCode::Error => {
            drop(opd);
            ctx.call_status_cb("ERROR", args)?;
        }
        StatusCode::Failure => {
            drop(opd);
            ctx.call_status_cb("FAILURE", args)?;
        }
        _ => {}
    }
    Ok(())
}

/// Answer a GET_HIDDEN passphrase inquiry by calling the user's
/// passphrase callback with the collected hints.  Returns whether the
/// inquiry was handled.
pub fn command_handler(
    ctx: &Arc<Context>,
    code: StatusCode,
    key: &str,
    fd: RawFd,
) -> Result<bool> {
    if code != StatusCode::GetHidden || (key != "passphrase.enter" && key != "passphrase.pin.ask")
    {
        return Ok(false);
    }
    let hook = ctx
        .op_data_lookup::<PassphraseOp>(OpDataKind::Passphrase, true)
        .ok_or(Error::InvValue)?;
    let (uid_hint, info, bad, maxlen) = {
        let opd = hook.lock().unwrap();
        (
            opd.uid_hint.clone(),
            opd.passphrase_info.clone(),
            opd.bad_passphrase > 0,
            opd.maxlen.clone(),
        )
    };

    // Convey the MAXLEN info as a synthesized status line first.
    if let Some(maxlen) = maxlen {
        ctx.call_status_cb("INQUIRE_MAXLEN", &maxlen)?;
    }

    let cb = ctx.passphrase_cb().ok_or(Error::General)?;
    (cb.lock().unwrap())(uid_hint.as_deref(), info.as_deref(), bad, fd)?;

    // The next attempt may well succeed.
    hook.lock().unwrap().bad_passphrase = 0;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys;

    #[test]
    fn bad_passphrase_without_recovery_fails_at_eof() {
        let ctx = Context::new();
        status_handler(&ctx, StatusCode::UseridHint, "AAAA alice").unwrap();
        status_handler(&ctx, StatusCode::BadPassphrase, "AAAA").unwrap();
        status_handler(&ctx, StatusCode::MissingPassphrase, "").unwrap();
        assert_eq!(status_handler(&ctx, StatusCode::Eof, ""), Err(Error::BadPassphrase));
    }

    #[test]
    fn good_passphrase_clears_earlier_failures() {
        let ctx = Context::new();
        status_handler(&ctx, StatusCode::BadPassphrase, "AAAA").unwrap();
        status_handler(&ctx, StatusCode::GoodPassphrase, "").unwrap();
        assert_eq!(status_handler(&ctx, StatusCode::Eof, ""), Ok(()));
    }

    #[test]
    fn command_handler_writes_through_the_callback() {
        let ctx = Context::new();
        status_handler(&ctx, StatusCode::UseridHint, "AAAA alice <a@example.org>").unwrap();
        status_handler(&ctx, StatusCode::NeedPassphrase, "AAAA AAAA 1 0").unwrap();
        status_handler(&ctx, StatusCode::BadPassphrase, "AAAA").unwrap();

        ctx.set_passphrase_cb(Some(Box::new(|uid_hint, info, prev_bad, fd| {
            assert_eq!(uid_hint, Some("AAAA alice <a@example.org>"));
            assert_eq!(info, Some("AAAA AAAA 1 0"));
            assert!(prev_bad);
            sys::write(fd, b"secret\n").map(|_| ())
        })));

        let [r, w] = sys::pipe(1).unwrap();
        let handled = command_handler(&ctx, StatusCode::GetHidden, "passphrase.enter", w).unwrap();
        assert!(handled);
        let mut buf = [0u8; 16];
        let n = sys::read(r, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"secret\n");

        // Unrelated inquiries are left alone.
        assert!(!command_handler(&ctx, StatusCode::GetLine, "keyedit.prompt", w).unwrap());
        sys::close_fd(r).unwrap();
        sys::close_fd(w).unwrap();
    }
}
