//! Decryption status machine and the decrypt-verify composition.

use std::sync::Arc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::ops::{self, passphrase, progress, verify, OpDataKind};
use crate::status::StatusCode;
use crate::util;

/// One recipient of the encrypted message, from an ENC_TO line.
#[derive(Debug, Clone, Default)]
pub struct Recipient {
    pub keyid: String,
    pub pubkey_algo: i32,
    /// `NoSeckey` when we hold no secret key for this recipient.
    pub status: Option<Error>,
}

#[derive(Debug, Clone, Default)]
pub struct DecryptResult {
    pub unsupported_algorithm: Option<String>,
    pub wrong_key_usage: bool,
    /// Message was encrypted without integrity protection.
    pub legacy_cipher_nomdc: bool,
    pub is_mime: bool,
    pub is_de_vs: bool,
    pub file_name: Option<String>,
    pub session_key: Option<String>,
    pub symkey_algo: Option<String>,
    pub recipients: Vec<Recipient>,
}

#[derive(Default)]
pub struct DecryptOp {
    pub result: DecryptResult,
    failure_code: Option<Error>,
    okay_seen: bool,
    failed: Option<Error>,
    any_no_seckey: bool,
    plaintext_seen: u32,
}

pub fn init_result(ctx: &Arc<Context>) -> Result<()> {
    ctx.op_data_lookup::<DecryptOp>(OpDataKind::Decrypt, true).ok_or(Error::InvValue)?;
    Ok(())
}

/// The decrypt status handler proper.
pub fn status_handler(ctx: &Arc<Context>, code: StatusCode, args: &str) -> Result<()> {
    let hook = ctx
        .op_data_lookup::<DecryptOp>(OpDataKind::Decrypt, false)
        .ok_or(Error::InvValue)?;
    let mut opd = hook.lock().unwrap();

    match code {
        StatusCode::Failure => {
            if let Some(code) = ops::parse_failure(args)? {
                if opd.failure_code.is_none()
                    || opd.failure_code == Some(Error::General)
                {
                    opd.failure_code = Some(code);
                }
            }
        }

        StatusCode::EncTo => {
            // <keyid> <pkalgo> <keylen>
            let fields = util::split_fields(args);
            let Some(keyid) = fields.first() else { return Err(Error::InvEngine) };
            let mut recipient = Recipient { keyid: keyid.to_string(), ..Default::default() };
            if let Some(algo) = fields.get(1) {
                recipient.pubkey_algo = algo.parse().unwrap_or(0);
            }
            opd.result.recipients.push(recipient);
        }

        StatusCode::NoSeckey => {
            opd.any_no_seckey = true;
            let keyid = args.split(' ').next().unwrap_or("");
            for recipient in &mut opd.result.recipients {
                if recipient.keyid == keyid {
                    recipient.status = Some(Error::NoSeckey);
                }
            }
        }

        StatusCode::DecryptionInfo => {
            // <mdc-method> <sym-algo> [<aead-algo>]
            let fields = util::split_fields(args);
            if let (Some(mdc), Some(algo)) = (fields.first(), fields.get(1)) {
                opd.result.symkey_algo = Some(algo.to_string());
                if mdc.parse::<u32>() == Ok(0) && fields.get(2).map_or(true, |a| *a == "0") {
                    opd.result.legacy_cipher_nomdc = true;
                }
            }
        }

        StatusCode::DecryptionOkay => {
            opd.okay_seen = true;
        }

        StatusCode::DecryptionFailed => {
            if opd.failed.is_none() {
                opd.failed = Some(Error::DecryptFailed);
            }
        }

        StatusCode::Badmdc | StatusCode::Errmdc => {
            if !ctx.ignore_mdc_error() {
                opd.failed = Some(Error::Checksum);
            }
        }

        StatusCode::SessionKey => {
            if ctx.export_session_keys() {
                opd.result.session_key = Some(args.to_string());
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

        StatusCode::DecryptionComplianceMode => {
            if util::compliance_de_vs(args) {
                opd.result.is_de_vs = true;
            }
        }

        StatusCode::Error => {
            let (location, err) = ops::parse_error_line(args)?;
            match location {
                "proc_pkt.plaintext" if err == Some(Error::BadData) => {
                    return Err(Error::BadData);
                }
                "decrypt.algorithm" => {
                    if err == Some(Error::UnsupportedAlgorithm) {
                        opd.result.unsupported_algorithm =
                            args.split(' ').nth(2).map(str::to_string);
                    }
                }
                "decrypt.keyusage" => {
                    if err == Some(Error::WrongKeyUsage) {
                        opd.result.wrong_key_usage = true;
                    }
                }
                "pkdecrypt_failed" => {
                    opd.failed = err.or(Some(Error::DecryptFailed));
                }
                "nomdc" => {
                    opd.failed = Some(Error::Checksum);
                }
                _ => {}
            }
        }

        StatusCode::Eof => {
            if let Some(failed) = opd.failed {
                return Err(failed);
            }
            if !opd.okay_seen {
                if opd.any_no_seckey {
                    return Err(Error::NoSeckey);
                }
                // The input was not encrypted at all.
                return Err(Error::NoData);
            }
            if let Some(code) = opd.failure_code {
                return Err(code);
            }
        }

        _ => {}
    }
    Ok(())
}

/// Handler for a plain decrypt: progress, passphrase, then decrypt.
pub fn composed_status_handler(ctx: &Arc<Context>, code: StatusCode, args: &str) -> Result<()> {
    progress::status_handler(ctx, code, args)?;
    passphrase::status_handler(ctx, code, args)?;
    status_handler(ctx, code, args)
}

/// Handler for decrypt-verify.  A NO_DATA from the decrypt side at the
/// end of stream only means the input was not encrypted; verification
/// still gets to finalise and the decrypt error is reported alongside.
pub fn decrypt_verify_status_handler(
    ctx: &Arc<Context>,
    code: StatusCode,
    args: &str,
) -> Result<()> {
    progress::status_handler(ctx, code, args)?;
    let decrypt_res = status_handler(ctx, code, args);
    match &decrypt_res {
        Ok(()) => {
            verify::status_handler(ctx, code, args)?;
            Ok(())
        }
        Err(Error::NoData) if code == StatusCode::Eof => {
            // The verify side still finalises, but the decrypt error
            // is what the operation reports.
            let _ = verify::status_handler(ctx, code, args);
            decrypt_res
        }
        Err(_) => decrypt_res,
    }
}

/// Snapshot the decryption result.
pub fn result(ctx: &Arc<Context>) -> Option<DecryptResult> {
    let hook = ctx.op_data_lookup::<DecryptOp>(OpDataKind::Decrypt, false)?;
    let result = hook.lock().unwrap().result.clone();
    Some(result)
}
