//! Import status handling: per-key status records and the summary
//! counters from IMPORT_RES.

use std::sync::Arc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::ops::{self, progress, OpDataKind};
use crate::status::StatusCode;
use crate::util;

/// One imported (or rejected) key.
#[derive(Debug, Clone, Default)]
pub struct ImportStatus {
    pub fpr: Option<String>,
    /// `None` on success, otherwise why the key was not imported.
    pub result: Option<Error>,
    /// Bit field from IMPORT_OK: 1 new key, 2 new uids, 4 new sigs,
    /// 8 new subkeys, 16 contains secret key.
    pub status: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ImportResult {
    pub considered: i32,
    pub no_user_id: i32,
    pub imported: i32,
    pub imported_rsa: i32,
    pub unchanged: i32,
    pub new_user_ids: i32,
    pub new_sub_keys: i32,
    pub new_signatures: i32,
    pub new_revocations: i32,
    pub secret_read: i32,
    pub secret_imported: i32,
    pub secret_unchanged: i32,
    pub skipped_new_keys: i32,
    pub not_imported: i32,
    pub skipped_v3_keys: i32,
    pub imports: Vec<ImportStatus>,
}

#[derive(Default)]
pub struct ImportOp {
    pub result: ImportResult,
    failure_code: Option<Error>,
}

pub fn init_result(ctx: &Arc<Context>) -> Result<()> {
    ctx.op_data_lookup::<ImportOp>(OpDataKind::Import, true).ok_or(Error::InvValue)?;
    Ok(())
}

/// IMPORT_OK / IMPORT_PROBLEM: `<nr> [<fpr>]`.
fn parse_import(args: &str, problem: bool) -> Result<ImportStatus> {
    let fields = util::split_fields(args);
    let nr: u32 = fields
        .first()
        .and_then(|f| f.parse().ok())
        .ok_or(Error::InvEngine)?;

    let mut import = ImportStatus::default();
    if problem {
        import.result = Some(match nr {
            1 => Error::BadCert,
            2 => Error::MissingIssuerCert,
            3 => Error::BadCertChain,
            _ => Error::General,
        });
    } else {
        import.status = nr;
    }
    import.fpr = fields.get(1).map(|f| f.to_string());
    Ok(import)
}

/// IMPORT_RES carries fifteen counters; engines older than the last
/// field's introduction send fourteen.
fn parse_import_res(args: &str, result: &mut ImportResult) -> Result<()> {
    let fields = util::split_fields(args);
    if fields.len() < 14 {
        return Err(Error::InvEngine);
    }
    let parse = |idx: usize| -> Result<i32> {
        fields[idx].parse().map_err(|_| Error::InvEngine)
    };
    result.considered = parse(0)?;
    result.no_user_id = parse(1)?;
    result.imported = parse(2)?;
    result.imported_rsa = parse(3)?;
    result.unchanged = parse(4)?;
    result.new_user_ids = parse(5)?;
    result.new_sub_keys = parse(6)?;
    result.new_signatures = parse(7)?;
    result.new_revocations = parse(8)?;
    result.secret_read = parse(9)?;
    result.secret_imported = parse(10)?;
    result.secret_unchanged = parse(11)?;
    result.skipped_new_keys = parse(12)?;
    result.not_imported = parse(13)?;
    if fields.len() > 14 {
        result.skipped_v3_keys = parse(14)?;
    }
    Ok(())
}

pub fn status_handler(ctx: &Arc<Context>, code: StatusCode, args: &str) -> Result<()> {
    let hook =
        ctx.op_data_lookup::<ImportOp>(OpDataKind::Import, false).ok_or(Error::InvValue)?;
    let mut opd = hook.lock().unwrap();

    match code {
        StatusCode::ImportOk | StatusCode::ImportProblem => {
            let import = parse_import(args, code == StatusCode::ImportProblem)?;
            opd.result.imports.push(import);
        }

        StatusCode::ImportRes => {
            parse_import_res(args, &mut opd.result)?;
        }

        StatusCode::Error => {
            // A PKCS#12 container that failed to decrypt shows up only
            // as this error; synthesize an import status for it.
            let (location, err) = ops::parse_error_line(args)?;
            if location == "import.parsep12" && err == Some(Error::BadPassphrase) {
                opd.result.imports.push(ImportStatus {
                    fpr: None,
                    result: Some(Error::BadPassphrase),
                    status: 0,
                });
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
            if let Some(code) = opd.failure_code {
                return Err(code);
            }
        }

        _ => {}
    }
    Ok(())
}

pub fn composed_status_handler(ctx: &Arc<Context>, code: StatusCode, args: &str) -> Result<()> {
    progress::status_handler(ctx, code, args)?;
    status_handler(ctx, code, args)
}

pub fn result(ctx: &Arc<Context>) -> Option<ImportResult> {
    let hook = ctx.op_data_lookup::<ImportOp>(OpDataKind::Import, false)?;
    let result = hook.lock().unwrap().result.clone();
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_import_outcome() {
        let ctx = Context::new();
        init_result(&ctx).unwrap();
        status_handler(&ctx, StatusCode::ImportOk, "1 AAAA").unwrap();
        status_handler(&ctx, StatusCode::ImportProblem, "2 BBBB").unwrap();
        status_handler(&ctx, StatusCode::ImportRes, "2 0 1 0 0 0 0 0 0 0 0 0 0 1 0").unwrap();
        status_handler(&ctx, StatusCode::Eof, "").unwrap();

        let result = result(&ctx).unwrap();
        assert_eq!(result.imports.len(), 2);
        assert_eq!(result.imports[0].fpr.as_deref(), Some("AAAA"));
        assert_eq!(result.imports[0].status, 1);
        assert_eq!(result.imports[0].result, None);
        assert_eq!(result.imports[1].fpr.as_deref(), Some("BBBB"));
        assert_eq!(result.imports[1].status, 0);
        assert_eq!(result.imports[1].result, Some(Error::MissingIssuerCert));
        assert_eq!(result.considered, 2);
        assert_eq!(result.imported, 1);
        assert_eq!(result.not_imported, 1);
        assert_eq!(result.skipped_v3_keys, 0);
    }

    #[test]
    fn problem_codes_map_to_cert_errors() {
        assert_eq!(parse_import("1 X", true).unwrap().result, Some(Error::BadCert));
        assert_eq!(parse_import("2 X", true).unwrap().result, Some(Error::MissingIssuerCert));
        assert_eq!(parse_import("3 X", true).unwrap().result, Some(Error::BadCertChain));
        assert_eq!(parse_import("4 X", true).unwrap().result, Some(Error::General));
        assert_eq!(parse_import("0 X", true).unwrap().result, Some(Error::General));
        assert!(parse_import("zz", true).is_err());
    }

    #[test]
    fn import_res_tolerates_fourteen_fields() {
        let mut result = ImportResult::default();
        parse_import_res("1 0 1 0 0 0 0 0 0 0 0 0 0 0", &mut result).unwrap();
        assert_eq!(result.skipped_v3_keys, 0);
        assert!(parse_import_res("1 2 3", &mut result).is_err());
    }

    #[test]
    fn parsep12_error_synthesizes_bad_passphrase_entry() {
        let ctx = Context::new();
        init_result(&ctx).unwrap();
        status_handler(&ctx, StatusCode::Error, "import.parsep12 11").unwrap();
        // Unknown locations stay informational.
        status_handler(&ctx, StatusCode::Error, "somewhere.else 11").unwrap();
        let result = result(&ctx).unwrap();
        assert_eq!(result.imports.len(), 1);
        assert_eq!(result.imports[0].result, Some(Error::BadPassphrase));
        assert_eq!(result.imports[0].fpr, None);
    }
}
