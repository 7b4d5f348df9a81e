//! Progress reporting and pinentry launch tracking.

use std::sync::Arc;

use crate::context::Context;
use crate::error::Result;
use crate::status::StatusCode;
use crate::util;

/// Handle PROGRESS and PINENTRY_LAUNCHED lines.  Composed in front of
/// most operation handlers.
pub fn status_handler(ctx: &Arc<Context>, code: StatusCode, args: &str) -> Result<()> {
    match code {
        StatusCode::Progress => {
            let fields = util::split_fields(args);
            if fields.len() < 4 {
                return Ok(());
            }
            let what = fields[0];
            let typ = fields[1].bytes().next().unwrap_or(b'?') as i32;
            let current = fields[2].parse::<u64>().unwrap_or(0);
            let total = fields[3].parse::<u64>().unwrap_or(0);
            ctx.call_progress(what, typ, current, total);
        }
        StatusCode::PinentryLaunched => {
            ctx.suggest_redraw();
        }
        _ => {}
    }
    Ok(())
}
