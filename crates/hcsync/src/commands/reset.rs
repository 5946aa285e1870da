use hcsync_core::Engine;

use crate::cli::{GlobalOpts, ResetArgs};
use crate::error::CliError;
use crate::output;

use super::util;

pub fn handle(engine: &Engine, args: &ResetArgs, global: &GlobalOpts) -> Result<(), CliError> {
    if !util::confirm("Forget the stored Home Connect token?", args.yes)? {
        output::note("Aborted.", global.quiet);
        return Ok(());
    }
    engine.retry_authentication();
    output::note(
        "Stored token removed. The next command starts a new device authorization.",
        global.quiet,
    );
    Ok(())
}
