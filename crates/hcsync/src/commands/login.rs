use std::time::Duration;

use hcsync_core::Engine;

use crate::cli::{GlobalOpts, LoginArgs};
use crate::error::CliError;
use crate::output;

use super::util;

/// Authenticate (restoring the stored token when it still works) and
/// report how many appliances the account exposes.
pub async fn handle(
    engine: &Engine,
    args: &LoginArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    util::start_and_wait(engine, Duration::from_secs(args.wait), global).await?;

    let count = engine.registry().len();
    output::note(
        &format!("Authorized. {count} appliance(s) available."),
        global.quiet,
    );
    Ok(())
}
