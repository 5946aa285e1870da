use std::time::Duration;

use hcsync_core::{BatchOutcome, Engine};
use tracing::info;

use crate::cli::{DevicesArgs, GlobalOpts};
use crate::error::CliError;
use crate::output::{self, ApplianceRow};

use super::util;

pub async fn handle(
    engine: &Engine,
    args: &DevicesArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let session = util::start_and_wait(engine, Duration::from_secs(args.wait), global).await?;

    if args.programs && !engine.registry().is_empty() {
        match engine
            .request_active_programs(&[], Some(session), true)
            .await?
        {
            BatchOutcome::Completed {
                fetched,
                skipped,
                retries_scheduled,
            } => info!(fetched, skipped, retries_scheduled, "active programs loaded"),
            BatchOutcome::RateLimited { cooldown: wait }
            | BatchOutcome::Suppressed { remaining: wait } => {
                return Err(CliError::RateLimited {
                    seconds: wait.as_secs(),
                });
            }
            BatchOutcome::Throttled { .. } => {}
        }
    }

    let devices = engine.devices_snapshot();
    let out = output::render_list(
        global.output,
        devices.as_slice(),
        |a| ApplianceRow::from(a.as_ref()),
        |a| a.id.clone(),
    )?;
    output::print_output(&out, global.quiet);
    Ok(())
}
