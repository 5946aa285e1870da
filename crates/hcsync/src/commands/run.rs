//! Foreground engine: every message for this session becomes one JSON line.

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use hcsync_core::{Engine, Message, SessionId, StatusKind};

use crate::cli::{GlobalOpts, RunArgs};
use crate::error::CliError;
use crate::output;

pub async fn handle(engine: &Engine, args: RunArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let session = args
        .session
        .map_or_else(SessionId::generate, SessionId::new);
    let mut rx = engine.subscribe();
    engine.register_session(session.clone());
    info!(%session, "session registered, streaming messages");

    let mut programs = args.programs_every.filter(|s| *s > 0).map(|secs| {
        let mut interval = tokio::time::interval(Duration::from_secs(secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            biased;
            _ = &mut ctrl_c => {
                output::note("Stopping.", global.quiet);
                return Ok(());
            }
            received = rx.recv() => match received {
                Ok(delivery) if delivery.session == session => {
                    let line = output::render_json(delivery.message.as_ref(), true)?;
                    output::print_output(&line, global.quiet);
                    if delivery.message.status_kind() == Some(StatusKind::AuthFailed) {
                        return Err(CliError::AuthFailed {
                            message: status_text(&delivery.message),
                        });
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "message receiver lagged"),
                Err(RecvError::Closed) => return Ok(()),
            },
            () = next_tick(programs.as_mut()) => {
                if !engine.is_authenticated() {
                    continue;
                }
                match engine
                    .request_active_programs(&[], Some(session.clone()), false)
                    .await
                {
                    Ok(outcome) => debug!(?outcome, "active-program batch"),
                    Err(e) => debug!(error = %e, "active-program batch refused"),
                }
            }
        }
    }
}

async fn next_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn status_text(message: &Message) -> String {
    match message {
        Message::Status(status) => status.message.clone(),
        _ => String::new(),
    }
}
