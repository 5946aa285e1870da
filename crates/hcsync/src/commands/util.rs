//! Shared helpers for command handlers.

use std::io::{self, BufRead, IsTerminal, Write};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use hcsync_core::{AuthEvent, Delivery, Engine, Message, SessionId, StatusKind};

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output::{format_auth_prompt, note, should_color};

/// Register a fresh session and wait until the engine has loaded devices.
///
/// Device-flow prompts are printed to stderr along the way.
pub async fn start_and_wait(
    engine: &Engine,
    wait: Duration,
    global: &GlobalOpts,
) -> Result<SessionId, CliError> {
    let session = SessionId::generate();
    let mut rx = engine.subscribe();
    engine.register_session(session.clone());
    wait_until_ready(&mut rx, &session, wait, global).await?;
    Ok(session)
}

pub async fn wait_until_ready(
    rx: &mut broadcast::Receiver<Delivery>,
    session: &SessionId,
    wait: Duration,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let color = should_color(global.color);
    let watch = async {
        loop {
            let delivery = match rx.recv().await {
                Ok(delivery) => delivery,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "message receiver lagged");
                    continue;
                }
                Err(RecvError::Closed) => {
                    return Err(CliError::Other("engine stopped unexpectedly".into()));
                }
            };
            if &delivery.session != session {
                continue;
            }
            if let Some(done) = readiness(&delivery.message, color, global.quiet) {
                return done;
            }
        }
    };

    tokio::time::timeout(wait, watch)
        .await
        .unwrap_or(Err(CliError::Timeout {
            seconds: wait.as_secs(),
        }))
}

/// `Some` once `message` settles the startup sequence.
pub fn readiness(message: &Message, color: bool, quiet: bool) -> Option<Result<(), CliError>> {
    match message {
        Message::Auth(AuthEvent::Waiting(prompt)) => {
            note(&format_auth_prompt(prompt, color), quiet);
            None
        }
        Message::Auth(AuthEvent::Error { message }) => {
            note(&format!("Authorization failed: {message}"), quiet);
            None
        }
        Message::Status(status) => match status.kind {
            StatusKind::Complete | StatusKind::NoDevices => Some(Ok(())),
            StatusKind::AuthFailed => Some(Err(CliError::AuthFailed {
                message: status.message.clone(),
            })),
            StatusKind::RateLimited => Some(Err(CliError::RateLimited {
                seconds: status.rate_limit_seconds.unwrap_or(60),
            })),
            StatusKind::ClientError | StatusKind::DeviceError => Some(Err(CliError::Upstream {
                reason: status.message.clone(),
            })),
            StatusKind::NeedAuth | StatusKind::ReauthRequired => {
                note(&status.message, quiet);
                None
            }
            kind => {
                debug!(%kind, message = %status.message, "status");
                None
            }
        },
        Message::Devices(_) | Message::ActivePrograms(_) | Message::Auth(_) => None,
    }
}

/// Prompt for confirmation, auto-approving if `--yes` was passed.
pub fn confirm(message: &str, yes_flag: bool) -> Result<bool, CliError> {
    if yes_flag {
        return Ok(true);
    }
    if !io::stdin().is_terminal() {
        return Err(CliError::ConfirmationRequired);
    }

    eprint!("{message} [y/N] ");
    io::stderr().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use hcsync_core::Notification;

    #[test]
    fn complete_and_no_devices_settle_successfully() {
        for kind in [StatusKind::Complete, StatusKind::NoDevices] {
            let done = readiness(&Message::status(kind, "done"), false, true).unwrap();
            assert!(done.is_ok());
        }
    }

    #[test]
    fn auth_failure_settles_with_an_error() {
        let done = readiness(
            &Message::status(StatusKind::AuthFailed, "Authentication failed"),
            false,
            true,
        )
        .unwrap();
        assert!(matches!(done, Err(CliError::AuthFailed { .. })));
    }

    #[test]
    fn rate_limit_carries_remaining_seconds() {
        let message = Message::Status(Notification {
            kind: StatusKind::RateLimited,
            message: "slow down".into(),
            rate_limit_seconds: Some(42),
        });
        let done = readiness(&message, false, true).unwrap();
        assert!(matches!(done, Err(CliError::RateLimited { seconds: 42 })));
    }

    #[test]
    fn progress_messages_do_not_settle() {
        for kind in [
            StatusKind::Initializing,
            StatusKind::NeedAuth,
            StatusKind::FetchingDevices,
        ] {
            assert!(readiness(&Message::status(kind, "working"), false, true).is_none());
        }
        let polling = Message::Auth(AuthEvent::Polling {
            attempt: 1,
            max_attempts: 10,
        });
        assert!(readiness(&polling, false, true).is_none());
    }
}
