// ── OAuth device flow ──
//
// Request a device code, show it to the user, then poll the token
// endpoint until the user approves, denies, or the code runs out.

use std::time::Duration;

use tracing::{debug, info, warn};

use hcsync_api::{DeviceAuthorization, OAuthClient, TokenPoll, TokenResponse};

use crate::error::CoreError;

/// Polling policy for the device flow.
#[derive(Debug, Clone)]
pub struct DeviceFlowConfig {
    /// Lower bound on the poll interval, whatever the server suggests.
    pub min_interval: Duration,
    /// Added to the interval on every `slow_down`.
    pub slow_down_step: Duration,
    /// Interval floor once the server has asked us to slow down.
    pub slow_down_floor: Duration,
    /// Upper bound on the whole handshake.
    pub overall_timeout: Duration,
}

impl Default for DeviceFlowConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(5),
            slow_down_step: Duration::from_secs(5),
            slow_down_floor: Duration::from_secs(10),
            overall_timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Poll interval and attempt budget for one device code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSchedule {
    interval: Duration,
    slow_down_step: Duration,
    slow_down_floor: Duration,
    attempt: u32,
    max_attempts: u32,
}

impl PollSchedule {
    pub fn new(authorization: &DeviceAuthorization, config: &DeviceFlowConfig) -> Self {
        let suggested = Duration::from_secs(authorization.interval.unwrap_or(0));
        let interval = suggested.max(config.min_interval);
        let lifetime = Duration::from_secs(authorization.expires_in);
        let budget = lifetime
            .as_millis()
            .checked_div(interval.as_millis())
            .unwrap_or(1);
        Self {
            interval,
            slow_down_step: config.slow_down_step,
            slow_down_floor: config.slow_down_floor,
            attempt: 0,
            max_attempts: u32::try_from(budget).unwrap_or(u32::MAX).max(1),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Lengthen the interval after a `slow_down` answer.
    pub fn slow_down(&mut self) {
        self.interval = (self.interval + self.slow_down_step).max(self.slow_down_floor);
    }

    /// Claim the next attempt number, or `None` once the budget is spent.
    pub fn next_attempt(&mut self) -> Option<u32> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.attempt)
    }
}

/// Progress reported while the handshake runs.
#[derive(Debug, Clone)]
pub enum FlowProgress {
    /// Show these to the user.
    Prompt(DeviceAuthorization),
    Polling { attempt: u32, max_attempts: u32 },
    SlowedDown { interval: Duration },
}

/// Runs one device-flow handshake.
pub struct DeviceFlowAuthenticator<'a> {
    oauth: &'a OAuthClient,
    config: DeviceFlowConfig,
}

impl<'a> DeviceFlowAuthenticator<'a> {
    pub fn new(oauth: &'a OAuthClient, config: DeviceFlowConfig) -> Self {
        Self { oauth, config }
    }

    /// Obtain a token through the device flow.
    ///
    /// `on_progress` sees the user prompt first, then one call per poll.
    pub async fn authenticate(
        &self,
        mut on_progress: impl FnMut(FlowProgress) + Send,
    ) -> Result<TokenResponse, CoreError> {
        let timeout = self.config.overall_timeout;
        match tokio::time::timeout(timeout, self.run(&mut on_progress)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "device flow timed out");
                Err(CoreError::Timeout {
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }

    async fn run(
        &self,
        on_progress: &mut (impl FnMut(FlowProgress) + Send),
    ) -> Result<TokenResponse, CoreError> {
        let authorization = self.oauth.request_device_code().await?;
        info!(
            client_id = self.oauth.client_id(),
            verification_uri = %authorization.verification_uri,
            expires_in = authorization.expires_in,
            "device code issued, waiting for user approval"
        );

        let mut schedule = PollSchedule::new(&authorization, &self.config);
        on_progress(FlowProgress::Prompt(authorization.clone()));

        while let Some(attempt) = schedule.next_attempt() {
            tokio::time::sleep(schedule.interval()).await;
            on_progress(FlowProgress::Polling {
                attempt,
                max_attempts: schedule.max_attempts(),
            });

            match self.oauth.poll_device_token(&authorization.device_code).await {
                Ok(TokenPoll::Granted(token)) => {
                    info!(attempt, "device flow approved");
                    return Ok(token);
                }
                Ok(TokenPoll::Pending) => {
                    debug!(attempt, "authorization pending");
                }
                Ok(TokenPoll::SlowDown) => {
                    schedule.slow_down();
                    debug!(
                        interval_secs = schedule.interval().as_secs(),
                        "token endpoint asked to slow down"
                    );
                    on_progress(FlowProgress::SlowedDown {
                        interval: schedule.interval(),
                    });
                }
                Err(e) if e.is_rate_limited() => {
                    warn!(attempt, error = %e, "token endpoint rate limited, giving up");
                    return Err(e.into());
                }
                Err(e) if matches!(e, hcsync_api::Error::Transport(_)) || e.is_transient() => {
                    warn!(attempt, error = %e, "token poll failed, continuing");
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(attempts = schedule.max_attempts(), "device code expired before approval");
        Err(CoreError::AuthTimeout {
            attempts: schedule.max_attempts(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn authorization(expires_in: u64, interval: Option<u64>) -> DeviceAuthorization {
        DeviceAuthorization {
            device_code: "dc".into(),
            user_code: "ABCD".into(),
            verification_uri: "https://example.test/verify".into(),
            verification_uri_complete: None,
            expires_in,
            interval,
        }
    }

    #[test]
    fn interval_has_a_floor() {
        let schedule = PollSchedule::new(&authorization(600, Some(1)), &DeviceFlowConfig::default());
        assert_eq!(schedule.interval(), Duration::from_secs(5));
        assert_eq!(schedule.max_attempts(), 120);
    }

    #[test]
    fn server_interval_wins_when_larger() {
        let schedule = PollSchedule::new(&authorization(300, Some(20)), &DeviceFlowConfig::default());
        assert_eq!(schedule.interval(), Duration::from_secs(20));
        assert_eq!(schedule.max_attempts(), 15);
    }

    #[test]
    fn slow_down_adds_step_with_floor() {
        let mut schedule = PollSchedule::new(&authorization(300, None), &DeviceFlowConfig::default());
        schedule.slow_down();
        assert_eq!(schedule.interval(), Duration::from_secs(10));
        schedule.slow_down();
        assert_eq!(schedule.interval(), Duration::from_secs(15));
    }

    #[test]
    fn attempts_are_bounded_with_minimum_one() {
        let mut schedule = PollSchedule::new(&authorization(2, None), &DeviceFlowConfig::default());
        assert_eq!(schedule.max_attempts(), 1);
        assert_eq!(schedule.next_attempt(), Some(1));
        assert_eq!(schedule.next_attempt(), None);
    }
}
