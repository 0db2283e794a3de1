use clap::Args;
use std::time::Duration;

/// Timing knobs of the controller.
#[derive(Args, Clone, Debug)]
pub struct ControllerConfig {
    #[clap(
        long,
        env = "RESYNC_INTERVAL",
        help = "Re-evaluate every record after this long, even without changes",
        default_value = "5m",
        value_parser = humantime::parse_duration
    )]
    pub resync_interval: Duration,

    #[clap(
        long,
        env = "ERROR_REQUEUE",
        help = "Requeue delay after a failed reconciliation",
        default_value = "15s",
        value_parser = humantime::parse_duration
    )]
    pub error_requeue: Duration,

    #[clap(
        long,
        env = "PROVIDER_TIMEOUT",
        help = "Timeout of a single provider request",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub provider_timeout: Duration,

    #[clap(
        long,
        env = "RETRY_INITIAL_INTERVAL",
        help = "First delay before retrying a transient provider error",
        default_value = "100ms",
        value_parser = humantime::parse_duration
    )]
    pub retry_initial_interval: Duration,

    #[clap(
        long,
        env = "RETRY_MAX_INTERVAL",
        help = "Upper bound of the delay between provider retries",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub retry_max_interval: Duration,

    #[clap(
        long,
        env = "RETRY_MAX_ELAPSED",
        help = "Give up retrying a provider call after this long",
        default_value = "2m",
        value_parser = humantime::parse_duration
    )]
    pub retry_max_elapsed: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(5 * 60),
            error_requeue: Duration::from_secs(15),
            provider_timeout: Duration::from_secs(30),
            retry_initial_interval: Duration::from_millis(100),
            retry_max_interval: Duration::from_secs(30),
            retry_max_elapsed: Duration::from_secs(2 * 60),
        }
    }
}

impl ControllerConfig {
    pub fn backoff(&self) -> crate::retry::ExponentialBackoff {
        crate::retry::ExponentialBackoff::new(
            self.retry_initial_interval,
            self.retry_max_interval,
            Some(self.retry_max_elapsed),
        )
    }
}
