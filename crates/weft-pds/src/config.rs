//! Firehose tuning knobs

use std::time::Duration;

/// Firehose configuration
///
/// Every knob can also come from the environment variable of the same name
/// via [`FirehoseConfig::from_env`].
#[derive(Debug, Clone)]
pub struct FirehoseConfig {
    /// Capacity of the in-memory rollback buffer (`ROLLBACK_WINDOW`)
    pub rollback_window: usize,

    /// How many recent events the collector preloads from durable storage at
    /// startup (`PRELOAD_WINDOW`)
    pub preload_window: usize,

    /// How long the collector waits for new events, and for a skipped seq to
    /// materialise, before moving on (`NEW_EVENTS_TIMEOUT`, seconds)
    pub new_events_timeout: Duration,

    /// Pause between collector batches (`SUBSCRIBE_REPOS_BATCH_DELAY`,
    /// seconds; 0 disables)
    pub subscribe_repos_batch_delay: Duration,

    /// A missing seq more than this far behind the stream head is skipped
    /// without waiting (`WAIT_FOR_SKIPPED_SEQ_WINDOW`)
    pub wait_for_skipped_seq_window: i64,
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            rollback_window: 50_000,
            preload_window: 4_000,
            new_events_timeout: Duration::from_secs(20),
            subscribe_repos_batch_delay: Duration::ZERO,
            wait_for_skipped_seq_window: 1_000,
        }
    }
}

impl FirehoseConfig {
    /// Build a config from the environment, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            rollback_window: env_parse("ROLLBACK_WINDOW", defaults.rollback_window),
            preload_window: env_parse("PRELOAD_WINDOW", defaults.preload_window),
            new_events_timeout: Duration::from_secs_f64(env_parse(
                "NEW_EVENTS_TIMEOUT",
                defaults.new_events_timeout.as_secs_f64(),
            )),
            subscribe_repos_batch_delay: Duration::from_secs_f64(env_parse(
                "SUBSCRIBE_REPOS_BATCH_DELAY",
                0.0,
            )),
            wait_for_skipped_seq_window: env_parse(
                "WAIT_FOR_SKIPPED_SEQ_WINDOW",
                defaults.wait_for_skipped_seq_window,
            ),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
