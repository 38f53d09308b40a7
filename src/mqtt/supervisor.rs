//! Reconnect supervision for the notification channel.
//!
//! The supervisor listens for [`ChannelEvent::ConnectionLost`] and re-issues
//! `connect()` followed by `resubscribe_all()`, waiting a bounded exponential
//! backoff (with up to 20% jitter) before every attempt.

use log::{error, info, warn};
use rand::Rng;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::channel::{ChannelEvent, NotificationChannel};
use crate::common::config::ReconnectConfig;

/// Backoff parameters for reconnecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Attempts per outage; 0 means unbounded
    pub max_attempts: u32,
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (1-based), before jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let max_jitter = delay.as_millis() as u64 / 5;
    if max_jitter == 0 {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(0..=max_jitter);
    delay + Duration::from_millis(jitter)
}

/// Background task keeping the channel connected.
pub struct ReconnectSupervisor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ReconnectSupervisor {
    /// Start supervising `channel`. The task stops when `parent` is cancelled or on [`stop`](Self::stop).
    pub fn spawn(
        channel: NotificationChannel,
        policy: ReconnectPolicy,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        // Subscribe before spawning so no loss event slips past
        let events = channel.events();
        let handle = tokio::spawn(supervise(channel, policy, events, cancel.clone()));
        Self { cancel, handle }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn supervise(
    channel: NotificationChannel,
    policy: ReconnectPolicy,
    mut events: tokio::sync::broadcast::Receiver<ChannelEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };

        match event {
            Ok(ChannelEvent::ConnectionLost(cause)) => {
                info!("🔄 Broker connection lost ({}), reconnecting", cause);
                if !reconnect(&channel, &policy, &cancel).await && !cancel.is_cancelled() {
                    error!(
                        "❌ Giving up on broker after {} attempts",
                        policy.max_attempts
                    );
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("⚠️  Supervisor skipped {} channel events", skipped);
            }
            Err(RecvError::Closed) => return,
        }
    }
}

async fn reconnect(
    channel: &NotificationChannel,
    policy: &ReconnectPolicy,
    cancel: &CancellationToken,
) -> bool {
    let mut attempt = 1;

    while policy.allows(attempt) {
        let delay = with_jitter(policy.delay_for(attempt));
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
        }

        match channel.connect().await {
            Ok(()) => {
                match channel.resubscribe_all().await {
                    Ok(restored) => info!(
                        "✅ Reconnected on attempt {} and restored {} subscription(s)",
                        attempt, restored
                    ),
                    // A second drop shows up as a new ConnectionLost event
                    Err(e) => warn!("⚠️  Reconnected but resubscribe failed: {}", e),
                }
                return true;
            }
            Err(e) => {
                warn!(
                    "🔄 Reconnect attempt {} failed: {} (next in ~{:?})",
                    attempt,
                    e,
                    policy.delay_for(attempt + 1)
                );
            }
        }

        attempt += 1;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_attempts: 5,
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(4), Duration::from_secs(4));
        assert_eq!(policy.delay_for(6), Duration::from_secs(8));
        assert_eq!(policy.delay_for(200), Duration::from_secs(8));
    }

    #[test]
    fn test_attempt_bound() {
        let mut policy = policy();
        assert!(policy.allows(5));
        assert!(!policy.allows(6));

        policy.max_attempts = 0;
        assert!(policy.allows(10_000));
    }

    #[test]
    fn test_jitter_stays_within_a_fifth() {
        let base = Duration::from_millis(1000);
        for _ in 0..50 {
            let delay = with_jitter(base);
            assert!(delay >= base);
            assert!(delay <= Duration::from_millis(1200));
        }
    }
}
