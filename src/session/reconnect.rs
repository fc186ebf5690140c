//! Pure reconnection and health logic
//!
//! Nothing here touches the transport or the clock beyond reading
//! `Instant::now()`; the actor in `manager.rs` asks these functions what to do
//! and carries out the answer.

use super::connection::ConnectionState;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// How the delay between reconnection attempts evolves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// Same delay before every attempt
    #[default]
    Fixed,
    /// Delay doubles per attempt up to `max_delay_ms`
    Exponential { max_delay_ms: u64 },
}

/// Reconnection limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Automatic attempts after a failure before giving up
    pub max_attempts: u32,
    /// Base delay before each attempt
    pub delay_ms: u64,
    pub backoff: BackoffStrategy,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 5000,
            backoff: BackoffStrategy::Fixed,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given attempt (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        match self.backoff {
            BackoffStrategy::Fixed => self.delay_ms,
            BackoffStrategy::Exponential { max_delay_ms } => {
                let exponent = attempt.saturating_sub(1).min(63);
                let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
                self.delay_ms.saturating_mul(factor).min(max_delay_ms)
            }
        }
    }

    /// Total time spent waiting if every attempt fails
    pub fn calculate_max_total_time(&self) -> u64 {
        (1..=self.max_attempts)
            .map(|attempt| self.calculate_backoff_delay(attempt))
            .fold(0u64, u64::saturating_add)
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectionDecision {
    /// Schedule `attempt` after `delay_ms`
    Proceed { attempt: u32, delay_ms: u64 },
    /// Session is being torn down
    AbortShutdownRequested,
    /// Counter reached the configured maximum
    AbortMaxAttemptsExceeded,
}

/// Decide whether another automatic attempt should be scheduled
pub fn should_attempt_reconnection(
    current_attempts: u32,
    config: &ReconnectConfig,
    shutdown_requested: bool,
) -> ReconnectionDecision {
    if shutdown_requested {
        return ReconnectionDecision::AbortShutdownRequested;
    }

    if current_attempts >= config.max_attempts {
        return ReconnectionDecision::AbortMaxAttemptsExceeded;
    }

    let attempt = current_attempts + 1;
    ReconnectionDecision::Proceed {
        attempt,
        delay_ms: config.calculate_backoff_delay(attempt),
    }
}

/// Log a connection state transition
pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!("Session connected");
        }
        (ConnectionState::Connected, ConnectionState::Reconnecting { attempt }) => {
            warn!(attempt, "Connection lost, reconnect scheduled");
        }
        (ConnectionState::Connected, ConnectionState::Disconnected) => {
            info!("Session disconnected");
        }
        (ConnectionState::Connecting, ConnectionState::Reconnecting { attempt }) => {
            warn!(attempt, "Connect attempt failed, reconnect scheduled");
        }
        (ConnectionState::Connecting, ConnectionState::Disconnected) => {
            error!("Connect attempt failed, no further attempts");
        }
        (_, ConnectionState::Disposed) => {
            info!("Session disposed");
        }
        _ => {
            info!("Connection state: {:?} -> {:?}", from, to);
        }
    }
}

/// Point-in-time view of a session's health
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthMetrics {
    pub state: ConnectionState,
    /// Time since the current connection was established
    pub uptime: Option<Duration>,
    pub time_since_last_message: Option<Duration>,
    /// Attempts made in the current reconnection cycle
    pub reconnect_attempts: u32,
    /// Successful connections after the first one
    pub total_reconnects: u64,
    pub subscriptions: usize,
    pub queued_messages: usize,
    pub is_healthy: bool,
}

/// Inputs for [`calculate_health_metrics`]
#[derive(Debug, Clone, Default)]
pub struct HealthInputs {
    pub state: ConnectionState,
    pub connected_since: Option<Instant>,
    pub last_message_time: Option<Instant>,
    pub reconnect_attempts: u32,
    pub total_reconnects: u64,
    pub subscriptions: usize,
    pub queued_messages: usize,
}

const STALE_AFTER: Duration = Duration::from_secs(300);

pub fn calculate_health_metrics(inputs: HealthInputs) -> HealthMetrics {
    let now = Instant::now();
    let connected = inputs.state == ConnectionState::Connected;

    let uptime = inputs
        .connected_since
        .filter(|_| connected)
        .map(|t| now.duration_since(t));
    let time_since_last_message = inputs.last_message_time.map(|t| now.duration_since(t));

    HealthMetrics {
        is_healthy: determine_health_status(uptime, time_since_last_message),
        state: inputs.state,
        uptime,
        time_since_last_message,
        reconnect_attempts: inputs.reconnect_attempts,
        total_reconnects: inputs.total_reconnects,
        subscriptions: inputs.subscriptions,
        queued_messages: inputs.queued_messages,
    }
}

// Healthy: connected, and either silent so far or heard from in the last five minutes
fn determine_health_status(
    uptime: Option<Duration>,
    time_since_last_message: Option<Duration>,
) -> bool {
    match (uptime, time_since_last_message) {
        (Some(_), None) => true,
        (Some(_), Some(last_msg)) => last_msg < STALE_AFTER,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(max_attempts: u32, delay_ms: u64) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts,
            delay_ms,
            backoff: BackoffStrategy::Fixed,
        }
    }

    #[test]
    fn test_fixed_backoff_is_constant() {
        let config = fixed(5, 5000);
        assert_eq!(config.calculate_backoff_delay(1), 5000);
        assert_eq!(config.calculate_backoff_delay(5), 5000);
        assert_eq!(config.calculate_max_total_time(), 25_000);
    }

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let config = ReconnectConfig {
            max_attempts: 6,
            delay_ms: 1000,
            backoff: BackoffStrategy::Exponential {
                max_delay_ms: 10_000,
            },
        };
        assert_eq!(config.calculate_backoff_delay(1), 1000);
        assert_eq!(config.calculate_backoff_delay(2), 2000);
        assert_eq!(config.calculate_backoff_delay(4), 8000);
        assert_eq!(config.calculate_backoff_delay(5), 10_000);
        assert_eq!(config.calculate_backoff_delay(200), 10_000);
    }

    #[test]
    fn test_should_attempt_reconnection() {
        let config = fixed(3, 100);

        assert_eq!(
            should_attempt_reconnection(0, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 100
            }
        );
        assert_eq!(
            should_attempt_reconnection(2, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 3,
                delay_ms: 100
            }
        );
        assert_eq!(
            should_attempt_reconnection(3, &config, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_shutdown_wins_over_remaining_attempts() {
        let config = fixed(3, 100);
        assert_eq!(
            should_attempt_reconnection(0, &config, true),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_zero_max_attempts_never_retries() {
        let config = fixed(0, 100);
        assert_eq!(
            should_attempt_reconnection(0, &config, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
        assert_eq!(config.calculate_max_total_time(), 0);
    }

    #[test]
    fn test_health_when_connected_without_traffic() {
        let metrics = calculate_health_metrics(HealthInputs {
            state: ConnectionState::Connected,
            connected_since: Some(Instant::now()),
            subscriptions: 2,
            ..Default::default()
        });
        assert!(metrics.is_healthy);
        assert!(metrics.uptime.is_some());
        assert_eq!(metrics.subscriptions, 2);
    }

    #[test]
    fn test_health_when_disconnected() {
        let metrics = calculate_health_metrics(HealthInputs {
            state: ConnectionState::Reconnecting { attempt: 2 },
            connected_since: Some(Instant::now()),
            reconnect_attempts: 2,
            queued_messages: 4,
            ..Default::default()
        });
        assert!(!metrics.is_healthy);
        assert!(metrics.uptime.is_none());
        assert_eq!(metrics.queued_messages, 4);
    }

    #[test]
    fn test_stale_traffic_is_unhealthy() {
        assert!(!determine_health_status(
            Some(Duration::from_secs(1000)),
            Some(Duration::from_secs(301))
        ));
        assert!(determine_health_status(
            Some(Duration::from_secs(1000)),
            Some(Duration::from_secs(10))
        ));
    }
}
