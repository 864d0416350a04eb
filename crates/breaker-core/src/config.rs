//! Hub configuration.
//!
//! A [`HubConfig`] is built once, validated by [`Hub::new`](crate::Hub::new)
//! and never changes afterwards.

use crate::error::HubError;
use crate::transport::FrameKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Default maximum inbound frame size in bytes.
pub const DEFAULT_MAX_READ_LIMIT: usize = 512;

/// Default broadcast queue depth.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 100;

/// Default per-client outbound queue depth.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 200;

/// Default interval between pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(50);

/// Default time allowed between pongs before a peer is considered dead.
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(60);

/// Default deadline for a single write.
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(15);

/// Callback receiving every error caught on a background task.
pub type ErrorHandler = Arc<dyn Fn(&HubError) + Send + Sync>;

/// The default error handler: log and move on.
pub fn log_error(err: &HubError) {
    error!(error = %err, "Hub error");
}

/// What the event loop does when a client's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlowConsumerPolicy {
    /// Wait for room. A stalled client delays every broadcast.
    #[default]
    Block,
    /// Skip that client for this message and count the drop.
    DropNewest,
}

/// Keepalive timings.
///
/// `ping_interval` must be shorter than `pong_wait` so a healthy peer's pong
/// always lands before the read deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Interval between pings sent by the write pump.
    pub ping_interval: Duration,
    /// Read deadline, refreshed on every pong.
    pub pong_wait: Duration,
    /// Deadline for each write.
    pub write_wait: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            pong_wait: DEFAULT_PONG_WAIT,
            write_wait: DEFAULT_WRITE_WAIT,
        }
    }
}

/// Hub configuration.
#[derive(Clone)]
pub struct HubConfig {
    /// Receives errors caught on background tasks.
    pub error_handler: ErrorHandler,
    /// Maximum inbound frame size in bytes.
    pub max_read_limit: usize,
    /// Depth of the broadcast queue before `broadcast` callers wait.
    pub broadcast_capacity: usize,
    /// Depth of each client's outbound queue.
    pub outbound_capacity: usize,
    /// Keepalive timings.
    pub keepalive: KeepaliveConfig,
    /// Frame kind used for outbound messages.
    pub frame_kind: FrameKind,
    /// Behaviour when a client's outbound queue is full.
    pub slow_consumer: SlowConsumerPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            error_handler: Arc::new(log_error),
            max_read_limit: DEFAULT_MAX_READ_LIMIT,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            keepalive: KeepaliveConfig::default(),
            frame_kind: FrameKind::default(),
            slow_consumer: SlowConsumerPolicy::default(),
        }
    }
}

impl fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubConfig")
            .field("max_read_limit", &self.max_read_limit)
            .field("broadcast_capacity", &self.broadcast_capacity)
            .field("outbound_capacity", &self.outbound_capacity)
            .field("keepalive", &self.keepalive)
            .field("frame_kind", &self.frame_kind)
            .field("slow_consumer", &self.slow_consumer)
            .finish_non_exhaustive()
    }
}

impl HubConfig {
    /// Replace the error handler.
    #[must_use]
    pub fn with_error_handler(mut self, handler: impl Fn(&HubError) + Send + Sync + 'static) -> Self {
        self.error_handler = Arc::new(handler);
        self
    }

    /// Check the configuration for values the hub cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<(), HubError> {
        if self.max_read_limit == 0 {
            return Err(HubError::InvalidConfig("max_read_limit must be > 0".into()));
        }
        if self.broadcast_capacity == 0 {
            return Err(HubError::InvalidConfig(
                "broadcast_capacity must be > 0".into(),
            ));
        }
        if self.outbound_capacity == 0 {
            return Err(HubError::InvalidConfig("outbound_capacity must be > 0".into()));
        }

        let keepalive = &self.keepalive;
        if keepalive.ping_interval.is_zero()
            || keepalive.pong_wait.is_zero()
            || keepalive.write_wait.is_zero()
        {
            return Err(HubError::InvalidConfig(
                "keepalive durations must be > 0".into(),
            ));
        }
        if keepalive.ping_interval >= keepalive.pong_wait {
            return Err(HubError::InvalidConfig(format!(
                "ping_interval ({:?}) must be shorter than pong_wait ({:?})",
                keepalive.ping_interval, keepalive.pong_wait
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HubConfig::default();
        assert_eq!(config.max_read_limit, 512);
        assert_eq!(config.broadcast_capacity, 100);
        assert_eq!(config.outbound_capacity, 200);
        assert_eq!(config.keepalive.ping_interval, Duration::from_secs(50));
        assert_eq!(config.keepalive.pong_wait, Duration::from_secs(60));
        assert_eq!(config.frame_kind, FrameKind::Text);
        assert_eq!(config.slow_consumer, SlowConsumerPolicy::Block);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ping_must_precede_pong_deadline() {
        let mut config = HubConfig::default();
        config.keepalive.ping_interval = config.keepalive.pong_wait;
        assert!(matches!(
            config.validate(),
            Err(HubError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = HubConfig {
            broadcast_capacity: 0,
            ..HubConfig::default()
        };
        assert!(config.validate().is_err());

        let config = HubConfig {
            outbound_capacity: 0,
            ..HubConfig::default()
        };
        assert!(config.validate().is_err());

        let config = HubConfig {
            max_read_limit: 0,
            ..HubConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = HubConfig::default();
        config.keepalive.write_wait = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enums_from_toml() {
        #[derive(Deserialize)]
        struct Section {
            frame_kind: FrameKind,
            slow_consumer: SlowConsumerPolicy,
        }

        let section: Section = toml::from_str(
            r#"
            frame_kind = "binary"
            slow_consumer = "drop_newest"
        "#,
        )
        .unwrap();
        assert_eq!(section.frame_kind, FrameKind::Binary);
        assert_eq!(section.slow_consumer, SlowConsumerPolicy::DropNewest);
    }

    #[test]
    fn test_debug_skips_handler() {
        let rendered = format!("{:?}", HubConfig::default());
        assert!(rendered.contains("max_read_limit: 512"));
        assert!(!rendered.contains("error_handler"));
    }
}
