//! Per-session configuration.

use std::time::Duration;

use crate::error::{Result, RtspError};

/// Default ring capacity in packets.
pub const DEFAULT_RING_CAPACITY: usize = 1000;

/// Default lag threshold in packets. A subscriber that falls further than
/// this behind the producer is skipped forward to the newest keyframe.
pub const DEFAULT_LAG_THRESHOLD: i64 = 300;

/// Options applied to each upstream session a
/// [`Provider`](crate::Provider) opens.
///
/// All fields are optional in the sense that [`Default`] gives a working
/// configuration; a zero duration disables the corresponding behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// TCP connect timeout. Zero means no timeout.
    pub dial_timeout: Duration,
    /// Interval between OPTIONS keep-alive requests. Zero disables
    /// keep-alives.
    pub keepalive_interval: Duration,
    /// Number of packet slots in the shared ring buffer.
    pub ring_capacity: usize,
    /// Maximum subscriber lag, in packets, before a skip-forward. Must be
    /// strictly less than `ring_capacity`.
    pub lag_threshold: i64,
    /// Value of the `User-Agent` header sent on every request, if any.
    pub user_agent: Option<String>,
    /// Extra header lines (`Name: value`, no CRLF) appended to every
    /// request.
    pub extra_headers: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::ZERO,
            keepalive_interval: Duration::ZERO,
            ring_capacity: DEFAULT_RING_CAPACITY,
            lag_threshold: DEFAULT_LAG_THRESHOLD,
            user_agent: None,
            extra_headers: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Validate internal consistency before a session is constructed.
    ///
    /// The lag threshold must leave a capacity margin: the producer never
    /// blocks, so the slots between `lag_threshold` and `ring_capacity`
    /// are what keeps it from overwriting a slot a reader still points at.
    pub fn validate(&self) -> Result<()> {
        if self.ring_capacity == 0 {
            return Err(RtspError::InvalidConfig(
                "ring_capacity must be non-zero".to_string(),
            ));
        }
        if self.lag_threshold < 0 || self.lag_threshold as usize >= self.ring_capacity {
            return Err(RtspError::InvalidConfig(format!(
                "lag_threshold ({}) must be in 0..ring_capacity ({})",
                self.lag_threshold, self.ring_capacity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn lag_threshold_must_be_below_capacity() {
        let cfg = SessionConfig {
            ring_capacity: 100,
            lag_threshold: 100,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = SessionConfig {
            ring_capacity: 100,
            lag_threshold: 99,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_capacity_rejected() {
        let cfg = SessionConfig {
            ring_capacity: 0,
            lag_threshold: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
