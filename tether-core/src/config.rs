//! Delivery configuration: retry budget, retry timing, frame budget.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::chunk::DEFAULT_FRAME_LIMIT;
use crate::outbox::DEFAULT_MAX_RETRIES;
use crate::wire::CHUNK_FRAME_OVERHEAD;

/// Largest data payload the peer link accepts in one message (bytes).
pub const DEFAULT_MAX_PAYLOAD: usize = 124;

/// Upper bound on the backoff exponent, so `base_ms << n` cannot overflow.
const MAX_BACKOFF_SHIFT: u32 = 16;

/// When to resend after a Nack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Resend in the same step that handled the Nack.
    #[default]
    Immediate,
    /// Exponential backoff `base_ms * 2^(n-1)` capped at `max_ms`; with `jitter`, a uniform draw in `[0, delay]`.
    Backoff {
        base_ms: u64,
        max_ms: u64,
        #[serde(default)]
        jitter: bool,
    },
}

impl RetryPolicy {
    /// Delay before resend number `attempt` (1-based). `None` means resend now.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match *self {
            RetryPolicy::Immediate => None,
            RetryPolicy::Backoff {
                base_ms,
                max_ms,
                jitter,
            } => {
                let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
                let ms = base_ms.saturating_mul(1u64 << shift).min(max_ms);
                let ms = if jitter && ms > 0 {
                    rand::thread_rng().gen_range(0..=ms)
                } else {
                    ms
                };
                Some(Duration::from_millis(ms))
            }
        }
    }
}

/// Delivery settings shared by the controller and the chunked sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeliveryConfig {
    /// Nacks a message may take before it is failed (default 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Payload bytes per chunk frame (default 100).
    #[serde(default = "default_frame_limit")]
    pub frame_limit: usize,
    /// Largest encoded data payload the link accepts (default 124).
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_frame_limit() -> usize {
    DEFAULT_FRAME_LIMIT
}
fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            frame_limit: default_frame_limit(),
            max_payload: default_max_payload(),
            retry: RetryPolicy::default(),
        }
    }
}

impl DeliveryConfig {
    /// Reject settings that would produce frames the link cannot carry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_limit == 0 {
            return Err(ConfigError::FrameLimitZero);
        }
        let encoded = self.frame_limit.checked_add(CHUNK_FRAME_OVERHEAD);
        if encoded.map_or(true, |n| n > self.max_payload) {
            return Err(ConfigError::FrameTooLarge {
                frame_limit: self.frame_limit,
                max_payload: self.max_payload,
            });
        }
        if let RetryPolicy::Backoff {
            base_ms, max_ms, ..
        } = self.retry
        {
            if base_ms > max_ms {
                return Err(ConfigError::InvalidBackoff { base_ms, max_ms });
            }
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("frame limit must be non-zero")]
    FrameLimitZero,
    #[error("frame limit {frame_limit} plus header exceeds max payload {max_payload}")]
    FrameTooLarge {
        frame_limit: usize,
        max_payload: usize,
    },
    #[error("backoff base {base_ms}ms exceeds cap {max_ms}ms")]
    InvalidBackoff { base_ms: u64, max_ms: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = DeliveryConfig::default();
        assert_eq!(c.max_retries, 3);
        assert_eq!(c.frame_limit, 100);
        assert_eq!(c.max_payload, 124);
        assert_eq!(c.retry, RetryPolicy::Immediate);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn rejects_oversized_frames() {
        let c = DeliveryConfig {
            frame_limit: 120,
            ..DeliveryConfig::default()
        };
        assert_eq!(
            c.validate(),
            Err(ConfigError::FrameTooLarge {
                frame_limit: 120,
                max_payload: 124
            })
        );
    }

    #[test]
    fn rejects_zero_frame_limit() {
        let c = DeliveryConfig {
            frame_limit: 0,
            ..DeliveryConfig::default()
        };
        assert_eq!(c.validate(), Err(ConfigError::FrameLimitZero));
    }

    #[test]
    fn rejects_frame_limit_that_overflows_header() {
        let c = DeliveryConfig {
            frame_limit: usize::MAX,
            ..DeliveryConfig::default()
        };
        assert_eq!(
            c.validate(),
            Err(ConfigError::FrameTooLarge {
                frame_limit: usize::MAX,
                max_payload: DEFAULT_MAX_PAYLOAD
            })
        );
    }

    #[test]
    fn rejects_inverted_backoff() {
        let c = DeliveryConfig {
            retry: RetryPolicy::Backoff {
                base_ms: 500,
                max_ms: 100,
                jitter: false,
            },
            ..DeliveryConfig::default()
        };
        assert!(matches!(c.validate(), Err(ConfigError::InvalidBackoff { .. })));
    }

    #[test]
    fn immediate_has_no_delay() {
        assert_eq!(RetryPolicy::Immediate.delay(1), None);
        assert_eq!(RetryPolicy::Immediate.delay(5), None);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::Backoff {
            base_ms: 100,
            max_ms: 350,
            jitter: false,
        };
        assert_eq!(p.delay(1), Some(Duration::from_millis(100)));
        assert_eq!(p.delay(2), Some(Duration::from_millis(200)));
        assert_eq!(p.delay(3), Some(Duration::from_millis(350)));
        assert_eq!(p.delay(40), Some(Duration::from_millis(350)));
    }

    #[test]
    fn jitter_stays_within_delay() {
        let p = RetryPolicy::Backoff {
            base_ms: 50,
            max_ms: 1000,
            jitter: true,
        };
        for _ in 0..100 {
            let d = p.delay(2).unwrap();
            assert!(d <= Duration::from_millis(100));
        }
    }
}
