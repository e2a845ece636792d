//! Subscription types.

use crate::filter::Filter;
use crate::types::EventEnvelope;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Error a batch callback may return.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a batch callback. `Err` leaves the batch unacknowledged.
pub type CallbackResult = std::result::Result<(), CallbackError>;

/// Consumer of a batch of events (one commit).
pub type BatchHandler = Box<dyn FnMut(&[EventEnvelope]) -> CallbackResult + Send>;

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Which events are delivered. Commits with no matching events are
    /// acknowledged without calling the handler.
    pub filter: Filter,

    /// What happens when the handler fails.
    pub retry: RetryPolicy,

    /// How long the listener sleeps when the feed has nothing new, and the
    /// delay before reconnecting after a feed error.
    /// Default: 250ms
    pub poll_interval: Duration,

    /// Max commits read from the feed at once.
    /// Default: 256
    pub batch_read_limit: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            filter: Filter::All,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_millis(250),
            batch_read_limit: 256,
        }
    }
}

/// Redelivery policy for batches whose handler returned an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Stop at the first failure. The subscription becomes
    /// [`SubscriptionStatus::Failed`]; subscribing again redelivers the batch.
    Never,

    /// Redeliver the same batch after an exponentially growing delay.
    Backoff {
        initial: Duration,
        max: Duration,
        /// Give up (and fail) after this many redeliveries. `None` = forever.
        max_retries: Option<u32>,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            max_retries: None,
        }
    }
}

impl RetryPolicy {
    /// Constant delay between redeliveries.
    pub fn fixed(delay: Duration, max_retries: Option<u32>) -> Self {
        RetryPolicy::Backoff {
            initial: delay,
            max: delay,
            max_retries,
        }
    }

    /// Delay before the next delivery after `failures` consecutive failures,
    /// or `None` to give up.
    pub fn delay_for(&self, failures: u32) -> Option<Duration> {
        match *self {
            RetryPolicy::Never => None,
            RetryPolicy::Backoff {
                initial,
                max,
                max_retries,
            } => {
                if max_retries.map_or(false, |limit| failures > limit) {
                    return None;
                }
                let factor = 2u32.saturating_pow(failures.saturating_sub(1));
                Some(initial.saturating_mul(factor).min(max))
            }
        }
    }
}

/// Lifecycle of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriptionStatus {
    Active = 0,
    Paused = 1,
    Cancelled = 2,
    /// The handler kept failing; the last batch is unacknowledged.
    Failed = 3,
}

impl SubscriptionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SubscriptionStatus::Active,
            1 => SubscriptionStatus::Paused,
            2 => SubscriptionStatus::Cancelled,
            _ => SubscriptionStatus::Failed,
        }
    }
}

/// Status shared between the manager, the listener thread and handles.
#[derive(Debug)]
pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
    pub(crate) fn new(status: SubscriptionStatus) -> Self {
        StatusCell(AtomicU8::new(status as u8))
    }

    pub(crate) fn get(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn set(&self, status: SubscriptionStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }

    /// Move from Active to `status`; no-op if someone already stopped it.
    pub(crate) fn leave_active(&self, status: SubscriptionStatus) -> bool {
        self.0
            .compare_exchange(
                SubscriptionStatus::Active as u8,
                status as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

/// Handle to an active subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    id: String,
    status: Arc<StatusCell>,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: String, status: Arc<StatusCell>) -> Self {
        Self { id, status }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status.get()
    }

    pub fn is_active(&self) -> bool {
        self.status() == SubscriptionStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_gives_up_immediately() {
        assert_eq!(RetryPolicy::Never.delay_for(1), None);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(350),
            max_retries: None,
        };
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(350)));
        assert_eq!(policy.delay_for(40), Some(Duration::from_millis(350)));
    }

    #[test]
    fn test_max_retries() {
        let policy = RetryPolicy::fixed(Duration::from_millis(10), Some(2));
        assert!(policy.delay_for(1).is_some());
        assert!(policy.delay_for(2).is_some());
        assert_eq!(policy.delay_for(3), None);
    }

    #[test]
    fn test_status_cell() {
        let cell = StatusCell::new(SubscriptionStatus::Active);
        assert!(cell.leave_active(SubscriptionStatus::Failed));
        assert_eq!(cell.get(), SubscriptionStatus::Failed);
        // Already stopped: stays failed.
        assert!(!cell.leave_active(SubscriptionStatus::Paused));
        cell.set(SubscriptionStatus::Cancelled);
        assert_eq!(cell.get(), SubscriptionStatus::Cancelled);
    }
}
