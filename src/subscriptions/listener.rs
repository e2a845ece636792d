//! The per-subscription listener loop.
//!
//! A listener tails the change feed from its cursor, hands each commit's
//! matching events to the handler and persists the commit position once the
//! handler acknowledges it. It runs on its own thread until the manager
//! drops its stop sender, or until the handler fails past the retry policy.

use super::feed::ChangeFeed;
use super::tokens::{PositionTracker, ResumeToken};
use super::types::{BatchHandler, CallbackError, StatusCell, SubscriptionConfig, SubscriptionStatus};
use crate::journal::Commit;
use crate::types::{EventEnvelope, Position};
use crossbeam_channel::{never, select, Receiver, RecvTimeoutError, TryRecvError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub(crate) struct Listener {
    id: String,
    feed: Arc<dyn ChangeFeed>,
    tracker: Arc<dyn PositionTracker>,
    config: SubscriptionConfig,
    status: Arc<StatusCell>,

    /// Disconnects when the manager stops this subscription.
    stop: Receiver<()>,

    /// Commit wake-ups from the feed.
    wake: Receiver<()>,

    handler: BatchHandler,

    /// Position of the last acknowledged commit.
    cursor: Position,

    /// The cursor moved past filtered-out commits without saving a token.
    unsaved: bool,
}

impl Listener {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        feed: Arc<dyn ChangeFeed>,
        tracker: Arc<dyn PositionTracker>,
        config: SubscriptionConfig,
        status: Arc<StatusCell>,
        stop: Receiver<()>,
        handler: BatchHandler,
        start: Position,
    ) -> Self {
        let wake = feed.watch();
        Self {
            id,
            feed,
            tracker,
            config,
            status,
            stop,
            wake,
            handler,
            cursor: start,
            unsaved: false,
        }
    }

    pub(crate) fn run(mut self) {
        debug!(subscription_id = %self.id, position = %self.cursor, "Listener started");

        while self.is_active() {
            match self.feed.commits_after(self.cursor, self.config.batch_read_limit) {
                Ok(commits) if commits.is_empty() => {
                    if !self.wait_for_commits() {
                        break;
                    }
                }
                Ok(commits) => {
                    for commit in commits {
                        if !self.dispatch(commit) {
                            break;
                        }
                    }
                    self.save_token();
                }
                Err(e) => {
                    warn!(
                        subscription_id = %self.id,
                        error = %e,
                        "Change feed unavailable, reconnecting"
                    );
                    if !self.idle(self.config.poll_interval) {
                        break;
                    }
                    self.reconnect();
                }
            }
        }

        self.save_token();
        debug!(subscription_id = %self.id, status = ?self.status.get(), "Listener stopped");
    }

    fn is_active(&self) -> bool {
        self.status.get() == SubscriptionStatus::Active
            && !matches!(self.stop.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Block until a commit wake-up, the poll interval or a stop.
    /// Returns false when stopped.
    fn wait_for_commits(&mut self) -> bool {
        select! {
            recv(self.stop) -> _ => false,
            recv(self.wake) -> msg => {
                if msg.is_err() {
                    // Feed dropped its sender; fall back to polling.
                    self.wake = never();
                }
                true
            }
            default(self.config.poll_interval) => true,
        }
    }

    /// Sleep for `delay` unless stopped first. Returns false when stopped.
    fn idle(&self, delay: Duration) -> bool {
        matches!(self.stop.recv_timeout(delay), Err(RecvTimeoutError::Timeout))
    }

    /// Restart from the last persisted token. Without one the in-memory
    /// cursor is kept.
    fn reconnect(&mut self) {
        match self.tracker.load(&self.id) {
            Ok(Some(token)) => {
                info!(subscription_id = %self.id, token = %token, "Reconnecting from resume token");
                self.cursor = token.position();
            }
            Ok(None) => {}
            Err(e) => {
                warn!(subscription_id = %self.id, error = %e, "Failed to load resume token");
            }
        }
        self.wake = self.feed.watch();
    }

    /// Deliver one commit. Returns false when the listener must stop.
    fn dispatch(&mut self, commit: Commit) -> bool {
        if !self.is_active() {
            return false;
        }

        let position = commit.position;
        let batch: Vec<EventEnvelope> = commit
            .events
            .into_iter()
            .filter(|event| self.config.filter.matches(event))
            .collect();

        if batch.is_empty() {
            // Nothing to deliver; the token catches up at the end of the read.
            self.cursor = position;
            self.unsaved = true;
            return true;
        }

        if !self.deliver(position, &batch) {
            return false;
        }

        self.cursor = position;
        self.unsaved = true;
        self.save_token();
        true
    }

    /// Persist the cursor if it moved since the last save.
    fn save_token(&mut self) {
        // Cancelled (possibly from inside the handler): the token is gone for good.
        if !self.unsaved || self.status.get() == SubscriptionStatus::Cancelled {
            return;
        }

        match self.tracker.save(&self.id, ResumeToken::new(self.cursor)) {
            Ok(()) => self.unsaved = false,
            Err(e) => warn!(
                subscription_id = %self.id,
                position = %self.cursor,
                error = %e,
                "Failed to persist resume token"
            ),
        }
    }

    /// Call the handler until it acknowledges the batch or the retry policy
    /// gives up.
    fn deliver(&mut self, position: Position, batch: &[EventEnvelope]) -> bool {
        let mut failures = 0u32;
        loop {
            if !self.is_active() {
                return false;
            }

            let err = match self.call_handler(batch) {
                Ok(()) => {
                    debug!(
                        subscription_id = %self.id,
                        position = %position,
                        events = batch.len(),
                        "Batch acknowledged"
                    );
                    return true;
                }
                Err(e) => e,
            };

            failures = failures.saturating_add(1);
            match self.config.retry.delay_for(failures) {
                Some(delay) => {
                    warn!(
                        subscription_id = %self.id,
                        position = %position,
                        attempt = failures,
                        error = %err,
                        "Batch handler failed, redelivering in {:?}",
                        delay
                    );
                    if !self.idle(delay) {
                        return false;
                    }
                }
                None => {
                    if self.status.leave_active(SubscriptionStatus::Failed) {
                        error!(
                            subscription_id = %self.id,
                            position = %position,
                            attempts = failures,
                            error = %err,
                            "Batch handler failed, subscription stopped"
                        );
                    }
                    return false;
                }
            }
        }
    }

    fn call_handler(&mut self, batch: &[EventEnvelope]) -> Result<(), CallbackError> {
        let handler = &mut self.handler;
        match panic::catch_unwind(AssertUnwindSafe(|| handler(batch))) {
            Ok(result) => result,
            Err(_) => Err("batch handler panicked".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, StoreError};
    use crate::subscriptions::tokens::ResumeTokenStore;
    use crate::subscriptions::types::{CallbackResult, RetryPolicy};
    use crate::types::{StreamVersion, Timestamp};
    use crossbeam_channel::{bounded, Sender};
    use parking_lot::Mutex;

    /// In-memory feed with a fixed list of commits.
    struct StaticFeed {
        commits: Vec<Commit>,
    }

    impl ChangeFeed for StaticFeed {
        fn head(&self) -> Result<Position> {
            Ok(self.commits.last().map(|c| c.position).unwrap_or_default())
        }

        fn commits_after(&self, after: Position, limit: usize) -> Result<Vec<Commit>> {
            Ok(self
                .commits
                .iter()
                .filter(|c| c.position > after)
                .take(limit)
                .cloned()
                .collect())
        }

        fn watch(&self) -> Receiver<()> {
            never()
        }
    }

    fn commit(position: u64, event_type: &str) -> Commit {
        let mut event = EventEnvelope::new(format!("e{}", position), "urn:test", event_type);
        event.stream_id = "s".to_string();
        event.stream_version = StreamVersion(position);
        Commit {
            position: Position(position),
            stream_id: "s".to_string(),
            version: StreamVersion(position),
            committed_at: Timestamp::now(),
            events: vec![event],
        }
    }

    fn listener(
        feed: Arc<dyn ChangeFeed>,
        tracker: Arc<dyn PositionTracker>,
        config: SubscriptionConfig,
        handler: BatchHandler,
    ) -> (Listener, Arc<StatusCell>, Sender<()>) {
        let status = Arc::new(StatusCell::new(SubscriptionStatus::Active));
        let (stop_tx, stop_rx) = bounded(0);
        let listener = Listener::new(
            "sub".to_string(),
            feed,
            tracker,
            config,
            status.clone(),
            stop_rx,
            handler,
            Position(0),
        );
        (listener, status, stop_tx)
    }

    #[test]
    fn test_failure_without_retry_marks_failed() {
        let dir = tempfile::TempDir::new().unwrap();
        let tracker = Arc::new(ResumeTokenStore::new(dir.path().join("tokens.bin")));
        let feed = Arc::new(StaticFeed {
            commits: vec![commit(1, "Ok"), commit(2, "Boom"), commit(3, "Ok")],
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let handler: BatchHandler = Box::new(move |batch: &[EventEnvelope]| -> CallbackResult {
            seen_clone.lock().push(batch[0].id.clone());
            if batch[0].event_type == "Boom" {
                return Err(Box::new(StoreError::BackendUnavailable("boom".into())) as CallbackError);
            }
            Ok(())
        });

        let config = SubscriptionConfig {
            retry: RetryPolicy::Never,
            ..Default::default()
        };
        let (listener, status, _stop) = listener(feed, tracker.clone(), config, handler);
        listener.run();

        assert_eq!(status.get(), SubscriptionStatus::Failed);
        assert_eq!(*seen.lock(), vec!["e1".to_string(), "e2".to_string()]);
        // Token stays on the last acknowledged commit.
        assert_eq!(
            tracker.load("sub").unwrap(),
            Some(ResumeToken::new(Position(1)))
        );
    }

    #[test]
    fn test_filtered_commits_advance_token() {
        let dir = tempfile::TempDir::new().unwrap();
        let tracker = Arc::new(ResumeTokenStore::new(dir.path().join("tokens.bin")));
        let feed = Arc::new(StaticFeed {
            commits: vec![commit(1, "Skipped"), commit(2, "Skipped")],
        });

        let calls = Arc::new(Mutex::new(0usize));
        let calls_clone = calls.clone();
        let handler: BatchHandler = Box::new(move |_batch: &[EventEnvelope]| -> CallbackResult {
            *calls_clone.lock() += 1;
            Ok(())
        });

        let config = SubscriptionConfig {
            filter: crate::filter::Filter::event_types(["Wanted"]),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let (listener, status, stop) = listener(feed, tracker.clone(), config, handler);

        let thread = std::thread::spawn(move || listener.run());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while tracker.load("sub").unwrap() != Some(ResumeToken::new(Position(2))) {
            assert!(std::time::Instant::now() < deadline, "token never advanced");
            std::thread::sleep(Duration::from_millis(5));
        }

        status.set(SubscriptionStatus::Paused);
        drop(stop);
        thread.join().unwrap();
        assert_eq!(*calls.lock(), 0);
    }

    #[test]
    fn test_panicking_handler_is_a_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let tracker = Arc::new(ResumeTokenStore::new(dir.path().join("tokens.bin")));
        let feed = Arc::new(StaticFeed {
            commits: vec![commit(1, "Ok")],
        });
        let handler: BatchHandler = Box::new(|_batch: &[EventEnvelope]| -> CallbackResult {
            panic!("handler bug")
        });

        let config = SubscriptionConfig {
            retry: RetryPolicy::Never,
            ..Default::default()
        };
        let (listener, status, _stop) = listener(feed, tracker.clone(), config, handler);
        listener.run();

        assert_eq!(status.get(), SubscriptionStatus::Failed);
        assert_eq!(tracker.load("sub").unwrap(), None);
    }
}
