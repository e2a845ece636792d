//! Subscription manager: registry of live listeners over the change feed.

use crate::error::{Result, StoreError};
use crate::store::EventStore;
use crate::types::{EventEnvelope, Position};
use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

use super::feed::ChangeFeed;
use super::listener::Listener;
use super::tokens::{PositionTracker, ResumeToken};
use super::types::{
    CallbackResult, StatusCell, SubscriptionConfig, SubscriptionHandle, SubscriptionStatus,
};

/// Registry entry of a running (or failed) listener.
struct ActiveSubscription {
    status: Arc<StatusCell>,
    /// Dropped to stop the listener; nothing is ever sent.
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ActiveSubscription {
    fn on_own_thread(&self) -> bool {
        self.thread
            .as_ref()
            .map_or(false, |t| t.thread().id() == thread::current().id())
    }

    /// Stop the listener and wait for it to exit. A listener whose thread
    /// was already handed over to [`Registry::detached`] is not waited for.
    fn stop(mut self, id: &str, status: SubscriptionStatus) {
        if status == SubscriptionStatus::Cancelled || self.status.get() == SubscriptionStatus::Active {
            self.status.set(status);
        }
        drop(self.stop.take());

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(subscription_id = %id, "Listener thread panicked");
            }
        }
    }
}

#[derive(Default)]
struct Registry {
    active: HashMap<String, ActiveSubscription>,

    /// Listeners stopped from inside their own handler. They finish the
    /// current call (and persist its token) after being unregistered, so
    /// their id stays taken until the thread exits.
    detached: HashMap<String, JoinHandle<()>>,

    /// Listeners started per id, so a subscribe can tell whether its start
    /// position went stale while the registry was unlocked.
    generations: HashMap<String, u64>,
}

impl Registry {
    /// Unregister a listener.
    fn remove(&mut self, id: &str) -> Option<ActiveSubscription> {
        let mut subscription = self.active.remove(id)?;
        if subscription.on_own_thread() {
            if let Some(thread) = subscription.thread.take() {
                self.detached.insert(id.to_string(), thread);
            }
        }
        Some(subscription)
    }

    /// Whether a detached listener for `id` is still running. Exited ones
    /// are reaped.
    fn detached_running(&mut self, id: &str) -> bool {
        match self.detached.get(id) {
            Some(thread) if !thread.is_finished() => true,
            Some(_) => {
                if let Some(thread) = self.detached.remove(id) {
                    if thread.join().is_err() {
                        warn!(subscription_id = %id, "Listener thread panicked");
                    }
                }
                false
            }
            None => false,
        }
    }

    fn generation(&self, id: &str) -> u64 {
        self.generations.get(id).copied().unwrap_or(0)
    }

    fn is_taken(&mut self, id: &str) -> bool {
        self.active.contains_key(id) || self.detached_running(id)
    }

    /// Make `id` available for a new listener. A failed registration is
    /// unregistered and returned for stopping.
    fn claim(&mut self, id: &str) -> Result<Option<ActiveSubscription>> {
        if self.detached_running(id) {
            return Err(StoreError::SubscriptionActive(id.to_string()));
        }
        match self.active.get(id).map(|s| s.status.get()) {
            Some(SubscriptionStatus::Active) => Err(StoreError::SubscriptionActive(id.to_string())),
            Some(_) => Ok(self.remove(id)),
            None => Ok(None),
        }
    }
}

/// Manages change-feed subscriptions and their resume tokens.
///
/// Each active subscription owns one listener thread. Handlers run on that
/// thread, one commit at a time and in commit order. Delivery is
/// at-least-once: a batch whose handler failed (or whose token could not be
/// persisted) is delivered again on resume.
pub struct SubscriptionManager {
    feed: Arc<dyn ChangeFeed>,
    tracker: Arc<dyn PositionTracker>,
    registry: RwLock<Registry>,
}

impl SubscriptionManager {
    /// Create a manager over a store's change feed and resume tokens.
    pub fn new(store: Arc<EventStore>) -> Self {
        let tracker = store.resume_tokens();
        Self::with_backend(store, tracker)
    }

    /// Create a manager over any feed and position tracker.
    pub fn with_backend(feed: Arc<dyn ChangeFeed>, tracker: Arc<dyn PositionTracker>) -> Self {
        Self {
            feed,
            tracker,
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Subscribe with the default configuration (all events, retry with
    /// backoff).
    pub fn subscribe<F>(&self, subscription_id: impl Into<String>, on_batch: F) -> Result<SubscriptionHandle>
    where
        F: FnMut(&[EventEnvelope]) -> CallbackResult + Send + 'static,
    {
        self.subscribe_with(subscription_id, SubscriptionConfig::default(), on_batch)
    }

    /// Start (or resume) a subscription.
    ///
    /// With a persisted resume token, delivery continues strictly after it.
    /// Without one, the subscription starts at the current head: nothing
    /// committed before this call is delivered.
    ///
    /// Fails with [`StoreError::SubscriptionActive`] if the id is already
    /// active, or if its previous listener paused or cancelled itself and is
    /// still inside its handler. A failed subscription with the same id is
    /// replaced.
    pub fn subscribe_with<F>(
        &self,
        subscription_id: impl Into<String>,
        config: SubscriptionConfig,
        on_batch: F,
    ) -> Result<SubscriptionHandle>
    where
        F: FnMut(&[EventEnvelope]) -> CallbackResult + Send + 'static,
    {
        let id = subscription_id.into();
        if id.is_empty() {
            return Err(StoreError::Validation("subscription id must not be empty".into()));
        }

        let (stale, mut generation) = {
            let mut registry = self.registry.write();
            (registry.claim(&id)?, registry.generation(&id))
        };
        if let Some(stale) = stale {
            stale.stop(&id, SubscriptionStatus::Failed);
        }

        let (start, mut registry) = loop {
            let start = self.start_position(&id)?;

            let mut registry = self.registry.write();
            if registry.is_taken(&id) {
                return Err(StoreError::SubscriptionActive(id));
            }
            // Another listener ran in between and may have moved the token.
            if registry.generation(&id) == generation {
                break (start, registry);
            }
            generation = registry.generation(&id);
        };

        let status = Arc::new(StatusCell::new(SubscriptionStatus::Active));
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let listener = Listener::new(
            id.clone(),
            self.feed.clone(),
            self.tracker.clone(),
            config,
            status.clone(),
            stop_rx,
            Box::new(on_batch),
            start,
        );

        let thread = thread::Builder::new()
            .name(format!("eventide-sub-{}", id))
            .spawn(move || listener.run())?;

        *registry.generations.entry(id.clone()).or_insert(0) += 1;
        registry.active.insert(
            id.clone(),
            ActiveSubscription {
                status: status.clone(),
                stop: Some(stop_tx),
                thread: Some(thread),
            },
        );

        Ok(SubscriptionHandle::new(id, status))
    }

    /// Where a (re)started subscription picks up.
    fn start_position(&self, id: &str) -> Result<Position> {
        if let Some(token) = self.tracker.load(id)? {
            info!(subscription_id = %id, token = %token, "Found resume token, resuming");
            return Ok(token.position());
        }

        let head = self.feed.head()?;
        info!(subscription_id = %id, position = %head, "No resume token, subscription starts fresh");

        // Pin "now" so that a pause before the first batch resumes from here.
        self.tracker.save(id, ResumeToken::new(head))?;
        Ok(head)
    }

    /// Stop delivery, keeping the resume token. Returns false if the
    /// subscription was not running.
    ///
    /// No handler call starts after this returns. Called from the
    /// subscription's own handler, that call finishes normally and its batch
    /// is acknowledged.
    pub fn pause_subscription(&self, subscription_id: &str) -> bool {
        let removed = self.registry.write().remove(subscription_id);
        match removed {
            Some(subscription) => {
                subscription.stop(subscription_id, SubscriptionStatus::Paused);
                info!(subscription_id = %subscription_id, "Subscription paused");
                true
            }
            None => false,
        }
    }

    /// Stop delivery and forget the resume token. Subscribing again with the
    /// same id starts fresh.
    pub fn cancel_subscription(&self, subscription_id: &str) -> Result<()> {
        let removed = self.registry.write().remove(subscription_id);
        if let Some(subscription) = removed {
            subscription.stop(subscription_id, SubscriptionStatus::Cancelled);
        }

        self.tracker.remove(subscription_id)?;
        info!(subscription_id = %subscription_id, "Subscription cancelled");
        Ok(())
    }

    /// Stop every listener. Resume tokens are kept.
    pub fn close_subscribers(&self) {
        let drained: Vec<(String, ActiveSubscription)> = {
            let mut registry = self.registry.write();
            let ids: Vec<String> = registry.active.keys().cloned().collect();
            ids.into_iter()
                .filter_map(|id| registry.remove(&id).map(|s| (id, s)))
                .collect()
        };
        if drained.is_empty() {
            return;
        }

        let count = drained.len();
        for (id, subscription) in drained {
            subscription.stop(&id, SubscriptionStatus::Paused);
        }
        info!(count, "Closed subscribers");
    }

    /// Status of a registered subscription; `None` if not registered
    /// (never subscribed, paused, cancelled or closed).
    pub fn status(&self, subscription_id: &str) -> Option<SubscriptionStatus> {
        self.registry
            .read()
            .active
            .get(subscription_id)
            .map(|s| s.status.get())
    }

    /// Number of registered subscriptions (active or failed).
    pub fn subscription_count(&self) -> usize {
        self.registry.read().active.len()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.close_subscribers();
    }
}
