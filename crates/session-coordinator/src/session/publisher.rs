//! Session state publisher.
//!
//! Single writer of the current identity. Readers take snapshots with
//! [`SessionPublisher::current_session`], follow changes asynchronously with
//! [`SessionPublisher::watch`], or register a synchronous listener with
//! [`SessionPublisher::subscribe`].
//!
//! A change is committed to the watch channel immediately and its event is
//! queued; listeners see queued events in commit order on the next
//! [`flush`](SessionPublisher::flush), which the coordinator runs after
//! releasing its own locks.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::watch;
use tracing::{debug, info};

use super::types::{ClearReason, Session, SessionEvent, UserIdentity};

type Listener = Arc<dyn Fn(&SessionEvent, &Session) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

/// Owner of the current [`Session`].
///
/// Writes are crate-private: only the coordinator commits session changes.
pub struct SessionPublisher {
    state: watch::Sender<Session>,
    listeners: Arc<Mutex<Listeners>>,
    pending: Mutex<VecDeque<(SessionEvent, Session)>>,
    /// Serializes delivery; reentrant so a listener may trigger a flush.
    delivery: ReentrantMutex<()>,
}

impl SessionPublisher {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Session::default());
        Self {
            state,
            listeners: Arc::new(Mutex::new(Listeners::default())),
            pending: Mutex::new(VecDeque::new()),
            delivery: ReentrantMutex::new(()),
        }
    }

    /// Snapshot of the current session.
    pub fn current_session(&self) -> Session {
        self.state.borrow().clone()
    }

    /// Receiver that observes every committed session.
    pub fn watch(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    /// Register a listener called synchronously on every session change.
    ///
    /// Listeners run after the change is committed, outside the
    /// coordinator's locks, so they may read coordinator state. The listener
    /// stays registered until the returned [`Subscription`] is dropped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SessionEvent, &Session) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock();
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.entries.push((id, Arc::new(listener)));

        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Get the number of registered listeners.
    pub fn subscriber_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }

    pub(crate) fn begin_authenticating(&self) {
        let current = self.current_session();
        if current.authenticating {
            return;
        }

        let next = Session {
            authenticating: true,
            ..current
        };
        self.publish(next, SessionEvent::Authenticating);
    }

    pub(crate) fn set_session(&self, identity: Arc<UserIdentity>, valid_until: DateTime<Utc>) {
        let was_authenticated = self.state.borrow().is_authenticated();

        let next = Session {
            principal: Some(Arc::clone(&identity)),
            valid_until: Some(valid_until),
            authenticating: false,
        };

        let event = if was_authenticated {
            debug!(user = %identity.display_name(), %valid_until, "Session renewed");
            SessionEvent::Renewed(identity)
        } else {
            info!(user = %identity.display_name(), %valid_until, "Session established");
            SessionEvent::Established(identity)
        };
        self.publish(next, event);
    }

    /// Clear the session. No notification is sent if nothing changes.
    pub(crate) fn clear_session(&self, reason: ClearReason) {
        let current = self.current_session();
        if !current.is_authenticated() && !current.authenticating {
            return;
        }

        info!(reason = %reason.describe(), "Session cleared");
        self.publish(Session::default(), SessionEvent::Cleared { reason });
    }

    /// Deliver queued events to listeners, oldest first.
    pub(crate) fn flush(&self) {
        let _delivery = self.delivery.lock();
        loop {
            let Some((event, session)) = self.pending.lock().pop_front() else {
                break;
            };

            // Snapshot so listeners can subscribe/unsubscribe without deadlocking.
            let listeners: Vec<Listener> = self
                .listeners
                .lock()
                .entries
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect();

            for listener in listeners {
                listener(&event, &session);
            }
        }
    }

    fn publish(&self, next: Session, event: SessionEvent) {
        // Queued under the same call as the commit so delivery follows commit order.
        let mut pending = self.pending.lock();
        self.state.send_replace(next.clone());
        pending.push_back((event, next));
    }
}

impl Default for SessionPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for a registered session listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription immediately unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    /// Unsubscribe explicitly.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().entries.retain(|(id, _)| *id != self.id);
        }
    }
}
