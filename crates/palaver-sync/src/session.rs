//! Who is logged in.
//!
//! The auth layer drives a [`SessionContext`] with [`SessionContext::log_in`]
//! and [`SessionContext::log_out`]. Components that need the current user
//! hold a clone of it; components that must react to logout register a
//! [`SessionObserver`].
use std::sync::{Arc, RwLock, Weak};

use tracing::info;

use palaver_types::models::{UserId, UserProfile};

use crate::error::SyncError;

pub trait SessionObserver: Send + Sync {
    fn on_logged_in(&self, user: &UserProfile);
    fn on_logged_out(&self);
}

#[derive(Clone, Default)]
pub struct SessionContext {
    inner: Arc<SessionInner>,
}

#[derive(Default)]
struct SessionInner {
    user: RwLock<Option<UserProfile>>,
    observers: RwLock<Vec<Weak<dyn SessionObserver>>>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that starts logged in, mostly for tests and tools.
    pub fn logged_in(user: UserProfile) -> Self {
        let session = Self::new();
        *session.inner.user.write().unwrap_or_else(|e| e.into_inner()) = Some(user);
        session
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.inner.user.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.current_user().map(|user| user.id)
    }

    pub fn require_user(&self) -> Result<UserProfile, SyncError> {
        self.current_user().ok_or(SyncError::NotAuthenticated)
    }

    /// Observers are held weakly; dropped observers are pruned on the next
    /// notification.
    pub fn add_observer(&self, observer: Weak<dyn SessionObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    pub fn log_in(&self, user: UserProfile) {
        info!("Session started for {}", user.id);
        *self.inner.user.write().unwrap_or_else(|e| e.into_inner()) = Some(user.clone());
        for observer in self.live_observers() {
            observer.on_logged_in(&user);
        }
    }

    pub fn log_out(&self) {
        let previous = self.inner.user.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(user) = previous {
            info!("Session ended for {}", user.id);
        }
        for observer in self.live_observers() {
            observer.on_logged_out();
        }
    }

    // Upgraded outside the lock so observers may call back into the session.
    fn live_observers(&self) -> Vec<Arc<dyn SessionObserver>> {
        let mut observers = self.inner.observers.write().unwrap_or_else(|e| e.into_inner());
        observers.retain(|o| o.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counter {
        logins: AtomicUsize,
        logouts: AtomicUsize,
    }

    impl SessionObserver for Counter {
        fn on_logged_in(&self, _user: &UserProfile) {
            self.logins.fetch_add(1, Ordering::SeqCst);
        }

        fn on_logged_out(&self) {
            self.logouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn alice() -> UserProfile {
        UserProfile {
            id: UserId::new("alice"),
            username: "Alice".into(),
        }
    }

    #[test]
    fn login_logout_notifies_observers() {
        let session = SessionContext::new();
        let counter = Arc::new(Counter::default());
        let weak: Weak<dyn SessionObserver> = Arc::downgrade(&counter) as Weak<dyn SessionObserver>;
        session.add_observer(weak);

        assert_eq!(session.require_user(), Err(SyncError::NotAuthenticated));
        session.log_in(alice());
        assert_eq!(session.user_id(), Some(UserId::new("alice")));
        session.log_out();
        assert!(session.current_user().is_none());

        assert_eq!(counter.logins.load(Ordering::SeqCst), 1);
        assert_eq!(counter.logouts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_observers_are_pruned() {
        let session = SessionContext::new();
        {
            let counter = Arc::new(Counter::default());
            session.add_observer(Arc::downgrade(&counter) as Weak<dyn SessionObserver>);
        }
        session.log_out();
        assert!(session.inner.observers.read().unwrap().is_empty());
    }

    #[test]
    fn clones_share_state() {
        let session = SessionContext::logged_in(alice());
        let clone = session.clone();
        session.log_out();
        assert!(clone.current_user().is_none());
    }
}
