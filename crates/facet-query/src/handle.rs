use std::fmt;
use std::sync::Weak;

use facet_store::Subscription;

/// A query that counts its subscribers.
pub(crate) trait SubscriberCount: Send + Sync {
    /// Called once per dropped handle. `listener_id` is the id the query
    /// handed out for its own listener list, if it keeps one.
    fn release_subscriber(&self, listener_id: Option<u64>);
}

/// Handle returned by `observe` calls. Dropping it stops delivery and, when
/// it was the query's last subscriber, may abort the query's fetch.
pub struct QuerySubscription {
    store: Option<Subscription>,
    owner: Weak<dyn SubscriberCount>,
    listener_id: Option<u64>,
}

impl QuerySubscription {
    pub(crate) fn new(
        store: Option<Subscription>,
        owner: Weak<dyn SubscriberCount>,
        listener_id: Option<u64>,
    ) -> Self {
        Self {
            store,
            owner,
            listener_id,
        }
    }

    /// Stop receiving emissions.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        self.store.take();
        if let Some(owner) = self.owner.upgrade() {
            owner.release_subscriber(self.listener_id);
        }
    }
}

impl fmt::Debug for QuerySubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySubscription")
            .field("store", &self.store)
            .field("listener_id", &self.listener_id)
            .finish()
    }
}
