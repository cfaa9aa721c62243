//! Request events and listener registration.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::ChannelError;
use crate::buffer::PooledBuffer;

/// Event delivered to the listeners of a request.
#[derive(Debug, Clone)]
pub enum RequestEvent {
    /// A chunk of data starting at the caller-visible `offset`.
    ///
    /// The listener owns its handle on `buffer` and must drop or release it
    /// once done.
    Success {
        buffer: PooledBuffer,
        offset: u64,
        length: usize,
    },
    /// No data is available at `offset` yet; the request keeps waiting.
    Blocked { offset: u64 },
    /// Terminal failure of the request.
    Failed { error: Arc<ChannelError> },
}

impl RequestEvent {
    /// Whether this event ends the request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestEvent::Failed { .. })
    }
}

/// Receiver of request events.
///
/// Called synchronously on whichever thread runs the request; must not
/// block indefinitely.
pub trait RequestListener: Send + Sync {
    fn on_event(&self, event: RequestEvent);
}

impl<F> RequestListener for F
where
    F: Fn(RequestEvent) + Send + Sync,
{
    fn on_event(&self, event: RequestEvent) {
        self(event)
    }
}

/// Handle returned by listener registration, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerList = Arc<Vec<(ListenerId, Arc<dyn RequestListener>)>>;

/// Copy-on-write listener list.
///
/// Dispatch iterates a snapshot, so listeners may be added or removed while
/// an event is being delivered. A removed listener sees no later events.
#[derive(Default)]
pub(crate) struct ListenerSet {
    listeners: Mutex<ListenerList>,
    next_id: AtomicU64,
}

impl ListenerSet {
    pub(crate) fn add(&self, listener: Arc<dyn RequestListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.lock();
        let mut updated = Vec::with_capacity(listeners.len() + 1);
        updated.extend(listeners.iter().cloned());
        updated.push((id, listener));
        *listeners = Arc::new(updated);
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        if !listeners.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        let updated: Vec<_> = listeners
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        *listeners = Arc::new(updated);
        true
    }

    pub(crate) fn dispatch(&self, event: RequestEvent) {
        let snapshot = Arc::clone(&self.listeners.lock());
        for (_, listener) in snapshot.iter() {
            listener.on_event(event.clone());
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.lock().len()
    }
}
