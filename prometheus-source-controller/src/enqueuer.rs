use crate::{key::ObjectKey, workqueue::WorkQueue};

use log::trace;
use std::sync::{Arc, Weak};

/// Capability to re-enqueue keys from outside the watch event path, handed to
/// asynchronous subsystems (e.g. the sink resolver) at construction time.
///
/// Holds a weak reference only, enqueueing after the queue is gone is a no-op.
#[derive(Clone)]
pub struct Enqueuer {
    queue: Weak<WorkQueue>,
}

impl Enqueuer {
    pub fn new(queue: &Arc<WorkQueue>) -> Self {
        Self {
            queue: Arc::downgrade(queue),
        }
    }

    pub fn enqueue_key(&self, key: ObjectKey) {
        match self.queue.upgrade() {
            Some(queue) => queue.add(key),
            None => trace!("dropping {} as the work queue no longer exists", key),
        }
    }
}
