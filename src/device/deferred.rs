//! Deferred release of resources still in use by the GPU.
//!
//! When a Memory drops while its last fence has not completed, its
//! resources are parked here and freed by the device once the fence passes.

use crossbeam_queue::SegQueue;

use crate::fence::FenceMark;

/// Resources waiting for a fence.
pub(crate) struct DeferredRelease<T> {
    pub(crate) mark: FenceMark,
    pub(crate) item: T,
}

/// Lock-free queue of deferred releases.
pub(crate) struct DeferredQueue<T> {
    queue: SegQueue<DeferredRelease<T>>,
}

impl<T> DeferredQueue<T> {
    /// Create an empty queue.
    pub(crate) fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }

    /// Park `item` until `mark` completes.
    pub(crate) fn push(&self, mark: FenceMark, item: T) {
        self.queue.push(DeferredRelease { mark, item });
    }

    /// Take every item whose fence completed; the rest stay queued.
    ///
    /// An item whose fence cannot be queried is waited on before it is
    /// returned.
    pub(crate) fn take_completed(&self) -> Vec<T> {
        let mut ready = Vec::new();
        let mut pending = Vec::new();
        while let Some(entry) = self.queue.pop() {
            match entry.mark.is_completed() {
                Ok(false) => pending.push(entry),
                Ok(true) => ready.push(entry.item),
                Err(err) => {
                    log::error!("waiting for fence {} before release: {}", entry.mark.value, err);
                    if let Err(err) = entry.mark.wait() {
                        log::error!("releasing resource after failed fence wait: {}", err);
                    }
                    ready.push(entry.item);
                }
            }
        }
        for entry in pending {
            self.queue.push(entry);
        }
        ready
    }

    /// Wait for every fence and take everything.
    pub(crate) fn drain_blocking(&self) -> Vec<T> {
        let mut items = Vec::new();
        while let Some(entry) = self.queue.pop() {
            if let Err(err) = entry.mark.wait() {
                log::warn!("releasing resource after failed fence wait: {}", err);
            }
            items.push(entry.item);
        }
        items
    }

    /// Approximate number of parked items.
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}

impl<T> Default for DeferredQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
