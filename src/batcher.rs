use std::pin::Pin;
use std::time::Duration;

use tokio::time::Sleep;

/// Coalesces items pushed one-at-a-time into batches, flushed when either a
/// capacity threshold is reached or a delay elapses.
///
/// A delay of zero means "flush as soon as the scheduler services it", so we
/// model that as already-due rather than arming a zero-duration timer, which
/// would otherwise busy-loop the caller.
pub struct Batcher<T> {
    capacity: usize,
    delay: Duration,
    items: Vec<T>,
    timer: Option<Pin<Box<Sleep>>>,
}

impl<T> Batcher<T> {
    pub fn new(capacity: usize, delay: Duration) -> Self {
        Self {
            capacity,
            delay,
            items: Vec::new(),
            timer: None,
        }
    }

    /// Queue one item. Returns `true` if the batch is now due for an
    /// immediate flush (capacity reached, or delay is zero).
    pub fn queue(&mut self, item: T) -> bool {
        self.items.push(item);
        self.due_after_push()
    }

    /// Queue a whole burst of items that arrived together (e.g. one
    /// change-feed page). The due-ness check runs once, after the whole
    /// burst is buffered, so a zero-delay batcher still coalesces items that
    /// arrive in the same synchronous turn instead of flushing a singleton
    /// batch per item.
    pub fn queue_all(&mut self, items: impl IntoIterator<Item = T>) -> bool {
        self.items.extend(items);
        self.due_after_push()
    }

    fn due_after_push(&mut self) -> bool {
        if self.items.len() >= self.capacity {
            self.timer = None;
            return true;
        }
        if self.items.is_empty() {
            return false;
        }
        if self.delay.is_zero() {
            return true;
        }
        if self.timer.is_none() {
            self.timer = Some(Box::pin(tokio::time::sleep(self.delay)));
        }
        false
    }

    /// Resolves when the pending delay timer fires. Never resolves if there
    /// is no batch awaiting a timed flush, callers select this alongside
    /// other event sources.
    pub async fn wait_for_timeout(&mut self) {
        match self.timer.as_mut() {
            Some(timer) => timer.await,
            None => std::future::pending().await,
        }
    }

    /// Take whatever is buffered, due to either a capacity flush or a timer
    /// fire. Leaves the batcher empty.
    pub fn take_batch(&mut self) -> Vec<T> {
        self.timer = None;
        std::mem::take(&mut self.items)
    }

    /// Drain unconditionally, e.g. on stop.
    pub fn flush_all(&mut self) -> Vec<T> {
        self.take_batch()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
