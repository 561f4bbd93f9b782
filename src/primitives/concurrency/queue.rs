use crossbeam_queue::ArrayQueue;

/// Bounded lock-free MPMC queue that never blocks producers.
///
/// A full queue hands the value back to the producer, which decides whether
/// that is fatal or a signal to drain first.
pub struct BoundedQueue<T> {
    inner: ArrayQueue<T>,
    name: &'static str,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items (minimum one).
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            inner: ArrayQueue::new(capacity.max(1)),
            name,
        }
    }

    /// Name used in diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Appends `value`, returning it back when the queue is full.
    pub fn push(&self, value: T) -> std::result::Result<(), T> {
        self.inner.push(value)
    }

    /// Removes the oldest item.
    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Maximum number of queued items.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// True once at least half of the capacity is used.
    pub fn is_half_full(&self) -> bool {
        self.inner.len() * 2 >= self.inner.capacity()
    }

    /// Moves every queued item into `dst`, oldest first. Returns how many.
    pub fn drain_into(&self, dst: &mut Vec<T>) -> usize {
        let before = dst.len();
        while let Some(item) = self.inner.pop() {
            dst.push(item);
        }
        dst.len() - before
    }
}
