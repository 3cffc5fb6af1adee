use std::collections::BTreeMap;
use std::collections::VecDeque;

use crate::priority::Priority;

/// One FIFO bucket per priority level
///
/// `pop` always takes the head of the highest-precedence non-empty bucket,
/// giving strict priority across levels and FIFO within a level.
pub(crate) struct PriorityQueue<R> {
    buckets: [VecDeque<R>; Priority::COUNT],
}

impl<R> PriorityQueue<R> {
    pub(crate) fn new() -> Self {
        Self { buckets: std::array::from_fn(|_| VecDeque::new()) }
    }

    pub(crate) fn push(&mut self, priority: Priority, item: R) {
        self.buckets[priority.index()].push_back(item);
    }

    /// Priority of the request `pop` would return
    pub(crate) fn peek_priority(&self) -> Option<Priority> {
        Priority::ALL.into_iter().find(|p| !self.buckets[p.index()].is_empty())
    }

    pub(crate) fn pop(&mut self) -> Option<(Priority, R)> {
        let priority = self.peek_priority()?;
        self.buckets[priority.index()].pop_front().map(|item| (priority, item))
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    /// Pending requests per level, every level present
    pub(crate) fn depths(&self) -> BTreeMap<Priority, usize> {
        Priority::ALL.into_iter().map(|p| (p, self.buckets[p.index()].len())).collect()
    }

    /// Remove every pending request, highest precedence first
    pub(crate) fn drain(&mut self) -> Vec<R> {
        self.buckets.iter_mut().flat_map(|bucket| bucket.drain(..)).collect()
    }
}
