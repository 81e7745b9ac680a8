use parking_lot::Mutex;

use crate::model::GoalClone;

/// Priority-ordered queue of goal instances shared by deliberation and
/// intention processing.
///
/// Entries stay sorted by descending priority; equal priorities keep arrival
/// order. Every operation holds the lock for its whole duration.
#[derive(Debug, Default)]
pub struct IntentionQueue {
    entries: Mutex<Vec<GoalClone>>,
}

impl IntentionQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts one instance.
    pub fn push(&self, clone: GoalClone) {
        let mut entries = self.entries.lock();
        insert_sorted(&mut entries, clone);
    }

    /// Inserts a batch atomically, preserving the batch order among ties.
    pub fn extend(&self, clones: impl IntoIterator<Item = GoalClone>) {
        let mut entries = self.entries.lock();
        for clone in clones {
            insert_sorted(&mut entries, clone);
        }
    }

    /// Removes and returns every queued instance, highest priority first.
    /// Later insertions wait for the next call.
    #[must_use]
    pub fn take_all(&self) -> Vec<GoalClone> {
        std::mem::take(&mut *self.entries.lock())
    }

    /// Copy of the queue contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<GoalClone> {
        self.entries.lock().clone()
    }

    /// Number of queued instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Whether the queue holds at least `capacity` instances.
    #[must_use]
    pub fn is_saturated(&self, capacity: usize) -> bool {
        self.len() >= capacity
    }
}

fn insert_sorted(entries: &mut Vec<GoalClone>, clone: GoalClone) {
    let at = entries.partition_point(|queued| queued.priority >= clone.priority);
    entries.insert(at, clone);
}
