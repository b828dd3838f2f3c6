//! Private module for selective re-export.

/// A mutable cell with a dirty bit and a shadow copy, forming the primitive
/// undo-log discipline used by globals and by every stack frame's locals.
///
/// The first mutation after a checkpoint clones the current contents into the
/// shadow; further mutations before the next checkpoint are free. At checkpoint
/// time the shadow is handed out as the undo-log entry for that interval.
#[derive(Debug)]
pub struct UndoableStore<T: Clone> {
    current: T,
    shadow: Option<T>,
    dirty: bool,
}

impl<T: Clone> UndoableStore<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: value,
            shadow: None,
            dirty: false,
        }
    }

    /// Read access. Never affects the dirty bit.
    pub fn get(&self) -> &T {
        &self.current
    }

    /// Write access. Saves a shadow copy on the first mutation after a
    /// checkpoint.
    pub fn get_mut(&mut self) -> &mut T {
        if !self.dirty {
            self.shadow = Some(self.current.clone());
            self.dirty = true;
        }
        &mut self.current
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Takes the undo-log entry for the interval that ends now: the shadow if
    /// the store was mutated, `None` otherwise. Clears the dirty bit.
    pub fn check_in(&mut self) -> Option<T> {
        self.dirty = false;
        self.shadow.take()
    }

    /// The value as of the last checkpoint: the shadow if a mutation is
    /// pending, the current contents otherwise.
    pub fn checkpoint_value(&self) -> &T {
        self.shadow.as_ref().unwrap_or(&self.current)
    }

    /// Overwrites the contents during rollback, discarding any shadow.
    pub fn restore(&mut self, value: T) {
        self.current = value;
        self.shadow = None;
        self.dirty = false;
    }

    /// Discards uncommitted work by restoring from the shadow.
    pub fn revert(&mut self) {
        if let Some(shadow) = self.shadow.take() {
            self.current = shadow;
        }
        self.dirty = false;
    }

    /// Restores across multiple checkpoints in one call. `logs` is ordered
    /// newest-first, so the restoration point is the last non-empty entry
    /// (the shadow saved in the oldest undone interval, which holds the value
    /// as of the target checkpoint). Pending uncommitted work must be
    /// reverted by the caller beforehand.
    pub fn rollback(&mut self, logs: &[Option<T>]) {
        debug_assert!(!self.dirty);
        if let Some(oldest) = logs.iter().rev().flatten().next() {
            self.current = oldest.clone();
        }
        self.shadow = None;
        self.dirty = false;
    }

    /// A clean deep copy with no pending shadow.
    pub fn fork(&self) -> Self {
        Self {
            current: self.current.clone(),
            shadow: None,
            dirty: false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_mutation_saves_a_shadow() {
        let mut store = UndoableStore::new(1);
        assert!(!store.is_dirty());
        *store.get_mut() = 2;
        *store.get_mut() = 3;
        assert!(store.is_dirty());
        assert_eq!(store.check_in(), Some(1));
        assert!(!store.is_dirty());
    }

    #[test]
    fn check_in_is_empty_when_unmodified() {
        let mut store = UndoableStore::new(7);
        assert_eq!(store.check_in(), None);
        let _ = store.get();
        assert_eq!(store.check_in(), None);
    }

    #[test]
    fn revert_discards_uncommitted_work() {
        let mut store = UndoableStore::new("a".to_string());
        *store.get_mut() = "b".to_string();
        store.revert();
        assert_eq!(store.get(), "a");
        assert!(!store.is_dirty());
    }

    #[test]
    fn rollback_restores_the_oldest_log() {
        let mut store = UndoableStore::new(0);
        *store.get_mut() = 1;
        let log1 = store.check_in(); // interval saved value 0
        *store.get_mut() = 2;
        let log2 = store.check_in(); // interval saved value 1
        let log3: Option<i32> = None; // untouched interval
        store.rollback(&[log3, log2, log1]);
        assert_eq!(*store.get(), 0);
    }

    #[test]
    fn rollback_with_no_logs_is_a_noop() {
        let mut store = UndoableStore::new(5);
        store.rollback(&[None, None]);
        assert_eq!(*store.get(), 5);
    }
}
