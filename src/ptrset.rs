/// A dynamically growing LIFO bag, used as the free-set container for
/// deferred object frees. Despite the name it is not a true set: `push`
/// does not deduplicate and `pop` returns the most recent element.
#[derive(Debug)]
pub struct PtrSet<T> {
    items: Vec<T>,
}

impl<T> PtrSet<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Amortized O(1); grows geometrically.
    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    /// O(n) scan.
    pub fn is_member(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        self.items.iter().any(|x| x == item)
    }

    /// Logical clear; keeps the allocation.
    pub fn reset(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Drains elements satisfying the predicate, returning them in pop
    /// order. Used by checkpoint cleanup to free only entries older than
    /// the reclamation boundary.
    pub fn drain_where<F>(&mut self, mut pred: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut drained = Vec::new();
        let mut i = 0;
        while i < self.items.len() {
            if pred(&self.items[i]) {
                drained.push(self.items.swap_remove(i));
            } else {
                i += 1;
            }
        }
        drained
    }
}

impl<T> Default for PtrSet<T> {
    fn default() -> Self {
        Self::new()
    }
}
