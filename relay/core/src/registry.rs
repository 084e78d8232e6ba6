use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

/**
    Stable identity of an element inside a [`Registry`].

    Ids are never reused for the lifetime of the registry, so an id taken
    from a cursor can be compared against later iterations.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(u64);

struct Node<T> {
    id: EntryId,
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

/**
    Arena-backed doubly linked list. Links are slot indexes into `nodes`;
    vacated slots are recycled through `free`.
*/
struct List<T> {
    nodes: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    next_id: u64,
}

impl<T> List<T> {
    const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
            next_id: 0,
        }
    }

    fn node(&self, at: usize) -> &Node<T> {
        match &self.nodes[at] {
            Some(node) => node,
            None => unreachable!("registry link points at a vacant slot"),
        }
    }

    fn node_mut(&mut self, at: usize) -> &mut Node<T> {
        match &mut self.nodes[at] {
            Some(node) => node,
            None => unreachable!("registry link points at a vacant slot"),
        }
    }

    fn alloc(&mut self, value: T, prev: Option<usize>, next: Option<usize>) -> usize {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        let node = Some(Node {
            id,
            value,
            prev,
            next,
        });
        self.len += 1;
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn push_back(&mut self, value: T) -> usize {
        let at = self.alloc(value, self.tail, None);
        match self.tail {
            Some(tail) => self.node_mut(tail).next = Some(at),
            None => self.head = Some(at),
        }
        self.tail = Some(at);
        at
    }

    fn push_front(&mut self, value: T) -> usize {
        let at = self.alloc(value, None, self.head);
        match self.head {
            Some(head) => self.node_mut(head).prev = Some(at),
            None => self.tail = Some(at),
        }
        self.head = Some(at);
        at
    }

    /**
        Insert `value` in front of the node at `before`.
    */
    fn insert_before(&mut self, before: usize, value: T) -> usize {
        let prev = self.node(before).prev;
        let at = self.alloc(value, prev, Some(before));
        self.node_mut(before).prev = Some(at);
        match prev {
            Some(prev) => self.node_mut(prev).next = Some(at),
            None => self.head = Some(at),
        }
        at
    }

    /**
        Detach the node at `at`, relinking its neighbours.
        Returns the owned value and the successor slot.
    */
    fn unlink(&mut self, at: usize) -> (T, Option<usize>) {
        let node = match self.nodes[at].take() {
            Some(node) => node,
            None => unreachable!("registry link points at a vacant slot"),
        };
        match node.prev {
            Some(prev) => self.node_mut(prev).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.node_mut(next).prev = node.prev,
            None => self.tail = node.prev,
        }
        self.free.push(at);
        self.len -= 1;
        (node.value, node.next)
    }

    fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        let mut at = self.head;
        while let Some(slot) = at {
            let (value, next) = self.unlink(slot);
            out.push(value);
            at = next;
        }
        self.nodes.clear();
        self.free.clear();
        out
    }
}

/**
    Mutex-guarded ordered sequence.

    All iteration goes through a [`Cursor`], which holds the registry lock for
    its entire lifetime. Compound edits made through one cursor (look up a
    card, then remove it) are therefore atomic with respect to every other
    user of the registry. The flip side is that a cursor kept alive blocks all
    other operations, including `len`, until it is dropped.
*/
pub struct Registry<T> {
    list: Mutex<List<T>>,
}

impl<T> Registry<T> {
    pub const fn new() -> Self {
        Self {
            list: Mutex::new(List::new()),
        }
    }

    /**
        Add an element at the back.
    */
    pub fn append(&self, value: T) -> EntryId {
        let mut list = self.list.lock();
        let at = list.push_back(value);
        list.node(at).id
    }

    /**
        Add an element at the front.
    */
    pub fn prepend(&self, value: T) -> EntryId {
        let mut list = self.list.lock();
        let at = list.push_front(value);
        list.node(at).id
    }

    /**
        Number of elements.
    */
    pub fn len(&self) -> usize {
        self.list.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /**
        Start an iteration at the first element, taking the registry lock.
    */
    pub fn cursor(&self) -> Cursor<'_, T> {
        Cursor::new(self.list.lock())
    }

    /**
        Like [`Registry::cursor`], but gives up after `timeout` if another
        cursor is still alive.
    */
    pub fn try_cursor_for(&self, timeout: Duration) -> Option<Cursor<'_, T>> {
        self.list.try_lock_for(timeout).map(Cursor::new)
    }

    /**
        Returns `true` if any element satisfies `pred`.
    */
    pub fn any(&self, mut pred: impl FnMut(&T) -> bool) -> bool {
        let mut cursor = self.cursor();
        while let Some(value) = cursor.current() {
            if pred(value) {
                return true;
            }
            cursor.advance();
        }
        false
    }

    /**
        Remove and return every element, front to back.
    */
    pub fn clear(&self) -> Vec<T> {
        self.list.lock().drain()
    }

    /**
        Copy of the current contents, front to back.
    */
    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        let mut out = Vec::new();
        let mut cursor = self.cursor();
        while let Some(value) = cursor.current() {
            out.push(value.clone());
            cursor.advance();
        }
        out
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.list.try_lock() {
            Some(list) => {
                let mut entries = f.debug_list();
                let mut at = list.head;
                while let Some(slot) = at {
                    let node = list.node(slot);
                    entries.entry(&node.value);
                    at = node.next;
                }
                entries.finish()
            }
            None => f.write_str("Registry(<locked>)"),
        }
    }
}

/**
    Scoped iteration handle over a [`Registry`]. Dropping it releases the lock.
*/
pub struct Cursor<'a, T> {
    list: MutexGuard<'a, List<T>>,
    current: Option<usize>,
}

impl<'a, T> Cursor<'a, T> {
    fn new(list: MutexGuard<'a, List<T>>) -> Self {
        let current = list.head;
        Self { list, current }
    }

    /**
        Element under the cursor, `None` once iteration ran past the end.
    */
    pub fn current(&self) -> Option<&T> {
        self.current.map(|at| &self.list.node(at).value)
    }

    /**
        Id of the element under the cursor.
    */
    pub fn id(&self) -> Option<EntryId> {
        self.current.map(|at| self.list.node(at).id)
    }

    /**
        Move to the next element and return it.
    */
    pub fn advance(&mut self) -> Option<&T> {
        self.current = self.current.and_then(|at| self.list.node(at).next);
        self.current()
    }

    /**
        Insert `value` in front of the cursor position (at the back when the
        cursor ran past the end) and move the cursor onto it.
    */
    pub fn insert(&mut self, value: T) -> &T {
        let at = match self.current {
            Some(before) => self.list.insert_before(before, value),
            None => self.list.push_back(value),
        };
        self.current = Some(at);
        &self.list.node(at).value
    }

    /**
        Remove the element under the cursor and move to its successor, which
        is then read through [`Cursor::current`]. Returns the removed element,
        or `None` when there is nothing under the cursor.
    */
    pub fn remove(&mut self) -> Option<T> {
        let at = self.current?;
        let (value, next) = self.list.unlink(at);
        self.current = next;
        Some(value)
    }

    /**
        Number of elements in the registry.
    */
    pub fn len(&self) -> usize {
        self.list.len
    }

    pub fn is_empty(&self) -> bool {
        self.list.len == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use proptest::prelude::*;

    use super::*;

    fn collect(registry: &Registry<u32>) -> Vec<u32> {
        registry.snapshot()
    }

    #[test]
    fn append_and_iterate_in_order() {
        let registry = Registry::new();
        registry.append(1);
        registry.append(2);
        registry.prepend(0);
        assert_eq!(collect(&registry), vec![0, 1, 2]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn removing_only_element_empties_both_ends() {
        let registry = Registry::new();
        registry.append(7);
        {
            let mut cursor = registry.cursor();
            assert_eq!(cursor.remove(), Some(7));
            assert_eq!(cursor.current(), None);
            assert!(cursor.is_empty());
        }
        // Both ends must be cleared: appending again yields a single element.
        registry.append(8);
        assert_eq!(collect(&registry), vec![8]);
        registry.prepend(9);
        assert_eq!(collect(&registry), vec![9, 8]);
    }

    #[test]
    fn remove_mid_iteration_yields_successor() {
        let registry = Registry::new();
        for v in 1..=4 {
            registry.append(v);
        }
        {
            let mut cursor = registry.cursor();
            cursor.advance();
            assert_eq!(cursor.remove(), Some(2));
            assert_eq!(cursor.current(), Some(&3));
            cursor.advance();
            assert_eq!(cursor.remove(), Some(4));
            assert_eq!(cursor.current(), None);
        }
        assert_eq!(collect(&registry), vec![1, 3]);
    }

    #[test]
    fn insert_goes_in_front_of_cursor() {
        let registry = Registry::new();
        registry.append(1);
        registry.append(3);
        {
            let mut cursor = registry.cursor();
            cursor.advance();
            assert_eq!(*cursor.insert(2), 2);
            assert_eq!(cursor.advance(), Some(&3));
            assert_eq!(cursor.advance(), None);
            cursor.insert(4);
        }
        assert_eq!(collect(&registry), vec![1, 2, 3, 4]);
    }

    #[test]
    fn ids_are_not_reused() {
        let registry = Registry::new();
        let a = registry.append(1);
        registry.cursor().remove();
        let b = registry.append(2);
        assert_ne!(a, b);
        assert_eq!(registry.cursor().id(), Some(b));
    }

    #[test]
    fn clear_returns_everything() {
        let registry = Registry::new();
        registry.append("a");
        registry.append("b");
        assert_eq!(registry.clear(), vec!["a", "b"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn live_cursor_blocks_other_users() {
        let registry = Arc::new(Registry::new());
        registry.append(1u32);

        let cursor = registry.cursor();
        let other = Arc::clone(&registry);
        let blocked = thread::spawn(move || {
            other
                .try_cursor_for(Duration::from_millis(50))
                .map(|c| c.len())
        })
        .join()
        .unwrap();
        assert_eq!(blocked, None);
        drop(cursor);

        assert!(registry.try_cursor_for(Duration::from_millis(50)).is_some());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Append(u32),
        Prepend(u32),
        Remove(usize),
        Insert(usize, u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<u32>().prop_map(Op::Append),
            any::<u32>().prop_map(Op::Prepend),
            (0usize..8).prop_map(Op::Remove),
            (0usize..8, any::<u32>()).prop_map(|(at, v)| Op::Insert(at, v)),
        ]
    }

    proptest! {
        #[test]
        fn count_matches_reachable_elements(ops in proptest::collection::vec(op(), 0..64)) {
            let registry = Registry::new();
            let mut model: Vec<u32> = Vec::new();

            for op in ops {
                match op {
                    Op::Append(v) => {
                        registry.append(v);
                        model.push(v);
                    }
                    Op::Prepend(v) => {
                        registry.prepend(v);
                        model.insert(0, v);
                    }
                    Op::Remove(at) => {
                        let mut cursor = registry.cursor();
                        for _ in 0..at {
                            cursor.advance();
                        }
                        let removed = cursor.remove();
                        if at < model.len() {
                            prop_assert_eq!(removed, Some(model.remove(at)));
                            prop_assert_eq!(cursor.current().copied(), model.get(at).copied());
                        } else {
                            prop_assert_eq!(removed, None);
                        }
                    }
                    Op::Insert(at, v) => {
                        let mut cursor = registry.cursor();
                        for _ in 0..at {
                            cursor.advance();
                        }
                        cursor.insert(v);
                        model.insert(at.min(model.len()), v);
                    }
                }

                let snapshot = registry.snapshot();
                prop_assert_eq!(registry.len(), snapshot.len());
                prop_assert_eq!(&snapshot, &model);
            }
        }
    }
}
