//! Outgoing message queues.
//!
//! [`LinkedList`] keeps its nodes in a slab so push, shift and removal by
//! handle are O(1) without per-node allocation. [`PriorityQueue`] holds one
//! list per [`CoValuePriority`] class.

use cojson_types::CoValuePriority;

/// Stable reference to a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    slot: usize,
    generation: u64,
}

#[derive(Debug)]
struct Node<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
    generation: u64,
}

#[derive(Debug)]
enum Slot<T> {
    Occupied(Node<T>),
    Vacant { next_free: Option<usize> },
}

/// Doubly linked FIFO over a slab of nodes.
#[derive(Debug)]
pub struct LinkedList<T> {
    slots: Vec<Slot<T>>,
    free: Option<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    generation: u64,
}

impl<T> Default for LinkedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LinkedList<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: None,
            head: None,
            tail: None,
            len: 0,
            generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn node(&self, slot: usize) -> Option<&Node<T>> {
        match self.slots.get(slot) {
            Some(Slot::Occupied(node)) => Some(node),
            _ => None,
        }
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node<T>> {
        match self.slots.get_mut(slot) {
            Some(Slot::Occupied(node)) => Some(node),
            _ => None,
        }
    }

    pub fn push(&mut self, value: T) -> Handle {
        self.generation += 1;
        let node = Node {
            value,
            prev: self.tail,
            next: None,
            generation: self.generation,
        };
        let slot = match self.free {
            Some(slot) => {
                if let Some(Slot::Vacant { next_free }) = self.slots.get(slot) {
                    self.free = *next_free;
                }
                self.slots[slot] = Slot::Occupied(node);
                slot
            }
            None => {
                self.slots.push(Slot::Occupied(node));
                self.slots.len() - 1
            }
        };
        match self.tail {
            Some(tail) => {
                if let Some(tail) = self.node_mut(tail) {
                    tail.next = Some(slot);
                }
            }
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;
        Handle {
            slot,
            generation: self.generation,
        }
    }

    pub fn peek(&self) -> Option<&T> {
        self.head.and_then(|head| self.node(head)).map(|node| &node.value)
    }

    /// Removes and returns the oldest item.
    pub fn shift(&mut self) -> Option<T> {
        let head = self.head?;
        self.unlink(head)
    }

    /// Removes the item behind `handle`, if it is still queued.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        match self.node(handle.slot) {
            Some(node) if node.generation == handle.generation => self.unlink(handle.slot),
            _ => None,
        }
    }

    fn unlink(&mut self, slot: usize) -> Option<T> {
        let vacant = Slot::Vacant {
            next_free: self.free,
        };
        let Slot::Occupied(node) = std::mem::replace(self.slots.get_mut(slot)?, vacant) else {
            return None;
        };
        self.free = Some(slot);
        match node.prev {
            Some(prev) => {
                if let Some(prev) = self.node_mut(prev) {
                    prev.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                if let Some(next) = self.node_mut(next) {
                    next.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        self.len -= 1;
        Some(node.value)
    }
}

const CLASSES: usize = 3;

/// FIFO per priority class; [`shift`](Self::shift) drains higher classes first.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    lists: [LinkedList<T>; CLASSES],
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            lists: [LinkedList::new(), LinkedList::new(), LinkedList::new()],
        }
    }

    pub fn push(&mut self, priority: CoValuePriority, value: T) -> (CoValuePriority, Handle) {
        let handle = self.lists[priority.index()].push(value);
        (priority, handle)
    }

    pub fn shift(&mut self) -> Option<T> {
        self.lists.iter_mut().find_map(LinkedList::shift)
    }

    pub fn remove(&mut self, (priority, handle): (CoValuePriority, Handle)) -> Option<T> {
        self.lists[priority.index()].remove(handle)
    }

    pub fn len(&self) -> usize {
        self.lists.iter().map(LinkedList::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.iter().all(LinkedList::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut list = LinkedList::new();
        for i in 0..5 {
            list.push(i);
        }
        let drained: Vec<i32> = std::iter::from_fn(|| list.shift()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(list.is_empty());
    }

    #[test]
    fn remove_from_middle_keeps_links() {
        let mut list = LinkedList::new();
        let _a = list.push("a");
        let b = list.push("b");
        let _c = list.push("c");
        assert_eq!(list.remove(b), Some("b"));
        assert_eq!(list.remove(b), None);
        assert_eq!(list.len(), 2);
        assert_eq!(list.shift(), Some("a"));
        assert_eq!(list.shift(), Some("c"));
        assert_eq!(list.shift(), None);
    }

    #[test]
    fn slots_are_reused_and_stale_handles_ignored() {
        let mut list = LinkedList::new();
        let first = list.push(1);
        assert_eq!(list.shift(), Some(1));
        let second = list.push(2);
        assert_eq!(list.remove(first), None);
        assert_eq!(list.peek(), Some(&2));
        assert_eq!(list.remove(second), Some(2));
        assert!(list.is_empty());
    }

    #[test]
    fn higher_priority_shifts_first() {
        let mut queue = PriorityQueue::new();
        queue.push(CoValuePriority::Low, "low");
        queue.push(CoValuePriority::Medium, "medium");
        let high = queue.push(CoValuePriority::High, "high");
        queue.push(CoValuePriority::High, "high2");
        assert_eq!(queue.len(), 4);

        assert_eq!(queue.remove(high), Some("high"));
        assert_eq!(queue.shift(), Some("high2"));
        assert_eq!(queue.shift(), Some("medium"));
        assert_eq!(queue.shift(), Some("low"));
        assert!(queue.is_empty());
    }
}
