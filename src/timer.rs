//! Ordered timer list.
//!
//! A doubly linked list of timer nodes sorted by non-decreasing absolute
//! expiry, keyed by insertion order on ties. The original implementation
//! links raw `util_timer*` nodes by hand; idiomatic safe Rust represents
//! the same shape as an arena (`Vec<Node>`) addressed by index, which
//! keeps every operation safe while preserving the original's O(n)
//! insert and forward-only adjust algorithm.

use std::time::Instant;

pub type TimerId = usize;

struct Node {
    expire: Instant,
    slot: usize,
    prev: Option<TimerId>,
    next: Option<TimerId>,
}

/// Ascending-expiry doubly linked list of timer nodes, one per active
/// connection slot. Each active slot owns at most one timer node.
pub struct TimerList {
    nodes: Vec<Option<Node>>,
    free: Vec<TimerId>,
    head: Option<TimerId>,
    tail: Option<TimerId>,
}

impl TimerList {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn alloc(&mut self, node: Node) -> TimerId {
        if let Some(id) = self.free.pop() {
            self.nodes[id] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn node(&self, id: TimerId) -> &Node {
        self.nodes[id].as_ref().expect("dangling TimerId")
    }

    fn node_mut(&mut self, id: TimerId) -> &mut Node {
        self.nodes[id].as_mut().expect("dangling TimerId")
    }

    /// Inserts a new timer for `slot` expiring at `expire`. O(n) worst
    /// case; the common case (tail insert / near-head insert) is cheap.
    pub fn add(&mut self, slot: usize, expire: Instant) -> TimerId {
        let id = self.alloc(Node {
            expire,
            slot,
            prev: None,
            next: None,
        });

        match self.head {
            None => {
                self.head = Some(id);
                self.tail = Some(id);
            }
            Some(head_id) if expire < self.node(head_id).expire => {
                self.node_mut(id).next = Some(head_id);
                self.node_mut(head_id).prev = Some(id);
                self.head = Some(id);
            }
            Some(head_id) => self.insert_after(id, head_id),
        }
        id
    }

    /// Walks forward from `from` inserting `id` in its sorted position.
    fn insert_after(&mut self, id: TimerId, from: TimerId) {
        let mut prev = from;
        loop {
            match self.node(prev).next {
                Some(next) if self.node(next).expire <= self.node(id).expire => {
                    prev = next;
                }
                Some(next) => {
                    self.node_mut(id).prev = Some(prev);
                    self.node_mut(id).next = Some(next);
                    self.node_mut(prev).next = Some(id);
                    self.node_mut(next).prev = Some(id);
                    return;
                }
                None => {
                    self.node_mut(prev).next = Some(id);
                    self.node_mut(id).prev = Some(prev);
                    self.tail = Some(id);
                    return;
                }
            }
        }
    }

    fn unlink(&mut self, id: TimerId) {
        let (prev, next) = {
            let n = self.node(id);
            (n.prev, n.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
    }

    /// Sets `id`'s expiry to `new_expire` and repositions it. Assumes
    /// expiry only increases across calls on the same node; a caller
    /// that shortens expiry must relocate fully instead, which this
    /// routine does not attempt.
    pub fn adjust(&mut self, id: TimerId, new_expire: Instant) {
        self.node_mut(id).expire = new_expire;

        let next = self.node(id).next;
        let needs_move = match next {
            None => false,
            Some(next_id) => self.node(id).expire >= self.node(next_id).expire,
        };
        let Some(next_id) = next.filter(|_| needs_move) else {
            return;
        };

        // `next_id`'s expiry is known to be <= the new expiry (that's
        // exactly what `needs_move` checked), so it is a valid starting
        // point for the forward scan. Mirrors the original's
        // `add_timer(timer, timer->next)` call in both the head and
        // non-head cases.
        self.unlink(id);
        self.node_mut(id).prev = None;
        self.node_mut(id).next = None;
        self.insert_after(id, next_id);
    }

    /// Unlinks and frees `id`.
    pub fn remove(&mut self, id: TimerId) {
        self.unlink(id);
        self.nodes[id] = None;
        self.free.push(id);
    }

    /// Drains every node whose expiry is `<= now`, in head-to-tail order.
    /// Invokes `evict` with each node's slot index before unlinking and
    /// freeing the node, matching the original's `tmp->cb_func(...)` call
    /// ahead of `delete tmp`. Stops at the first non-expired head.
    pub fn tick(&mut self, now: Instant, mut evict: impl FnMut(usize)) {
        while let Some(id) = self.head {
            if self.node(id).expire > now {
                break;
            }
            let slot = self.node(id).slot;
            evict(slot);
            self.remove(id);
        }
    }

    /// Expiries in head-to-tail order; used by tests to assert ordering.
    #[cfg(test)]
    pub fn expiries(&self) -> Vec<Instant> {
        let mut out = Vec::new();
        let mut cur = self.head;
        while let Some(id) = cur {
            out.push(self.node(id).expire);
            cur = self.node(id).next;
        }
        out
    }
}

impl Default for TimerList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Clock {
        base: Instant,
    }

    impl Clock {
        fn new() -> Self {
            Self { base: Instant::now() }
        }

        fn at(&self, secs: u64) -> Instant {
            self.base + Duration::from_secs(secs)
        }
    }

    #[test]
    fn add_keeps_ascending_order() {
        let clock = Clock::new();
        let mut list = TimerList::new();
        list.add(1, clock.at(10));
        list.add(2, clock.at(5));
        list.add(3, clock.at(15));
        let exp = list.expiries();
        assert!(exp[0] <= exp[1] && exp[1] <= exp[2]);
        assert_eq!(exp, vec![clock.at(5), clock.at(10), clock.at(15)]);
    }

    #[test]
    fn adjust_forward_repositions_node() {
        let clock = Clock::new();
        let mut list = TimerList::new();
        let a = list.add(1, clock.at(5));
        list.add(2, clock.at(10));
        list.add(3, clock.at(15));
        list.adjust(a, clock.at(20));
        let exp = list.expiries();
        assert_eq!(exp, vec![clock.at(10), clock.at(15), clock.at(20)]);
    }

    #[test]
    fn adjust_noop_when_already_in_order() {
        let clock = Clock::new();
        let mut list = TimerList::new();
        let a = list.add(1, clock.at(5));
        list.add(2, clock.at(10));
        let before = list.expiries();
        list.adjust(a, clock.at(5));
        let after = list.expiries();
        assert_eq!(before, after);
    }

    #[test]
    fn remove_then_add_restores_sequence() {
        let clock = Clock::new();
        let mut list = TimerList::new();
        let a = list.add(1, clock.at(5));
        list.add(2, clock.at(10));
        let before = list.expiries();
        list.remove(a);
        assert_eq!(list.expiries().len(), 1);
        let a2 = list.add(1, before[0]);
        let after = list.expiries();
        assert_eq!(before, after);
        let _ = a2;
    }

    #[test]
    fn tick_on_empty_is_noop() {
        let mut list = TimerList::new();
        let mut evicted = Vec::new();
        list.tick(Instant::now(), |s| evicted.push(s));
        assert!(evicted.is_empty());
    }

    #[test]
    fn tick_drains_all_expired_nodes() {
        let mut list = TimerList::new();
        list.add(1, Instant::now() - Duration::from_secs(1));
        list.add(2, Instant::now() - Duration::from_secs(1));
        list.add(3, Instant::now() + Duration::from_secs(60));
        let mut evicted = Vec::new();
        list.tick(Instant::now(), |s| evicted.push(s));
        assert_eq!(evicted, vec![1, 2]);
        assert!(!list.is_empty());
    }

    #[test]
    fn tick_stops_at_first_unexpired_head() {
        let mut list = TimerList::new();
        list.add(1, Instant::now() + Duration::from_secs(60));
        list.add(2, Instant::now() - Duration::from_secs(1));
        let mut evicted = Vec::new();
        list.tick(Instant::now(), |s| evicted.push(s));
        // slot 2 sorts ahead of slot 1 (earlier expiry) and is expired, so
        // it drains; the new head (slot 1, expiring in 60s) is not
        // expired, so the walk stops there.
        assert_eq!(evicted, vec![2]);
    }
}
