//! Index-linked circular lists
//!
//! Nodes live in a [`ListArena`] and refer to each other by slot index
//! instead of by pointer. A node that is not linked to anything is a
//! singleton cycle (`next == prev == self`). Handles carry a generation so a
//! handle to a removed node panics on use rather than aliasing whatever
//! record reuses the slot.
//!
//! Sentinel nodes head a list and count their members. A node joining a
//! sentinel's cycle through [`ListArena::link_to`] is counted; detaching or
//! removing it uncounts it, so a list's length stays exact however its
//! members leave.

use std::fmt;

/// Handle to a node in a [`ListArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    /// Slot index inside the arena
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    prev: u32,
    next: u32,
    generation: u32,
    occupied: bool,
    owner: Option<T>,
    /// Sentinel this node is counted under
    list: Option<u32>,
    /// Member count; `Some` only for sentinels
    members: Option<usize>,
}

/// Arena of circular doubly-linked list nodes.
///
/// `T` is the owner record a node stands for; sentinel nodes have no owner.
#[derive(Debug)]
pub struct ListArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Default for ListArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ListArena<T> {
    /// Create an empty arena
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Create an arena with room for `capacity` nodes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Number of live nodes (sentinels included)
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether the arena holds no live nodes
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Insert a node for `owner`; it starts as a singleton
    pub fn insert(&mut self, owner: T) -> NodeId {
        self.alloc_slot(Some(owner), None)
    }

    /// Insert an ownerless node, used as a list head
    pub fn insert_sentinel(&mut self) -> NodeId {
        self.alloc_slot(None, Some(0))
    }

    fn alloc_slot(&mut self, owner: Option<T>, members: Option<usize>) -> NodeId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.prev = index;
            slot.next = index;
            slot.occupied = true;
            slot.owner = owner;
            slot.list = None;
            slot.members = members;
            return NodeId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            prev: index,
            next: index,
            generation: 0,
            occupied: true,
            owner,
            list: None,
            members,
        });
        NodeId {
            index,
            generation: 0,
        }
    }

    /// Remove a node, detaching it from any cycle first.
    ///
    /// The slot is recycled; further use of `id` panics.
    pub fn remove(&mut self, id: NodeId) -> Option<T> {
        self.detach(id);
        let slot = self.slot_mut(id);
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        let owner = slot.owner.take();
        self.free.push(id.index);
        self.live -= 1;
        owner
    }

    /// Whether `id` still refers to a live node
    pub fn contains(&self, id: NodeId) -> bool {
        self.slots
            .get(id.index as usize)
            .map_or(false, |s| s.occupied && s.generation == id.generation)
    }

    /// The owner record of a node (handle-to-owner lookup)
    pub fn owner(&self, id: NodeId) -> Option<&T> {
        self.slot(id).owner.as_ref()
    }

    /// Mutable owner record of a node
    pub fn owner_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.slot_mut(id).owner.as_mut()
    }

    /// Successor of a node
    pub fn next(&self, id: NodeId) -> NodeId {
        let next = self.slot(id).next;
        self.handle(next)
    }

    /// Predecessor of a node
    pub fn prev(&self, id: NodeId) -> NodeId {
        let prev = self.slot(id).prev;
        self.handle(prev)
    }

    /// Whether a node is a singleton (linked to nothing else)
    pub fn is_singleton(&self, id: NodeId) -> bool {
        self.slot(id).next == id.index
    }

    /// Whether a node was inserted as a sentinel
    pub fn is_sentinel(&self, id: NodeId) -> bool {
        self.slot(id).members.is_some()
    }

    /// Sentinel of the list a node is counted under
    pub fn list_of(&self, id: NodeId) -> Option<NodeId> {
        self.slot(id).list.map(|h| self.handle(h))
    }

    /// Number of members counted under a sentinel; 0 for plain nodes
    pub fn members(&self, head: NodeId) -> usize {
        self.slot(head).members.unwrap_or(0)
    }

    fn list_head(&self, index: u32) -> Option<u32> {
        let slot = &self.slots[index as usize];
        if slot.members.is_some() {
            Some(index)
        } else {
            slot.list
        }
    }

    fn enlist(&mut self, index: u32, head: u32) {
        self.slots[index as usize].list = Some(head);
        if let Some(members) = self.slots[head as usize].members.as_mut() {
            *members += 1;
        }
    }

    fn delist(&mut self, index: u32) {
        if let Some(head) = self.slots[index as usize].list.take() {
            if let Some(members) = self.slots[head as usize].members.as_mut() {
                *members -= 1;
            }
        }
    }

    /// A node that is alone in its cycle and not a sentinel
    fn is_loose(&self, index: u32) -> bool {
        let slot = &self.slots[index as usize];
        slot.next == index && slot.members.is_none()
    }

    /// Splice the cycle containing `other` in right after `this`.
    ///
    /// With `other` a singleton this places `other` immediately after
    /// `this`; with `this` a singleton it places `this` immediately before
    /// `other`.
    pub fn link_to(&mut self, this: NodeId, other: NodeId) {
        self.check(this);
        self.check(other);

        let this_loose = self.is_loose(this.index);
        let other_loose = self.is_loose(other.index);

        let this_next = self.slots[this.index as usize].next;
        let other_prev = self.slots[other.index as usize].prev;

        self.slots[this_next as usize].prev = other_prev;
        self.slots[other_prev as usize].next = this_next;
        self.slots[this.index as usize].next = other.index;
        self.slots[other.index as usize].prev = this.index;

        if other_loose {
            if let Some(head) = self.list_head(this.index) {
                self.enlist(other.index, head);
            }
        } else if this_loose {
            if let Some(head) = self.list_head(other.index) {
                self.enlist(this.index, head);
            }
        }
    }

    /// Unlink a node from its cycle, leaving it a singleton
    pub fn detach(&mut self, id: NodeId) {
        self.check(id);
        if self.slots[id.index as usize].members.is_some() {
            // members left behind are no longer counted under this head
            let mut cur = self.slots[id.index as usize].next;
            while cur != id.index {
                if self.slots[cur as usize].list == Some(id.index) {
                    self.slots[cur as usize].list = None;
                }
                cur = self.slots[cur as usize].next;
            }
            self.slots[id.index as usize].members = Some(0);
        } else {
            self.delist(id.index);
        }
        let (prev, next) = {
            let slot = &self.slots[id.index as usize];
            (slot.prev, slot.next)
        };
        self.slots[prev as usize].next = next;
        self.slots[next as usize].prev = prev;

        let slot = &mut self.slots[id.index as usize];
        slot.prev = id.index;
        slot.next = id.index;
    }

    /// Detach `this` and link it in front of `other`
    pub fn move_to(&mut self, this: NodeId, other: NodeId) {
        self.detach(this);
        self.link_to(this, other);
    }

    /// Number of nodes in the cycle containing `id`, `id` included
    pub fn cycle_len(&self, id: NodeId) -> usize {
        let mut count = 1;
        let mut cur = self.slot(id).next;
        while cur != id.index {
            count += 1;
            cur = self.slots[cur as usize].next;
        }
        count
    }

    fn handle(&self, index: u32) -> NodeId {
        NodeId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    #[inline]
    fn check(&self, id: NodeId) {
        assert!(
            self.contains(id),
            "stale list node handle {} used after removal",
            id
        );
    }

    fn slot(&self, id: NodeId) -> &Slot<T> {
        self.check(id);
        &self.slots[id.index as usize]
    }

    fn slot_mut(&mut self, id: NodeId) -> &mut Slot<T> {
        self.check(id);
        &mut self.slots[id.index as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(arena: &mut ListArena<u32>, n: u32) -> Vec<NodeId> {
        let nodes: Vec<NodeId> = (0..n).map(|i| arena.insert(i)).collect();
        for pair in nodes.windows(2) {
            // place pair[1] right after pair[0]
            arena.link_to(pair[0], pair[1]);
        }
        nodes
    }

    #[test]
    fn test_fresh_node_is_singleton() {
        let mut arena = ListArena::new();
        let a = arena.insert("a");
        assert!(arena.is_singleton(a));
        assert_eq!(arena.next(a), a);
        assert_eq!(arena.prev(a), a);
        assert_eq!(arena.owner(a), Some(&"a"));
    }

    #[test]
    fn test_link_order() {
        let mut arena = ListArena::new();
        let nodes = ring(&mut arena, 4);
        for i in 0..4 {
            assert_eq!(arena.next(nodes[i]), nodes[(i + 1) % 4]);
            assert_eq!(arena.prev(nodes[(i + 1) % 4]), nodes[i]);
        }
        assert_eq!(arena.cycle_len(nodes[0]), 4);
    }

    #[test]
    fn test_detach_shrinks_cycle() {
        let mut arena = ListArena::new();
        let nodes = ring(&mut arena, 5);

        arena.detach(nodes[2]);
        assert!(arena.is_singleton(nodes[2]));
        assert_eq!(arena.prev(nodes[2]), nodes[2]);
        assert_eq!(arena.cycle_len(nodes[0]), 4);
        assert_eq!(arena.next(nodes[1]), nodes[3]);
    }

    #[test]
    fn test_move_to() {
        let mut arena = ListArena::new();
        let nodes = ring(&mut arena, 3);
        let head = arena.insert_sentinel();

        arena.move_to(nodes[1], head);
        assert_eq!(arena.cycle_len(nodes[0]), 2);
        assert_eq!(arena.cycle_len(head), 2);
        assert_eq!(arena.next(head), nodes[1]);
        assert_eq!(arena.owner(head), None);
    }

    #[test]
    fn test_remove_detaches_and_recycles() {
        let mut arena = ListArena::new();
        let nodes = ring(&mut arena, 3);

        assert_eq!(arena.remove(nodes[1]), Some(1));
        assert!(!arena.contains(nodes[1]));
        assert_eq!(arena.cycle_len(nodes[0]), 2);
        assert_eq!(arena.len(), 2);

        let reused = arena.insert(9);
        assert_eq!(reused.index(), nodes[1].index());
        assert_ne!(reused, nodes[1]);
    }

    #[test]
    fn test_sentinel_counts_members() {
        let mut arena = ListArena::new();
        let head = arena.insert_sentinel();
        let a = arena.insert(1u32);
        let b = arena.insert(2u32);
        let c = arena.insert(3u32);

        arena.link_to(head, a);
        arena.link_to(b, head);
        arena.link_to(a, c);
        assert_eq!(arena.members(head), 3);
        assert_eq!(arena.list_of(c), Some(head));

        // moving within the list keeps the count
        let first = arena.next(head);
        arena.move_to(b, first);
        assert_eq!(arena.members(head), 3);

        arena.detach(a);
        assert_eq!(arena.members(head), 2);
        assert_eq!(arena.list_of(a), None);

        assert_eq!(arena.remove(c), Some(3));
        assert_eq!(arena.members(head), 1);
        assert_eq!(arena.cycle_len(head), 2);
    }

    #[test]
    fn test_removing_sentinel_releases_members() {
        let mut arena = ListArena::new();
        let head = arena.insert_sentinel();
        let a = arena.insert(1u32);
        let b = arena.insert(2u32);
        arena.link_to(head, a);
        arena.link_to(a, b);

        assert_eq!(arena.remove(head), None);
        assert_eq!(arena.list_of(a), None);
        assert_eq!(arena.list_of(b), None);
        assert_eq!(arena.cycle_len(a), 2);

        let fresh = arena.insert_sentinel();
        assert!(arena.is_sentinel(fresh));
        assert_eq!(arena.members(fresh), 0);
    }

    #[test]
    #[should_panic(expected = "stale list node handle")]
    fn test_stale_handle_panics() {
        let mut arena = ListArena::new();
        let a = arena.insert(1u8);
        arena.remove(a);
        let _ = arena.next(a);
    }
}
