//! Least-recently-used ordering over [`ListArena`] nodes
//!
//! The list is a sentinel head plus a count. `head.next` is the most
//! recently used node, `head.prev` the eviction candidate. The LRU only
//! orders nodes; the caller owns whatever the nodes stand for and acts on
//! evicted nodes itself.
//!
//! The member count lives on the sentinel in the arena, so destroying a
//! linked record with [`ListArena::remove`] keeps the length exact.

use super::list::{ListArena, NodeId};

/// Sentinel-headed LRU list
#[derive(Debug)]
pub struct Lru {
    head: NodeId,
}

impl Lru {
    /// Create an empty LRU whose sentinel lives in `arena`
    pub fn new<T>(arena: &mut ListArena<T>) -> Self {
        Self {
            head: arena.insert_sentinel(),
        }
    }

    /// Number of linked nodes
    pub fn len<T>(&self, arena: &ListArena<T>) -> usize {
        arena.members(self.head)
    }

    /// Whether no node is linked
    pub fn is_empty<T>(&self, arena: &ListArena<T>) -> bool {
        arena.is_singleton(self.head)
    }

    /// Sentinel handle
    pub fn head(&self) -> NodeId {
        self.head
    }

    /// Link an unlinked node at the head (MRU) or the tail (LRU end)
    pub fn add<T>(&mut self, arena: &mut ListArena<T>, node: NodeId, at_head: bool) {
        debug_assert!(
            arena.is_singleton(node),
            "node {} is already linked into a list",
            node
        );
        if at_head {
            arena.link_to(self.head, node);
        } else {
            arena.link_to(node, self.head);
        }
    }

    /// Move a linked node to the head
    pub fn promote<T>(&mut self, arena: &mut ListArena<T>, node: NodeId) {
        debug_assert!(!arena.is_singleton(node), "promote of unlinked node {}", node);
        arena.detach(node);
        arena.link_to(self.head, node);
    }

    /// Unlink and return the least recently used node
    pub fn evict<T>(&mut self, arena: &mut ListArena<T>) -> Option<NodeId> {
        let tail = self.least_recent(arena)?;
        arena.detach(tail);
        Some(tail)
    }

    /// Unlink a specific node, e.g. before its record is destroyed
    pub fn unlink<T>(&mut self, arena: &mut ListArena<T>, node: NodeId) {
        if arena.list_of(node) == Some(self.head) {
            arena.detach(node);
        }
    }

    /// Unlink a node and destroy its record
    pub fn destroy<T>(&mut self, arena: &mut ListArena<T>, node: NodeId) -> Option<T> {
        self.unlink(arena, node);
        arena.remove(node)
    }

    /// Most recently used node
    pub fn most_recent<T>(&self, arena: &ListArena<T>) -> Option<NodeId> {
        let node = arena.next(self.head);
        (node != self.head).then_some(node)
    }

    /// Least recently used node, the next eviction victim
    pub fn least_recent<T>(&self, arena: &ListArena<T>) -> Option<NodeId> {
        let node = arena.prev(self.head);
        (node != self.head).then_some(node)
    }

    /// Nodes from most to least recently used
    pub fn iter<'a, T>(&self, arena: &'a ListArena<T>) -> impl Iterator<Item = NodeId> + 'a {
        let head = self.head;
        let mut cur = arena.next(head);
        std::iter::from_fn(move || {
            if cur == head {
                return None;
            }
            let node = cur;
            cur = arena.next(cur);
            Some(node)
        })
    }
}
