//! Live-allocation list.
//!
//! A doubly-linked ring over slab indices. Slot 0 is the sentinel of the
//! visible ring; every checkpoint owns one more sentinel whose ring holds the
//! blocks that were live when it was taken. Node slots are stable for the
//! lifetime of an allocation, so block headers can store them.

use std::sync::atomic::{AtomicU64, Ordering};

use xalloc_heap::Address;

use crate::map::Site;

const MAIN: usize = 0;

// Process-wide so a checkpoint from one list never validates against another.
static NEXT_CHECKPOINT: AtomicU64 = AtomicU64::new(1);

/// One tracked allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveBlock {
    pub ptr: Address,
    /// Start of the backend region behind `ptr`.
    pub base: Address,
    pub size: usize,
    pub align: usize,
    pub site: Site,
}

/// Handle returned by [`LiveList::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    slot: usize,
    id: u64,
}

#[derive(Debug, Clone, Copy)]
enum Body {
    Sentinel { id: u64 },
    Block(LiveBlock),
    Vacant,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    prev: usize,
    next: usize,
    body: Body,
}

#[derive(Debug)]
pub struct LiveList {
    nodes: Vec<Node>,
    vacant: Vec<usize>,
    blocks: usize,
    bytes: usize,
}

impl Default for LiveList {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveList {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                prev: MAIN,
                next: MAIN,
                body: Body::Sentinel { id: 0 },
            }],
            vacant: Vec::new(),
            blocks: 0,
            bytes: 0,
        }
    }

    /// Appends `block` at the tail of the visible ring and returns its slot.
    pub fn push_back(&mut self, block: LiveBlock) -> usize {
        let slot = self.claim(Body::Block(block));
        let tail = self.nodes[MAIN].prev;
        self.link_after(tail, slot);
        self.blocks += 1;
        self.bytes += block.size;
        slot
    }

    /// Unlinks and returns the block in `slot`.
    pub fn remove(&mut self, slot: usize) -> Option<LiveBlock> {
        let block = self.get(slot).copied()?;
        self.unlink(slot);
        self.release(slot);
        self.blocks -= 1;
        self.bytes -= block.size;
        Some(block)
    }

    #[must_use]
    pub fn get(&self, slot: usize) -> Option<&LiveBlock> {
        match &self.nodes.get(slot)?.body {
            Body::Block(block) => Some(block),
            _ => None,
        }
    }

    /// Replaces the block in `slot` without moving it in its ring.
    pub fn update(&mut self, slot: usize, block: LiveBlock) -> bool {
        let Some(node) = self.nodes.get_mut(slot) else {
            return false;
        };
        let Body::Block(old) = node.body else {
            return false;
        };
        node.body = Body::Block(block);
        self.bytes = self.bytes - old.size + block.size;
        true
    }

    /// Whether any tracked block, checkpointed or visible, starts at `ptr`.
    #[must_use]
    pub fn contains(&self, ptr: Address) -> bool {
        self.nodes
            .iter()
            .any(|node| matches!(node.body, Body::Block(block) if block.ptr == ptr))
    }

    /// Visible blocks in ring order.
    pub fn iter(&self) -> impl Iterator<Item = &LiveBlock> + '_ {
        self.ring(MAIN).filter_map(|slot| self.get(slot))
    }

    /// Number of visible blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring(MAIN).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes[MAIN].next == MAIN
    }

    /// Bytes held by all tracked blocks, checkpointed ones included.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.bytes
    }

    /// Number of tracked blocks, checkpointed ones included.
    #[must_use]
    pub fn total_blocks(&self) -> usize {
        self.blocks
    }

    /// Moves every visible block behind a new sentinel.
    pub fn checkpoint(&mut self) -> Checkpoint {
        let id = NEXT_CHECKPOINT.fetch_add(1, Ordering::Relaxed);
        let slot = self.claim(Body::Sentinel { id });
        self.nodes[slot].prev = slot;
        self.nodes[slot].next = slot;
        if !self.is_empty() {
            let (first, last) = (self.nodes[MAIN].next, self.nodes[MAIN].prev);
            self.nodes[slot].next = first;
            self.nodes[slot].prev = last;
            self.nodes[first].prev = slot;
            self.nodes[last].next = slot;
            self.nodes[MAIN].next = MAIN;
            self.nodes[MAIN].prev = MAIN;
        }
        Checkpoint { slot, id }
    }

    /// Re-attaches the blocks saved by `checkpoint` ahead of the visible
    /// ones. Returns `false` for a restored or foreign checkpoint.
    pub fn restore(&mut self, checkpoint: Checkpoint) -> bool {
        match self.nodes.get(checkpoint.slot).map(|n| n.body) {
            Some(Body::Sentinel { id }) if id == checkpoint.id && checkpoint.slot != MAIN => {}
            _ => return false,
        }
        let sentinel = checkpoint.slot;
        let (first, last) = (self.nodes[sentinel].next, self.nodes[sentinel].prev);
        if first != sentinel {
            let head = self.nodes[MAIN].next;
            self.nodes[MAIN].next = first;
            self.nodes[first].prev = MAIN;
            self.nodes[last].next = head;
            self.nodes[head].prev = last;
        }
        self.release(sentinel);
        true
    }

    /// Sorts the visible ring by address. Insertion sort: the ring is
    /// usually close to address order already.
    pub fn sort_by_address(&mut self) {
        let mut cur = self.nodes[MAIN].next;
        while cur != MAIN {
            let next = self.nodes[cur].next;
            let key = self.ptr_of(cur);
            let mut pos = self.nodes[cur].prev;
            while pos != MAIN && self.ptr_of(pos) > key {
                pos = self.nodes[pos].prev;
            }
            if pos != self.nodes[cur].prev {
                self.unlink(cur);
                self.link_after(pos, cur);
            }
            cur = next;
        }
    }

    fn ptr_of(&self, slot: usize) -> Address {
        self.get(slot).map_or(0, |b| b.ptr)
    }

    fn ring(&self, sentinel: usize) -> impl Iterator<Item = usize> + '_ {
        let mut cur = self.nodes[sentinel].next;
        std::iter::from_fn(move || {
            if cur == sentinel {
                return None;
            }
            let slot = cur;
            cur = self.nodes[cur].next;
            Some(slot)
        })
    }

    fn claim(&mut self, body: Body) -> usize {
        let node = Node {
            prev: MAIN,
            next: MAIN,
            body,
        };
        if let Some(slot) = self.vacant.pop() {
            self.nodes[slot] = node;
            slot
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }

    fn release(&mut self, slot: usize) {
        self.nodes[slot].body = Body::Vacant;
        self.vacant.push(slot);
    }

    fn link_after(&mut self, at: usize, slot: usize) {
        let next = self.nodes[at].next;
        self.nodes[slot].prev = at;
        self.nodes[slot].next = next;
        self.nodes[at].next = slot;
        self.nodes[next].prev = slot;
    }

    fn unlink(&mut self, slot: usize) {
        let Node { prev, next, .. } = self.nodes[slot];
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        self.nodes[slot].prev = slot;
        self.nodes[slot].next = slot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(ptr: Address, size: usize) -> LiveBlock {
        LiveBlock {
            ptr,
            base: ptr - 64,
            size,
            align: 16,
            site: Site::UNKNOWN,
        }
    }

    fn ptrs(list: &LiveList) -> Vec<Address> {
        list.iter().map(|b| b.ptr).collect()
    }

    #[test]
    fn push_remove_keeps_insertion_order() {
        let mut list = LiveList::new();
        let a = list.push_back(block(0x3000, 10));
        let _b = list.push_back(block(0x1000, 20));
        let _c = list.push_back(block(0x2000, 30));
        assert_eq!(ptrs(&list), vec![0x3000, 0x1000, 0x2000]);
        assert_eq!(list.total_bytes(), 60);

        assert_eq!(list.remove(a).map(|b| b.ptr), Some(0x3000));
        assert_eq!(ptrs(&list), vec![0x1000, 0x2000]);
        assert_eq!(list.remove(a), None);
        assert_eq!(list.total_bytes(), 50);
    }

    #[test]
    fn slots_are_reused() {
        let mut list = LiveList::new();
        let a = list.push_back(block(0x1000, 1));
        list.remove(a);
        let b = list.push_back(block(0x2000, 1));
        assert_eq!(a, b);
    }

    #[test]
    fn update_keeps_position() {
        let mut list = LiveList::new();
        let _a = list.push_back(block(0x1000, 1));
        let b = list.push_back(block(0x2000, 1));
        let _c = list.push_back(block(0x3000, 1));
        assert!(list.update(b, block(0x9000, 5)));
        assert_eq!(ptrs(&list), vec![0x1000, 0x9000, 0x3000]);
        assert_eq!(list.total_bytes(), 7);
    }

    #[test]
    fn sort_orders_by_address() {
        let mut list = LiveList::new();
        for ptr in [0x5000, 0x1000, 0x4000, 0x2000, 0x3000, 0x1800] {
            list.push_back(block(ptr, 8));
        }
        list.sort_by_address();
        assert_eq!(
            ptrs(&list),
            vec![0x1000, 0x1800, 0x2000, 0x3000, 0x4000, 0x5000]
        );
    }

    #[test]
    fn checkpoint_hides_and_restore_prepends() {
        let mut list = LiveList::new();
        list.push_back(block(0x1000, 8));
        list.push_back(block(0x2000, 8));
        let cp = list.checkpoint();
        assert!(list.is_empty());
        assert_eq!(list.total_blocks(), 2);
        assert!(list.contains(0x2000));

        list.push_back(block(0x3000, 8));
        assert_eq!(ptrs(&list), vec![0x3000]);

        assert!(list.restore(cp));
        assert_eq!(ptrs(&list), vec![0x1000, 0x2000, 0x3000]);
        assert!(!list.restore(cp));
    }

    #[test]
    fn nested_checkpoints_restore_in_any_order() {
        let mut list = LiveList::new();
        list.push_back(block(0x1000, 8));
        let outer = list.checkpoint();
        let b = list.push_back(block(0x2000, 8));
        let inner = list.checkpoint();
        list.push_back(block(0x3000, 8));

        // Freeing a block hidden by a checkpoint unlinks it from that ring.
        assert!(list.remove(b).is_some());

        assert!(list.restore(outer));
        assert_eq!(ptrs(&list), vec![0x1000, 0x3000]);
        assert!(list.restore(inner));
        assert_eq!(ptrs(&list), vec![0x1000, 0x3000]);
    }

    #[test]
    fn foreign_checkpoint_is_rejected() {
        let mut other = LiveList::new();
        other.push_back(block(0x1000, 8));
        let foreign = other.checkpoint();
        let mut list = LiveList::new();
        list.push_back(block(0x1000, 8));
        // Same slot layout as `other`, different id.
        let cp = list.checkpoint();
        assert!(!list.restore(foreign));
        assert!(list.restore(cp));

        let again = list.checkpoint();
        assert_ne!(again, cp);
        assert!(!list.restore(cp));
        assert!(list.restore(again));
    }
}
