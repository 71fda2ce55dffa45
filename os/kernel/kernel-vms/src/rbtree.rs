//! # Region tree
//!
//! A red-black tree of [`VirtualMemoryRegion`]s ordered by address. Nodes
//! live in a `Vec` and link to each other by index; slot 0 is a black
//! sentinel standing in for every missing child (and, during removal, for
//! the parent of a missing child), which keeps the rebalancing code free of
//! special cases.
//!
//! Two regions compare equal when they overlap, so inserting a region that
//! collides with an existing one fails and reports that region instead.
//! Lookups by address test containment.
//!
//! [`NodeId`]s stay valid until their own node is removed; removing other
//! nodes relinks but never moves regions between slots.

use crate::region::{RegionFlags, VirtualMemoryRegion};
use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::MappingPolicy;

const NIL: usize = 0;

/// Handle to a region stored in a [`RegionTree`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct NodeId(usize);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Color {
    Red,
    Black,
}

#[derive(Clone, Debug)]
struct Node {
    region: VirtualMemoryRegion,
    parent: usize,
    left: usize,
    right: usize,
    color: Color,
}

#[derive(Clone, Debug)]
pub struct RegionTree {
    nodes: Vec<Node>,
    vacant: Vec<usize>,
    root: usize,
    len: usize,
}

impl Default for RegionTree {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionTree {
    #[must_use]
    pub fn new() -> Self {
        let sentinel = Node {
            region: VirtualMemoryRegion::new(
                VirtualAddress::zero(),
                0,
                RegionFlags::new(),
                MappingPolicy::Kernel,
            ),
            parent: NIL,
            left: NIL,
            right: NIL,
            color: Color::Black,
        };
        Self {
            nodes: vec![sentinel],
            vacant: Vec::new(),
            root: NIL,
            len: 0,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Make room for `additional` more regions without reallocating.
    pub fn reserve(&mut self, additional: usize) {
        self.nodes
            .reserve(additional.saturating_sub(self.vacant.len()));
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> &VirtualMemoryRegion {
        &self.nodes[id.0].region
    }

    /// Regions may only be resized in ways that keep them ordered and
    /// disjoint from their neighbours.
    pub(crate) fn get_mut(&mut self, id: NodeId) -> &mut VirtualMemoryRegion {
        &mut self.nodes[id.0].region
    }

    /// Insert `region`, or return the node it overlaps.
    ///
    /// # Errors
    /// The id of an existing region overlapping `region`; the tree is
    /// unchanged.
    pub fn insert(&mut self, region: VirtualMemoryRegion) -> Result<NodeId, NodeId> {
        let mut parent = NIL;
        let mut x = self.root;
        let mut go_left = false;
        while x != NIL {
            let existing = &self.nodes[x].region;
            if existing.overlaps(&region) {
                return Err(NodeId(x));
            }
            parent = x;
            go_left = region.begin() < existing.begin();
            x = if go_left { self.left(x) } else { self.right(x) };
        }

        let z = self.alloc(Node {
            region,
            parent,
            left: NIL,
            right: NIL,
            color: Color::Red,
        });
        if parent == NIL {
            self.root = z;
        } else if go_left {
            self.nodes[parent].left = z;
        } else {
            self.nodes[parent].right = z;
        }
        self.len += 1;
        self.insert_fixup(z);
        Ok(NodeId(z))
    }

    /// Unlink the node and return its region. `id` is dead afterwards.
    pub fn remove(&mut self, id: NodeId) -> VirtualMemoryRegion {
        let z = id.0;
        let mut removed_color = self.color(z);
        let x;
        if self.left(z) == NIL {
            x = self.right(z);
            self.transplant(z, x);
        } else if self.right(z) == NIL {
            x = self.left(z);
            self.transplant(z, x);
        } else {
            let y = self.minimum(self.right(z));
            removed_color = self.color(y);
            x = self.right(y);
            if self.parent(y) == z {
                self.nodes[x].parent = y;
            } else {
                self.transplant(y, x);
                self.nodes[y].right = self.right(z);
                let r = self.right(y);
                self.nodes[r].parent = y;
            }
            self.transplant(z, y);
            self.nodes[y].left = self.left(z);
            let l = self.left(y);
            self.nodes[l].parent = y;
            self.nodes[y].color = self.color(z);
        }
        if removed_color == Color::Black {
            self.delete_fixup(x);
        }

        self.nodes[NIL].parent = NIL;
        self.nodes[NIL].color = Color::Black;
        self.vacant.push(z);
        self.len -= 1;
        self.nodes[z].region
    }

    /// The region containing `addr`.
    #[must_use]
    pub fn search(&self, addr: VirtualAddress) -> Option<NodeId> {
        let mut x = self.root;
        while x != NIL {
            let region = &self.nodes[x].region;
            if region.contains(addr) {
                return Some(NodeId(x));
            }
            x = if addr < region.begin() {
                self.left(x)
            } else {
                self.right(x)
            };
        }
        None
    }

    /// The first region ending after `addr`: the one containing it, or the
    /// next one above it.
    #[must_use]
    pub fn lower_bound(&self, addr: VirtualAddress) -> Option<NodeId> {
        let mut x = self.root;
        let mut found = NIL;
        while x != NIL {
            if self.nodes[x].region.end() > addr {
                found = x;
                x = self.left(x);
            } else {
                x = self.right(x);
            }
        }
        Self::some(found)
    }

    #[must_use]
    pub fn first(&self) -> Option<NodeId> {
        Self::some(self.minimum(self.root))
    }

    #[must_use]
    pub fn last(&self) -> Option<NodeId> {
        Self::some(self.maximum(self.root))
    }

    #[must_use]
    pub fn successor(&self, id: NodeId) -> Option<NodeId> {
        let mut x = id.0;
        if self.right(x) != NIL {
            return Self::some(self.minimum(self.right(x)));
        }
        let mut y = self.parent(x);
        while y != NIL && x == self.right(y) {
            x = y;
            y = self.parent(y);
        }
        Self::some(y)
    }

    #[must_use]
    pub fn predecessor(&self, id: NodeId) -> Option<NodeId> {
        let mut x = id.0;
        if self.left(x) != NIL {
            return Self::some(self.maximum(self.left(x)));
        }
        let mut y = self.parent(x);
        while y != NIL && x == self.left(y) {
            x = y;
            y = self.parent(y);
        }
        Self::some(y)
    }

    /// Regions in address order.
    #[must_use]
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            tree: self,
            next: self.first(),
        }
    }

    fn some(x: usize) -> Option<NodeId> {
        (x != NIL).then_some(NodeId(x))
    }

    fn alloc(&mut self, node: Node) -> usize {
        if let Some(slot) = self.vacant.pop() {
            self.nodes[slot] = node;
            slot
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }

    fn parent(&self, x: usize) -> usize {
        self.nodes[x].parent
    }

    fn left(&self, x: usize) -> usize {
        self.nodes[x].left
    }

    fn right(&self, x: usize) -> usize {
        self.nodes[x].right
    }

    fn color(&self, x: usize) -> Color {
        self.nodes[x].color
    }

    fn paint(&mut self, x: usize, color: Color) {
        self.nodes[x].color = color;
    }

    fn minimum(&self, mut x: usize) -> usize {
        if x == NIL {
            return NIL;
        }
        while self.left(x) != NIL {
            x = self.left(x);
        }
        x
    }

    fn maximum(&self, mut x: usize) -> usize {
        if x == NIL {
            return NIL;
        }
        while self.right(x) != NIL {
            x = self.right(x);
        }
        x
    }

    /// Put `v` where `u` hangs. `v` may be the sentinel.
    fn transplant(&mut self, u: usize, v: usize) {
        let p = self.parent(u);
        if p == NIL {
            self.root = v;
        } else if u == self.left(p) {
            self.nodes[p].left = v;
        } else {
            self.nodes[p].right = v;
        }
        self.nodes[v].parent = p;
    }

    fn rotate_left(&mut self, x: usize) {
        let y = self.right(x);
        let inner = self.left(y);
        self.nodes[x].right = inner;
        if inner != NIL {
            self.nodes[inner].parent = x;
        }
        self.transplant(x, y);
        self.nodes[y].left = x;
        self.nodes[x].parent = y;
    }

    fn rotate_right(&mut self, x: usize) {
        let y = self.left(x);
        let inner = self.right(y);
        self.nodes[x].left = inner;
        if inner != NIL {
            self.nodes[inner].parent = x;
        }
        self.transplant(x, y);
        self.nodes[y].right = x;
        self.nodes[x].parent = y;
    }

    fn insert_fixup(&mut self, mut z: usize) {
        while self.color(self.parent(z)) == Color::Red {
            let p = self.parent(z);
            let g = self.parent(p);
            if p == self.left(g) {
                let uncle = self.right(g);
                if self.color(uncle) == Color::Red {
                    self.paint(p, Color::Black);
                    self.paint(uncle, Color::Black);
                    self.paint(g, Color::Red);
                    z = g;
                } else {
                    if z == self.right(p) {
                        z = p;
                        self.rotate_left(z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.paint(p, Color::Black);
                    self.paint(g, Color::Red);
                    self.rotate_right(g);
                }
            } else {
                let uncle = self.left(g);
                if self.color(uncle) == Color::Red {
                    self.paint(p, Color::Black);
                    self.paint(uncle, Color::Black);
                    self.paint(g, Color::Red);
                    z = g;
                } else {
                    if z == self.left(p) {
                        z = p;
                        self.rotate_right(z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.paint(p, Color::Black);
                    self.paint(g, Color::Red);
                    self.rotate_left(g);
                }
            }
        }
        let root = self.root;
        self.paint(root, Color::Black);
    }

    fn delete_fixup(&mut self, mut x: usize) {
        while x != self.root && self.color(x) == Color::Black {
            let p = self.parent(x);
            if x == self.left(p) {
                let mut w = self.right(p);
                if self.color(w) == Color::Red {
                    self.paint(w, Color::Black);
                    self.paint(p, Color::Red);
                    self.rotate_left(p);
                    w = self.right(self.parent(x));
                }
                if self.color(self.left(w)) == Color::Black
                    && self.color(self.right(w)) == Color::Black
                {
                    self.paint(w, Color::Red);
                    x = self.parent(x);
                } else {
                    if self.color(self.right(w)) == Color::Black {
                        let inner = self.left(w);
                        self.paint(inner, Color::Black);
                        self.paint(w, Color::Red);
                        self.rotate_right(w);
                        w = self.right(self.parent(x));
                    }
                    let p = self.parent(x);
                    self.paint(w, self.color(p));
                    self.paint(p, Color::Black);
                    let outer = self.right(w);
                    self.paint(outer, Color::Black);
                    self.rotate_left(p);
                    x = self.root;
                }
            } else {
                let mut w = self.left(p);
                if self.color(w) == Color::Red {
                    self.paint(w, Color::Black);
                    self.paint(p, Color::Red);
                    self.rotate_right(p);
                    w = self.left(self.parent(x));
                }
                if self.color(self.right(w)) == Color::Black
                    && self.color(self.left(w)) == Color::Black
                {
                    self.paint(w, Color::Red);
                    x = self.parent(x);
                } else {
                    if self.color(self.left(w)) == Color::Black {
                        let inner = self.right(w);
                        self.paint(inner, Color::Black);
                        self.paint(w, Color::Red);
                        self.rotate_left(w);
                        w = self.left(self.parent(x));
                    }
                    let p = self.parent(x);
                    self.paint(w, self.color(p));
                    self.paint(p, Color::Black);
                    let outer = self.left(w);
                    self.paint(outer, Color::Black);
                    self.rotate_right(p);
                    x = self.root;
                }
            }
        }
        self.paint(x, Color::Black);
    }
}

/// In-order iterator over a [`RegionTree`].
pub struct Iter<'a> {
    tree: &'a RegionTree,
    next: Option<NodeId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a VirtualMemoryRegion;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        self.next = self.tree.successor(id);
        Some(self.tree.get(id))
    }
}

impl<'a> IntoIterator for &'a RegionTree {
    type Item = &'a VirtualMemoryRegion;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 0x1000;

    fn region(page: u64, pages: u64) -> VirtualMemoryRegion {
        VirtualMemoryRegion::new(
            VirtualAddress::new(page * PAGE),
            pages * PAGE,
            RegionFlags::USER_DATA,
            MappingPolicy::LazyAnonymous,
        )
    }

    impl RegionTree {
        /// Checks every red-black and ordering invariant, returning the
        /// black height.
        fn check(&self) -> usize {
            assert_eq!(self.color(NIL), Color::Black);
            assert_eq!(self.color(self.root), Color::Black);
            if self.root != NIL {
                assert_eq!(self.parent(self.root), NIL);
            }
            let height = self.check_node(self.root);

            let regions: Vec<_> = self.iter().copied().collect();
            assert_eq!(regions.len(), self.len);
            for pair in regions.windows(2) {
                assert!(pair[0].end() <= pair[1].begin(), "{pair:?} out of order");
            }
            height
        }

        fn check_node(&self, x: usize) -> usize {
            if x == NIL {
                return 1;
            }
            for child in [self.left(x), self.right(x)] {
                if child != NIL {
                    assert_eq!(self.parent(child), x);
                }
                if self.color(x) == Color::Red {
                    assert_eq!(self.color(child), Color::Black, "red node {x} has a red child");
                }
            }
            let l = self.check_node(self.left(x));
            let r = self.check_node(self.right(x));
            assert_eq!(l, r, "black heights differ below {x}");
            l + usize::from(self.color(x) == Color::Black)
        }
    }

    /// Deterministic scatter of page numbers.
    fn scrambled(n: u64) -> impl Iterator<Item = u64> {
        (0..n).map(move |i| (i * 7919) % n)
    }

    #[test]
    fn overlapping_insert_reports_the_existing_region() {
        let mut t = RegionTree::new();
        let a = t.insert(region(10, 5)).unwrap();
        t.insert(region(20, 5)).unwrap();

        assert_eq!(t.insert(region(14, 2)), Err(a));
        assert_eq!(t.insert(region(8, 3)), Err(a));
        assert_eq!(t.len(), 2);
        t.insert(region(15, 5)).unwrap();
        t.check();
    }

    #[test]
    fn search_and_bounds() {
        let mut t = RegionTree::new();
        for page in [40, 10, 30, 20] {
            t.insert(region(page, 2)).unwrap();
        }
        let at = |p: u64| VirtualAddress::new(p * PAGE);

        let hit = t.search(at(31) + 0x10).unwrap();
        assert_eq!(t.get(hit).begin(), at(30));
        assert_eq!(t.search(at(32)), None);

        assert_eq!(t.get(t.lower_bound(at(12)).unwrap()).begin(), at(20));
        assert_eq!(t.get(t.lower_bound(at(11)).unwrap()).begin(), at(10));
        assert_eq!(t.lower_bound(at(42)), None);

        let first = t.first().unwrap();
        let last = t.last().unwrap();
        assert_eq!(t.get(first).begin(), at(10));
        assert_eq!(t.get(last).begin(), at(40));
        assert_eq!(t.predecessor(first), None);
        assert_eq!(t.successor(last), None);
        assert_eq!(t.get(t.successor(first).unwrap()).begin(), at(20));
        assert_eq!(t.get(t.predecessor(last).unwrap()).begin(), at(30));
    }

    #[test]
    fn stays_balanced_through_inserts_and_removes() {
        let mut t = RegionTree::new();
        let mut ids = Vec::new();
        for page in scrambled(500) {
            ids.push((page, t.insert(region(page * 2, 1)).unwrap()));
        }
        let height = t.check();
        // a red-black tree of n nodes has black height at most log2(n + 1) + 1
        assert!(height <= 10);

        // remove every third region, in insertion order
        for (page, id) in ids.iter().step_by(3) {
            assert_eq!(t.remove(*id).begin(), VirtualAddress::new(page * 2 * PAGE));
            t.check();
        }
        assert_eq!(t.len(), 500 - 167);

        // surviving handles still resolve to their own regions
        for (page, id) in ids.iter().skip(1).step_by(3) {
            assert_eq!(t.get(*id).begin(), VirtualAddress::new(page * 2 * PAGE));
        }

        // freed slots are reused
        let slots = t.nodes.len();
        for page in 0..100 {
            t.insert(region(page * 2 + 1, 1)).unwrap();
        }
        assert_eq!(t.nodes.len(), slots);
        t.check();

        while let Some(id) = t.first() {
            t.remove(id);
        }
        assert!(t.is_empty());
        t.check();
    }
}
