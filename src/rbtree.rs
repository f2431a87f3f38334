//! Arena-backed red-black trees.
//!
//! Nodes live in a caller-owned slice and are named by their index. Each node
//! embeds one [`RbLink`] per tree it can belong to, so a single node can be a
//! member of several trees at once; a [`RbTree`] is told which link slot it
//! owns when it is created. The interval allocator uses this to index the same
//! free extents by address and by size without a second allocation per extent.

use core::cmp::Ordering;

/// Index of a node in its arena.
pub type NodeId = u32;

/// The "no node" sentinel.
pub const NIL: NodeId = NodeId::MAX;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

/// Tree links embedded in a node.
#[derive(Copy, Clone, Debug)]
pub struct RbLink {
    parent: NodeId,
    left: NodeId,
    right: NodeId,
    color: Color,
}

impl RbLink {
    /// Links of a node not in any tree.
    pub const UNLINKED: RbLink = RbLink {
        parent: NIL,
        left: NIL,
        right: NIL,
        color: Color::Black,
    };
}

impl Default for RbLink {
    fn default() -> Self {
        RbLink::UNLINKED
    }
}

/// Nodes which can be linked into trees.
pub trait RbNode {
    /// Returns the links for tree slot `slot`.
    fn link(&self, slot: usize) -> &RbLink;

    /// Returns the links for tree slot `slot`, mutably.
    fn link_mut(&mut self, slot: usize) -> &mut RbLink;
}

/// Which way [`RbTree::walk`] goes from the current node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Descend into the left subtree.
    Left,
    /// Descend into the right subtree.
    Right,
    /// End the walk here.
    Stop,
}

/// A red-black tree over nodes in an arena.
pub struct RbTree<N> {
    root: NodeId,
    slot: usize,
    len: usize,
    order: fn(&N, &N) -> Ordering,
}

impl<N> core::fmt::Debug for RbTree<N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RbTree")
            .field("root", &self.root)
            .field("slot", &self.slot)
            .field("len", &self.len)
            .finish()
    }
}

impl<N: RbNode> RbTree<N> {
    /// Creates an empty tree which links nodes through slot `slot` and orders
    /// them with `order`.
    ///
    /// `order` must never report two distinct nodes of the tree as equal.
    pub const fn new(slot: usize, order: fn(&N, &N) -> Ordering) -> RbTree<N> {
        RbTree {
            root: NIL,
            slot,
            len: 0,
            order,
        }
    }

    /// Returns the number of nodes in the tree.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether the tree has no nodes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root == NIL
    }

    /// Returns the root node, or [`NIL`] if the tree is empty.
    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    // Link accessors ==========================================================

    #[inline]
    fn links(&self, arena: &[N], n: NodeId) -> RbLink {
        *arena[n as usize].link(self.slot)
    }

    #[inline]
    fn links_mut<'a>(&self, arena: &'a mut [N], n: NodeId) -> &'a mut RbLink {
        arena[n as usize].link_mut(self.slot)
    }

    #[inline]
    fn parent(&self, arena: &[N], n: NodeId) -> NodeId {
        self.links(arena, n).parent
    }

    #[inline]
    fn left(&self, arena: &[N], n: NodeId) -> NodeId {
        self.links(arena, n).left
    }

    #[inline]
    fn right(&self, arena: &[N], n: NodeId) -> NodeId {
        self.links(arena, n).right
    }

    #[inline]
    fn color(&self, arena: &[N], n: NodeId) -> Color {
        match n {
            NIL => Color::Black,
            n => self.links(arena, n).color,
        }
    }

    #[inline]
    fn set_parent(&self, arena: &mut [N], n: NodeId, parent: NodeId) {
        if n != NIL {
            self.links_mut(arena, n).parent = parent;
        }
    }

    #[inline]
    fn set_left(&self, arena: &mut [N], n: NodeId, left: NodeId) {
        self.links_mut(arena, n).left = left;
    }

    #[inline]
    fn set_right(&self, arena: &mut [N], n: NodeId, right: NodeId) {
        self.links_mut(arena, n).right = right;
    }

    #[inline]
    fn set_color(&self, arena: &mut [N], n: NodeId, color: Color) {
        if n != NIL {
            self.links_mut(arena, n).color = color;
        }
    }

    // Navigation ==============================================================

    fn minimum(&self, arena: &[N], mut n: NodeId) -> NodeId {
        while self.left(arena, n) != NIL {
            n = self.left(arena, n);
        }
        n
    }

    fn maximum(&self, arena: &[N], mut n: NodeId) -> NodeId {
        while self.right(arena, n) != NIL {
            n = self.right(arena, n);
        }
        n
    }

    /// Returns the first node in tree order, or [`NIL`].
    pub fn first(&self, arena: &[N]) -> NodeId {
        match self.root {
            NIL => NIL,
            root => self.minimum(arena, root),
        }
    }

    /// Returns the last node in tree order, or [`NIL`].
    pub fn last(&self, arena: &[N]) -> NodeId {
        match self.root {
            NIL => NIL,
            root => self.maximum(arena, root),
        }
    }

    /// Returns the node after `n` in tree order, or [`NIL`].
    pub fn next(&self, arena: &[N], n: NodeId) -> NodeId {
        let right = self.right(arena, n);
        if right != NIL {
            return self.minimum(arena, right);
        }

        let mut n = n;
        let mut p = self.parent(arena, n);
        while p != NIL && n == self.right(arena, p) {
            n = p;
            p = self.parent(arena, p);
        }
        p
    }

    /// Returns the node before `n` in tree order, or [`NIL`].
    pub fn prev(&self, arena: &[N], n: NodeId) -> NodeId {
        let left = self.left(arena, n);
        if left != NIL {
            return self.maximum(arena, left);
        }

        let mut n = n;
        let mut p = self.parent(arena, n);
        while p != NIL && n == self.left(arena, p) {
            n = p;
            p = self.parent(arena, p);
        }
        p
    }

    /// Iterates over the tree in order.
    pub fn iter<'a>(&'a self, arena: &'a [N]) -> impl Iterator<Item = NodeId> + 'a {
        let mut cur = self.first(arena);
        core::iter::from_fn(move || {
            if cur == NIL {
                return None;
            }
            let n = cur;
            cur = self.next(arena, n);
            Some(n)
        })
    }

    /// Returns the last node for which `pred` holds.
    ///
    /// `pred` must be monotone over tree order: true for a (possibly empty)
    /// prefix of the nodes and false for the rest.
    pub fn rfind(&self, arena: &[N], mut pred: impl FnMut(&N) -> bool) -> NodeId {
        let mut best = NIL;
        let mut cur = self.root;
        while cur != NIL {
            if pred(&arena[cur as usize]) {
                best = cur;
                cur = self.right(arena, cur);
            } else {
                cur = self.left(arena, cur);
            }
        }
        best
    }

    /// Walks down from the root, letting `step` pick a direction at each
    /// node. Stops at a leaf or when `step` returns [`Step::Stop`].
    pub fn walk(&self, arena: &[N], mut step: impl FnMut(NodeId, &N) -> Step) {
        let mut cur = self.root;
        while cur != NIL {
            cur = match step(cur, &arena[cur as usize]) {
                Step::Left => self.left(arena, cur),
                Step::Right => self.right(arena, cur),
                Step::Stop => return,
            };
        }
    }

    // Mutation ================================================================

    fn rotate_left(&mut self, arena: &mut [N], x: NodeId) {
        let y = self.right(arena, x);
        let y_left = self.left(arena, y);

        self.set_right(arena, x, y_left);
        self.set_parent(arena, y_left, x);

        let xp = self.parent(arena, x);
        self.set_parent(arena, y, xp);
        if xp == NIL {
            self.root = y;
        } else if x == self.left(arena, xp) {
            self.set_left(arena, xp, y);
        } else {
            self.set_right(arena, xp, y);
        }

        self.set_left(arena, y, x);
        self.set_parent(arena, x, y);
    }

    fn rotate_right(&mut self, arena: &mut [N], x: NodeId) {
        let y = self.left(arena, x);
        let y_right = self.right(arena, y);

        self.set_left(arena, x, y_right);
        self.set_parent(arena, y_right, x);

        let xp = self.parent(arena, x);
        self.set_parent(arena, y, xp);
        if xp == NIL {
            self.root = y;
        } else if x == self.right(arena, xp) {
            self.set_right(arena, xp, y);
        } else {
            self.set_left(arena, xp, y);
        }

        self.set_right(arena, y, x);
        self.set_parent(arena, x, y);
    }

    /// Links `z` into the tree.
    pub fn insert(&mut self, arena: &mut [N], z: NodeId) {
        let mut parent = NIL;
        let mut cur = self.root;
        let mut go_left = false;

        while cur != NIL {
            parent = cur;
            let ord = (self.order)(&arena[z as usize], &arena[cur as usize]);
            debug_assert_ne!(ord, Ordering::Equal, "duplicate key in tree");
            go_left = ord == Ordering::Less;
            cur = if go_left {
                self.left(arena, cur)
            } else {
                self.right(arena, cur)
            };
        }

        *self.links_mut(arena, z) = RbLink {
            parent,
            left: NIL,
            right: NIL,
            color: Color::Red,
        };

        if parent == NIL {
            self.root = z;
        } else if go_left {
            self.set_left(arena, parent, z);
        } else {
            self.set_right(arena, parent, z);
        }

        self.len += 1;
        self.insert_fixup(arena, z);
    }

    fn insert_fixup(&mut self, arena: &mut [N], mut z: NodeId) {
        while self.color(arena, self.parent(arena, z)) == Color::Red {
            let mut p = self.parent(arena, z);
            // A red parent is never the root, so the grandparent exists.
            let g = self.parent(arena, p);

            if p == self.left(arena, g) {
                let uncle = self.right(arena, g);
                if self.color(arena, uncle) == Color::Red {
                    self.set_color(arena, p, Color::Black);
                    self.set_color(arena, uncle, Color::Black);
                    self.set_color(arena, g, Color::Red);
                    z = g;
                    continue;
                }

                if z == self.right(arena, p) {
                    z = p;
                    self.rotate_left(arena, z);
                    p = self.parent(arena, z);
                }

                self.set_color(arena, p, Color::Black);
                self.set_color(arena, g, Color::Red);
                self.rotate_right(arena, g);
            } else {
                let uncle = self.left(arena, g);
                if self.color(arena, uncle) == Color::Red {
                    self.set_color(arena, p, Color::Black);
                    self.set_color(arena, uncle, Color::Black);
                    self.set_color(arena, g, Color::Red);
                    z = g;
                    continue;
                }

                if z == self.left(arena, p) {
                    z = p;
                    self.rotate_right(arena, z);
                    p = self.parent(arena, z);
                }

                self.set_color(arena, p, Color::Black);
                self.set_color(arena, g, Color::Red);
                self.rotate_left(arena, g);
            }
        }

        let root = self.root;
        self.set_color(arena, root, Color::Black);
    }

    /// Replaces the subtree rooted at `u` with the one rooted at `v`.
    fn transplant(&mut self, arena: &mut [N], u: NodeId, v: NodeId) {
        let up = self.parent(arena, u);
        if up == NIL {
            self.root = v;
        } else if u == self.left(arena, up) {
            self.set_left(arena, up, v);
        } else {
            self.set_right(arena, up, v);
        }
        self.set_parent(arena, v, up);
    }

    /// Unlinks `z` from the tree.
    pub fn remove(&mut self, arena: &mut [N], z: NodeId) {
        let z_links = self.links(arena, z);
        let mut removed_color = z_links.color;
        let x;
        let x_parent;

        if z_links.left == NIL {
            x = z_links.right;
            x_parent = z_links.parent;
            self.transplant(arena, z, z_links.right);
        } else if z_links.right == NIL {
            x = z_links.left;
            x_parent = z_links.parent;
            self.transplant(arena, z, z_links.left);
        } else {
            let y = self.minimum(arena, z_links.right);
            removed_color = self.color(arena, y);
            x = self.right(arena, y);

            if self.parent(arena, y) == z {
                x_parent = y;
            } else {
                x_parent = self.parent(arena, y);
                self.transplant(arena, y, x);
                let zr = self.right(arena, z);
                self.set_right(arena, y, zr);
                self.set_parent(arena, zr, y);
            }

            self.transplant(arena, z, y);
            let zl = self.left(arena, z);
            self.set_left(arena, y, zl);
            self.set_parent(arena, zl, y);
            self.set_color(arena, y, z_links.color);
        }

        if removed_color == Color::Black {
            self.remove_fixup(arena, x, x_parent);
        }

        *self.links_mut(arena, z) = RbLink::UNLINKED;
        self.len -= 1;
    }

    fn remove_fixup(&mut self, arena: &mut [N], mut x: NodeId, mut xp: NodeId) {
        while x != self.root && self.color(arena, x) == Color::Black {
            if x == self.left(arena, xp) {
                let mut w = self.right(arena, xp);
                if self.color(arena, w) == Color::Red {
                    self.set_color(arena, w, Color::Black);
                    self.set_color(arena, xp, Color::Red);
                    self.rotate_left(arena, xp);
                    w = self.right(arena, xp);
                }

                if self.color(arena, self.left(arena, w)) == Color::Black
                    && self.color(arena, self.right(arena, w)) == Color::Black
                {
                    self.set_color(arena, w, Color::Red);
                    x = xp;
                    xp = self.parent(arena, x);
                } else {
                    if self.color(arena, self.right(arena, w)) == Color::Black {
                        let wl = self.left(arena, w);
                        self.set_color(arena, wl, Color::Black);
                        self.set_color(arena, w, Color::Red);
                        self.rotate_right(arena, w);
                        w = self.right(arena, xp);
                    }

                    let xp_color = self.color(arena, xp);
                    self.set_color(arena, w, xp_color);
                    self.set_color(arena, xp, Color::Black);
                    let wr = self.right(arena, w);
                    self.set_color(arena, wr, Color::Black);
                    self.rotate_left(arena, xp);
                    x = self.root;
                }
            } else {
                let mut w = self.left(arena, xp);
                if self.color(arena, w) == Color::Red {
                    self.set_color(arena, w, Color::Black);
                    self.set_color(arena, xp, Color::Red);
                    self.rotate_right(arena, xp);
                    w = self.left(arena, xp);
                }

                if self.color(arena, self.right(arena, w)) == Color::Black
                    && self.color(arena, self.left(arena, w)) == Color::Black
                {
                    self.set_color(arena, w, Color::Red);
                    x = xp;
                    xp = self.parent(arena, x);
                } else {
                    if self.color(arena, self.left(arena, w)) == Color::Black {
                        let wr = self.right(arena, w);
                        self.set_color(arena, wr, Color::Black);
                        self.set_color(arena, w, Color::Red);
                        self.rotate_left(arena, w);
                        w = self.left(arena, xp);
                    }

                    let xp_color = self.color(arena, xp);
                    self.set_color(arena, w, xp_color);
                    self.set_color(arena, xp, Color::Black);
                    let wl = self.left(arena, w);
                    self.set_color(arena, wl, Color::Black);
                    self.rotate_right(arena, xp);
                    x = self.root;
                }
            }
        }

        self.set_color(arena, x, Color::Black);
    }

    /// Checks ordering, coloring and parent links, returning the black
    /// height.
    ///
    /// # Panics
    ///
    /// Panics if the tree is malformed.
    #[cfg(test)]
    pub fn validate(&self, arena: &[N]) -> usize {
        fn check<N: RbNode>(tree: &RbTree<N>, arena: &[N], n: NodeId, parent: NodeId) -> usize {
            if n == NIL {
                return 1;
            }

            let l = tree.links(arena, n);
            assert_eq!(l.parent, parent, "bad parent link at {n}");

            if l.color == Color::Red {
                assert_eq!(tree.color(arena, l.left), Color::Black, "red-red at {n}");
                assert_eq!(tree.color(arena, l.right), Color::Black, "red-red at {n}");
            }

            if l.left != NIL {
                assert_eq!(
                    (tree.order)(&arena[l.left as usize], &arena[n as usize]),
                    Ordering::Less
                );
            }
            if l.right != NIL {
                assert_eq!(
                    (tree.order)(&arena[l.right as usize], &arena[n as usize]),
                    Ordering::Greater
                );
            }

            let lh = check(tree, arena, l.left, n);
            let rh = check(tree, arena, l.right, n);
            assert_eq!(lh, rh, "unequal black height at {n}");

            lh + usize::from(l.color == Color::Black)
        }

        assert_eq!(self.color(arena, self.root), Color::Black);
        assert_eq!(self.iter(arena).count(), self.len);
        check(self, arena, self.root, NIL)
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use quickcheck::QuickCheck;

    use super::*;

    struct Node {
        key: u32,
        links: [RbLink; 2],
    }

    impl RbNode for Node {
        fn link(&self, slot: usize) -> &RbLink {
            &self.links[slot]
        }

        fn link_mut(&mut self, slot: usize) -> &mut RbLink {
            &mut self.links[slot]
        }
    }

    fn ascending(a: &Node, b: &Node) -> Ordering {
        a.key.cmp(&b.key)
    }

    fn descending(a: &Node, b: &Node) -> Ordering {
        b.key.cmp(&a.key)
    }

    fn arena(keys: &[u32]) -> Vec<Node> {
        keys.iter()
            .map(|&key| Node {
                key,
                links: [RbLink::UNLINKED; 2],
            })
            .collect()
    }

    #[test]
    fn two_orders_over_one_arena() {
        let mut nodes = arena(&[5, 1, 9, 3, 7]);
        let mut up = RbTree::new(0, ascending);
        let mut down = RbTree::new(1, descending);

        for id in 0..nodes.len() as NodeId {
            up.insert(&mut nodes, id);
            down.insert(&mut nodes, id);
        }

        let keys = |t: &RbTree<Node>, nodes: &[Node]| {
            t.iter(nodes).map(|n| nodes[n as usize].key).collect::<Vec<_>>()
        };
        assert_eq!(keys(&up, &nodes), [1, 3, 5, 7, 9]);
        assert_eq!(keys(&down, &nodes), [9, 7, 5, 3, 1]);

        up.remove(&mut nodes, 0);
        assert_eq!(keys(&up, &nodes), [1, 3, 7, 9]);
        assert_eq!(keys(&down, &nodes), [9, 7, 5, 3, 1]);

        up.validate(&nodes);
        down.validate(&nodes);
    }

    #[test]
    fn neighbours_and_rfind() {
        let mut nodes = arena(&[10, 20, 30, 40]);
        let mut t = RbTree::new(0, ascending);
        for id in 0..4 {
            t.insert(&mut nodes, id);
        }

        assert_eq!(t.first(&nodes), 0);
        assert_eq!(t.last(&nodes), 3);
        assert_eq!(t.next(&nodes, 1), 2);
        assert_eq!(t.prev(&nodes, 1), 0);
        assert_eq!(t.prev(&nodes, 0), NIL);
        assert_eq!(t.next(&nodes, 3), NIL);

        assert_eq!(t.rfind(&nodes, |n| n.key <= 25), 1);
        assert_eq!(t.rfind(&nodes, |n| n.key <= 5), NIL);
        assert_eq!(t.rfind(&nodes, |n| n.key <= 99), 3);
    }

    #[test]
    fn random_insert_remove_stays_balanced() {
        fn prop(keys: Vec<u16>, removals: Vec<usize>) -> bool {
            let mut keys: Vec<u32> = keys.into_iter().map(u32::from).collect();
            keys.sort_unstable();
            keys.dedup();

            let mut nodes = arena(&keys);
            // Insert in an interleaved order to exercise both rotations.
            let mut t = RbTree::new(0, ascending);
            let n = nodes.len() as NodeId;
            for id in (0..n).step_by(2).chain((1..n).step_by(2)) {
                t.insert(&mut nodes, id);
            }
            t.validate(&nodes);

            let mut live: Vec<NodeId> = (0..n).collect();
            for r in removals {
                if live.is_empty() {
                    break;
                }
                let id = live.swap_remove(r % live.len());
                t.remove(&mut nodes, id);
                t.validate(&nodes);
            }

            let mut expect: Vec<u32> = live.iter().map(|&id| nodes[id as usize].key).collect();
            expect.sort_unstable();
            let got: Vec<u32> = t.iter(&nodes).map(|id| nodes[id as usize].key).collect();

            got == expect
        }

        QuickCheck::new()
            .tests(200)
            .quickcheck(prop as fn(Vec<u16>, Vec<usize>) -> bool);
    }
}
