use alloc::vec::Vec;
use core::cmp::Ordering;

/// Handle to a node in an [`OrderedIndex`]. Only meaningful for the index
/// that returned it, and only until that node is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

#[derive(Debug)]
struct Node<V> {
    key: u32,
    value: V,
    color: Color,
    parent: Option<usize>,
    left: Option<usize>,
    right: Option<usize>,
}

/// A red-black tree keyed by `u32`, with the leftmost and rightmost nodes
/// cached so `first` and `last` are O(1).
#[derive(Debug)]
pub struct OrderedIndex<V> {
    slots: Vec<Option<Node<V>>>,
    free_slots: Vec<usize>,
    root: Option<usize>,
    leftmost: Option<usize>,
    rightmost: Option<usize>,
    len: usize,
}

impl<V> OrderedIndex<V> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            root: None,
            leftmost: None,
            rightmost: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free_slots.clear();
        self.root = None;
        self.leftmost = None;
        self.rightmost = None;
        self.len = 0;
    }

    pub fn key(&self, id: NodeId) -> u32 {
        self.node(id.0).key
    }

    pub fn value(&self, id: NodeId) -> &V {
        &self.node(id.0).value
    }

    pub fn value_mut(&mut self, id: NodeId) -> &mut V {
        &mut self.node_mut(id.0).value
    }

    /// Smallest key in the index.
    pub fn first(&self) -> Option<NodeId> {
        self.leftmost.map(NodeId)
    }

    /// Largest key in the index.
    pub fn last(&self) -> Option<NodeId> {
        self.rightmost.map(NodeId)
    }

    /// Inserts `value` under `key` and returns its handle.
    pub fn insert(&mut self, key: u32, value: V) -> NodeId {
        let mut parent = None;
        let mut current = self.root;
        let mut went_left = false;
        let mut is_leftmost = true;
        let mut is_rightmost = true;

        while let Some(index) = current {
            parent = Some(index);
            let node = self.node(index);
            if key < node.key {
                went_left = true;
                is_rightmost = false;
                current = node.left;
            } else {
                went_left = false;
                is_leftmost = false;
                current = node.right;
            }
        }

        let new = self.alloc_slot(Node {
            key,
            value,
            color: Color::Red,
            parent,
            left: None,
            right: None,
        });

        match parent {
            None => self.root = Some(new),
            Some(p) if went_left => self.node_mut(p).left = Some(new),
            Some(p) => self.node_mut(p).right = Some(new),
        }
        if is_leftmost {
            self.leftmost = Some(new);
        }
        if is_rightmost {
            self.rightmost = Some(new);
        }
        self.len += 1;

        self.insert_fixup(new);
        NodeId(new)
    }

    /// Removes the node and returns its value. Panics if `id` is stale.
    pub fn remove(&mut self, id: NodeId) -> V {
        let z = id.0;
        assert!(
            self.slots.get(z).is_some_and(Option::is_some),
            "removing a node that is not in the index"
        );

        if self.leftmost == Some(z) {
            self.leftmost = self.successor_index(z);
        }
        if self.rightmost == Some(z) {
            self.rightmost = self.predecessor_index(z);
        }

        let (z_left, z_right, z_color) = {
            let node = self.node(z);
            (node.left, node.right, node.color)
        };

        let removed_color;
        let x;
        let x_parent;

        match (z_left, z_right) {
            (None, _) => {
                removed_color = z_color;
                x = z_right;
                x_parent = self.node(z).parent;
                self.transplant(z, z_right);
            }
            (_, None) => {
                removed_color = z_color;
                x = z_left;
                x_parent = self.node(z).parent;
                self.transplant(z, z_left);
            }
            (Some(left), Some(right)) => {
                let y = self.minimum(right);
                removed_color = self.node(y).color;
                x = self.node(y).right;

                if self.node(y).parent == Some(z) {
                    x_parent = Some(y);
                } else {
                    x_parent = self.node(y).parent;
                    self.transplant(y, x);
                    self.node_mut(y).right = Some(right);
                    self.node_mut(right).parent = Some(y);
                }

                self.transplant(z, Some(y));
                self.node_mut(y).left = Some(left);
                self.node_mut(left).parent = Some(y);
                self.node_mut(y).color = z_color;
            }
        }

        if removed_color == Color::Black {
            self.delete_fixup(x, x_parent);
        }

        self.len -= 1;
        self.free_slot(z)
    }

    /// Finds the first (in key order) node whose key equals `key`.
    pub fn get(&self, key: u32) -> Option<NodeId> {
        let mut current = self.root;
        let mut found = None;
        while let Some(index) = current {
            let node = self.node(index);
            match key.cmp(&node.key) {
                Ordering::Less => current = node.left,
                Ordering::Greater => current = node.right,
                Ordering::Equal => {
                    found = Some(index);
                    current = node.left;
                }
            }
        }
        found.map(NodeId)
    }

    /// Descends the tree with a caller-supplied comparator. `f` returns how
    /// the target compares to the given node: `Less` to go left, `Greater` to
    /// go right, `Equal` to stop.
    pub fn find_by<F>(&self, mut f: F) -> Option<NodeId>
    where
        F: FnMut(u32, &V) -> Ordering,
    {
        let mut current = self.root;
        while let Some(index) = current {
            let node = self.node(index);
            match f(node.key, &node.value) {
                Ordering::Less => current = node.left,
                Ordering::Greater => current = node.right,
                Ordering::Equal => return Some(NodeId(index)),
            }
        }
        None
    }

    /// The first node whose key is `>= key`.
    pub fn ceiling(&self, key: u32) -> Option<NodeId> {
        let mut current = self.root;
        let mut best = None;
        while let Some(index) = current {
            let node = self.node(index);
            if node.key >= key {
                best = Some(index);
                current = node.left;
            } else {
                current = node.right;
            }
        }
        best.map(NodeId)
    }

    /// The last node whose key is `<= key`.
    pub fn floor(&self, key: u32) -> Option<NodeId> {
        let mut current = self.root;
        let mut best = None;
        while let Some(index) = current {
            let node = self.node(index);
            if node.key <= key {
                best = Some(index);
                current = node.right;
            } else {
                current = node.left;
            }
        }
        best.map(NodeId)
    }

    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.successor_index(id.0).map(NodeId)
    }

    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        self.predecessor_index(id.0).map(NodeId)
    }

    /// In-order iteration over `(key, value)` pairs.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            index: self,
            next: self.leftmost,
        }
    }

    fn node(&self, index: usize) -> &Node<V> {
        self.slots[index]
            .as_ref()
            .expect("ordered index link points at a vacant slot")
    }

    fn node_mut(&mut self, index: usize) -> &mut Node<V> {
        self.slots[index]
            .as_mut()
            .expect("ordered index link points at a vacant slot")
    }

    fn alloc_slot(&mut self, node: Node<V>) -> usize {
        if let Some(index) = self.free_slots.pop() {
            self.slots[index] = Some(node);
            index
        } else {
            self.slots.push(Some(node));
            self.slots.len() - 1
        }
    }

    fn free_slot(&mut self, index: usize) -> V {
        let node = self.slots[index]
            .take()
            .expect("ordered index link points at a vacant slot");
        self.free_slots.push(index);
        node.value
    }

    fn is_red(&self, index: Option<usize>) -> bool {
        index.is_some_and(|i| self.node(i).color == Color::Red)
    }

    fn set_color(&mut self, index: usize, color: Color) {
        self.node_mut(index).color = color;
    }

    fn minimum(&self, mut index: usize) -> usize {
        while let Some(left) = self.node(index).left {
            index = left;
        }
        index
    }

    fn maximum(&self, mut index: usize) -> usize {
        while let Some(right) = self.node(index).right {
            index = right;
        }
        index
    }

    fn successor_index(&self, index: usize) -> Option<usize> {
        if let Some(right) = self.node(index).right {
            return Some(self.minimum(right));
        }
        let mut child = index;
        let mut parent = self.node(index).parent;
        while let Some(p) = parent {
            if self.node(p).left == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.node(p).parent;
        }
        None
    }

    fn predecessor_index(&self, index: usize) -> Option<usize> {
        if let Some(left) = self.node(index).left {
            return Some(self.maximum(left));
        }
        let mut child = index;
        let mut parent = self.node(index).parent;
        while let Some(p) = parent {
            if self.node(p).right == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.node(p).parent;
        }
        None
    }

    /// Puts `v` where `u` hangs from its parent. `u`'s own links are left
    /// untouched.
    fn transplant(&mut self, u: usize, v: Option<usize>) {
        let parent = self.node(u).parent;
        match parent {
            None => self.root = v,
            Some(p) if self.node(p).left == Some(u) => self.node_mut(p).left = v,
            Some(p) => self.node_mut(p).right = v,
        }
        if let Some(v) = v {
            self.node_mut(v).parent = parent;
        }
    }

    fn rotate_left(&mut self, x: usize) {
        let y = self
            .node(x)
            .right
            .expect("left rotation needs a right child");
        let y_left = self.node(y).left;

        self.node_mut(x).right = y_left;
        if let Some(b) = y_left {
            self.node_mut(b).parent = Some(x);
        }
        self.transplant(x, Some(y));
        self.node_mut(y).left = Some(x);
        self.node_mut(x).parent = Some(y);
    }

    fn rotate_right(&mut self, x: usize) {
        let y = self
            .node(x)
            .left
            .expect("right rotation needs a left child");
        let y_right = self.node(y).right;

        self.node_mut(x).left = y_right;
        if let Some(b) = y_right {
            self.node_mut(b).parent = Some(x);
        }
        self.transplant(x, Some(y));
        self.node_mut(y).right = Some(x);
        self.node_mut(x).parent = Some(y);
    }

    fn insert_fixup(&mut self, mut z: usize) {
        while let Some(p) = self.node(z).parent.filter(|&p| self.is_red(Some(p))) {
            // N.B. A red node is never the root, so `p` has a parent.
            let g = self.node(p).parent.expect("red node without a parent");

            if self.node(g).left == Some(p) {
                let uncle = self.node(g).right;
                if self.is_red(uncle) {
                    self.set_color(p, Color::Black);
                    self.set_color(uncle.expect("red uncle"), Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if self.node(p).right == Some(z) {
                        z = p;
                        self.rotate_left(z);
                    }
                    let p = self.node(z).parent.expect("rotated node has a parent");
                    let g = self.node(p).parent.expect("red node without a parent");
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.rotate_right(g);
                }
            } else {
                let uncle = self.node(g).left;
                if self.is_red(uncle) {
                    self.set_color(p, Color::Black);
                    self.set_color(uncle.expect("red uncle"), Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if self.node(p).left == Some(z) {
                        z = p;
                        self.rotate_right(z);
                    }
                    let p = self.node(z).parent.expect("rotated node has a parent");
                    let g = self.node(p).parent.expect("red node without a parent");
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.rotate_left(g);
                }
            }
        }

        if let Some(root) = self.root {
            self.set_color(root, Color::Black);
        }
    }

    /// Restores the black-height after removing a black node. `x` took the
    /// removed node's place and may be `None`, so its parent is tracked
    /// separately.
    fn delete_fixup(&mut self, mut x: Option<usize>, mut parent: Option<usize>) {
        while x != self.root && !self.is_red(x) {
            let Some(p) = parent else { break };

            if self.node(p).left == x {
                let mut w = self.node(p).right.expect("doubly black node has a sibling");
                if self.is_red(Some(w)) {
                    self.set_color(w, Color::Black);
                    self.set_color(p, Color::Red);
                    self.rotate_left(p);
                    w = self.node(p).right.expect("doubly black node has a sibling");
                }

                if !self.is_red(self.node(w).left) && !self.is_red(self.node(w).right) {
                    self.set_color(w, Color::Red);
                    x = Some(p);
                    parent = self.node(p).parent;
                } else {
                    if !self.is_red(self.node(w).right) {
                        let wl = self.node(w).left.expect("red nephew");
                        self.set_color(wl, Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_right(w);
                        w = self.node(p).right.expect("doubly black node has a sibling");
                    }
                    let p_color = self.node(p).color;
                    self.set_color(w, p_color);
                    self.set_color(p, Color::Black);
                    if let Some(wr) = self.node(w).right {
                        self.set_color(wr, Color::Black);
                    }
                    self.rotate_left(p);
                    x = self.root;
                    parent = None;
                }
            } else {
                let mut w = self.node(p).left.expect("doubly black node has a sibling");
                if self.is_red(Some(w)) {
                    self.set_color(w, Color::Black);
                    self.set_color(p, Color::Red);
                    self.rotate_right(p);
                    w = self.node(p).left.expect("doubly black node has a sibling");
                }

                if !self.is_red(self.node(w).left) && !self.is_red(self.node(w).right) {
                    self.set_color(w, Color::Red);
                    x = Some(p);
                    parent = self.node(p).parent;
                } else {
                    if !self.is_red(self.node(w).left) {
                        let wr = self.node(w).right.expect("red nephew");
                        self.set_color(wr, Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_left(w);
                        w = self.node(p).left.expect("doubly black node has a sibling");
                    }
                    let p_color = self.node(p).color;
                    self.set_color(w, p_color);
                    self.set_color(p, Color::Black);
                    if let Some(wl) = self.node(w).left {
                        self.set_color(wl, Color::Black);
                    }
                    self.rotate_right(p);
                    x = self.root;
                    parent = None;
                }
            }
        }

        if let Some(x) = x {
            self.set_color(x, Color::Black);
        }
    }
}

/// In-order iterator returned by [`OrderedIndex::iter`].
pub struct Iter<'a, V> {
    index: &'a OrderedIndex<V>,
    next: Option<usize>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (u32, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = self.index.successor_index(current);
        let node = self.index.node(current);
        Some((node.key, &node.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use proptest::prelude::*;

    impl<V> OrderedIndex<V> {
        /// Checks the red-black and search-tree invariants, returning the
        /// black height.
        fn check_invariants(&self) -> usize {
            assert!(!self.is_red(self.root), "root must be black");
            if let Some(root) = self.root {
                assert_eq!(self.node(root).parent, None);
            }
            let height = self.check_subtree(self.root, None, None);

            let count = self.iter().count();
            assert_eq!(count, self.len);
            assert_eq!(self.leftmost, self.root.map(|r| self.minimum(r)));
            assert_eq!(self.rightmost, self.root.map(|r| self.maximum(r)));
            height
        }

        fn check_subtree(&self, index: Option<usize>, lo: Option<u32>, hi: Option<u32>) -> usize {
            let Some(index) = index else { return 1 };
            let node = self.node(index);
            if let Some(lo) = lo {
                assert!(node.key >= lo);
            }
            if let Some(hi) = hi {
                assert!(node.key <= hi);
            }
            if node.color == Color::Red {
                assert!(!self.is_red(node.left) && !self.is_red(node.right), "red node with red child");
            }
            for child in [node.left, node.right].into_iter().flatten() {
                assert_eq!(self.node(child).parent, Some(index));
            }
            let left = self.check_subtree(node.left, lo, Some(node.key));
            let right = self.check_subtree(node.right, Some(node.key), hi);
            assert_eq!(left, right, "black height mismatch");
            left + usize::from(node.color == Color::Black)
        }
    }

    #[test]
    fn simple_test() {
        let mut index = OrderedIndex::new();
        assert!(index.first().is_none());

        let ten = index.insert(10, "ten");
        index.insert(5, "five");
        index.insert(20, "twenty");
        index.insert(15, "fifteen");
        index.check_invariants();

        assert_eq!(index.len(), 4);
        assert_eq!(index.key(index.first().unwrap()), 5);
        assert_eq!(index.key(index.last().unwrap()), 20);
        assert_eq!(*index.value(index.get(15).unwrap()), "fifteen");
        assert!(index.get(7).is_none());

        assert_eq!(index.key(index.ceiling(11).unwrap()), 15);
        assert_eq!(index.key(index.ceiling(15).unwrap()), 15);
        assert!(index.ceiling(21).is_none());
        assert_eq!(index.key(index.floor(14).unwrap()), 10);
        assert!(index.floor(4).is_none());

        assert_eq!(index.remove(ten), "ten");
        index.check_invariants();
        let keys: Vec<u32> = index.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, [5, 15, 20]);
    }

    #[test]
    fn find_by_range() {
        // Extents keyed by start cluster; find the one containing a cluster.
        let mut index = OrderedIndex::new();
        index.insert(100, 10_u32);
        index.insert(10, 5);
        index.insert(50, 1);

        let containing = |cluster: u32| {
            index.find_by(|start, len| {
                if cluster < start {
                    Ordering::Less
                } else if cluster >= start + len {
                    Ordering::Greater
                } else {
                    Ordering::Equal
                }
            })
        };

        assert_eq!(containing(12).map(|id| index.key(id)), Some(10));
        assert_eq!(containing(109).map(|id| index.key(id)), Some(100));
        assert_eq!(containing(50).map(|id| index.key(id)), Some(50));
        assert!(containing(51).is_none());
    }

    #[test]
    fn duplicates_keep_insertion_order() {
        let mut index = OrderedIndex::new();
        let a = index.insert(7, 'a');
        index.insert(7, 'b');
        index.insert(3, 'x');
        index.insert(7, 'c');
        index.check_invariants();

        assert_eq!(index.get(7), Some(a));
        let values: String = index.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, "xabc");

        index.remove(a);
        assert_eq!(*index.value(index.get(7).unwrap()), 'b');
        index.check_invariants();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u32),
        Remove(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..500_u32).prop_map(Op::Insert),
            prop::num::usize::ANY.prop_map(Op::Remove),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 2_000, .. ProptestConfig::default()
        })]

        #[test]
        fn matches_btreemap(ops in prop::collection::vec(op_strategy(), 1..200)) {
            let mut index = OrderedIndex::new();
            let mut model: BTreeMap<u32, NodeId> = BTreeMap::new();

            for op in ops {
                match op {
                    Op::Insert(key) => {
                        // N.B. The model is a map, so keep keys unique here;
                        // duplicates have their own test.
                        if !model.contains_key(&key) {
                            let id = index.insert(key, key * 2);
                            model.insert(key, id);
                        }
                    }
                    Op::Remove(raw_idx) => {
                        if model.is_empty() {
                            continue;
                        }
                        let key = *model.keys().nth(raw_idx % model.len()).unwrap();
                        let id = model.remove(&key).unwrap();
                        prop_assert_eq!(index.remove(id), key * 2);
                    }
                }
                index.check_invariants();
            }

            let keys: Vec<u32> = index.iter().map(|(k, _)| k).collect();
            let expected: Vec<u32> = model.keys().copied().collect();
            prop_assert_eq!(keys, expected);
            for (&key, &id) in &model {
                prop_assert_eq!(index.get(key), Some(id));
                prop_assert_eq!(index.key(index.ceiling(key).unwrap()), key);
            }
        }
    }
}
