use std::{cmp::Ordering, ptr::NonNull};

use crate::span::{Descriptor, Link};

/// Ordered index of available spans.
///
/// Descriptors are kept in a self-balancing (AVL) binary tree ordered by
/// `(size, address)`. The tree is intrusive: its links live inside the
/// descriptors, so inserting or removing a span never allocates.
///
/// ```text
///                 (128, 0x9000)
///                /             \
///       (64, 0x4000)        (4032, 0x1000)
///       /          \
/// (64, 0x2000)  (64, 0x7000)
/// ```
///
/// The only query is [`SpanTree::find_at_least`]: the smallest span that is
/// large enough, lowest address on ties. Best fit keeps remainders small and
/// the address tie-break makes allocation patterns reproducible.
///
/// Every method must be called with the base lock held.
pub(crate) struct SpanTree {
    root: Link<Descriptor>,
    len: usize,
}

impl SpanTree {
    /// Creates a new empty index.
    pub const fn new() -> Self {
        Self { root: None, len: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns the smallest indexed span of at least `size` bytes. Among
    /// spans of equal size the one with the lowest address wins.
    ///
    /// The descriptor stays in the index; see [`SpanTree::remove`].
    pub fn find_at_least(&self, size: usize) -> Link<Descriptor> {
        let mut current = self.root;
        let mut best = None;

        while let Some(node) = current {
            let node_ref = unsafe { node.as_ref() };

            if node_ref.span.size() >= size {
                best = Some(node);
                current = node_ref.left;
            } else {
                current = node_ref.right;
            }
        }

        best
    }

    /// Inserts `node` into the index.
    ///
    /// # Safety
    /// `node` must be a valid descriptor of a free span that overlaps no
    /// indexed span, and must not be referenced by any other structure.
    pub unsafe fn insert(&mut self, mut node: NonNull<Descriptor>) {
        unsafe {
            let node_mut = node.as_mut();
            node_mut.left = None;
            node_mut.right = None;
            node_mut.height = 1;

            self.root = Some(insert_at(self.root, node));
        }
        self.len += 1;
    }

    /// Removes `node` from the index.
    ///
    /// # Safety
    /// `node` must currently be in this index, typically the result of a
    /// preceding [`SpanTree::find_at_least`].
    pub unsafe fn remove(&mut self, mut node: NonNull<Descriptor>) {
        let mut found = false;

        unsafe {
            let key = node.as_ref().span.key();
            self.root = remove_at(self.root, key, &mut found);

            let node_mut = node.as_mut();
            node_mut.left = None;
            node_mut.right = None;
            node_mut.height = 1;
        }

        debug_assert!(found, "removed descriptor was not indexed");
        if found {
            self.len -= 1;
        }
    }
}

#[inline]
unsafe fn height(link: Link<Descriptor>) -> u8 {
    link.map_or(0, |node| unsafe { node.as_ref().height })
}

#[inline]
unsafe fn balance_factor(node: NonNull<Descriptor>) -> i16 {
    unsafe {
        let node_ref = node.as_ref();
        i16::from(height(node_ref.left)) - i16::from(height(node_ref.right))
    }
}

#[inline]
unsafe fn update_height(mut node: NonNull<Descriptor>) {
    unsafe {
        let node_mut = node.as_mut();
        node_mut.height = 1 + height(node_mut.left).max(height(node_mut.right));
    }
}

unsafe fn rotate_right(mut node: NonNull<Descriptor>) -> NonNull<Descriptor> {
    unsafe {
        let Some(mut pivot) = node.as_ref().left else {
            return node;
        };

        node.as_mut().left = pivot.as_ref().right;
        pivot.as_mut().right = Some(node);

        update_height(node);
        update_height(pivot);

        pivot
    }
}

unsafe fn rotate_left(mut node: NonNull<Descriptor>) -> NonNull<Descriptor> {
    unsafe {
        let Some(mut pivot) = node.as_ref().right else {
            return node;
        };

        node.as_mut().right = pivot.as_ref().left;
        pivot.as_mut().left = Some(node);

        update_height(node);
        update_height(pivot);

        pivot
    }
}

/// Restores the AVL balance of the subtree rooted at `node` and returns its new root.
unsafe fn rebalance(mut node: NonNull<Descriptor>) -> NonNull<Descriptor> {
    unsafe {
        update_height(node);

        let factor = balance_factor(node);

        if factor > 1 {
            if let Some(left) = node.as_ref().left {
                if balance_factor(left) < 0 {
                    node.as_mut().left = Some(rotate_left(left));
                }
            }
            return rotate_right(node);
        }

        if factor < -1 {
            if let Some(right) = node.as_ref().right {
                if balance_factor(right) > 0 {
                    node.as_mut().right = Some(rotate_right(right));
                }
            }
            return rotate_left(node);
        }

        node
    }
}

unsafe fn insert_at(link: Link<Descriptor>, node: NonNull<Descriptor>) -> NonNull<Descriptor> {
    unsafe {
        let Some(mut current) = link else {
            return node;
        };

        // Addresses of indexed spans are disjoint, so keys never compare equal.
        if node.as_ref().span.key() < current.as_ref().span.key() {
            current.as_mut().left = Some(insert_at(current.as_ref().left, node));
        } else {
            current.as_mut().right = Some(insert_at(current.as_ref().right, node));
        }

        rebalance(current)
    }
}

unsafe fn remove_at(
    link: Link<Descriptor>,
    key: (usize, usize),
    found: &mut bool,
) -> Link<Descriptor> {
    unsafe {
        let mut current = link?;

        match key.cmp(&current.as_ref().span.key()) {
            Ordering::Less => {
                current.as_mut().left = remove_at(current.as_ref().left, key, found);
            }
            Ordering::Greater => {
                current.as_mut().right = remove_at(current.as_ref().right, key, found);
            }
            Ordering::Equal => {
                *found = true;

                let left = current.as_ref().left;
                let right = current.as_ref().right;

                let (Some(_), Some(right)) = (left, right) else {
                    return left.or(right);
                };

                // Two children: the in-order successor takes the removed node's place.
                let (rest, mut successor) = take_min(right);
                successor.as_mut().left = left;
                successor.as_mut().right = rest;

                return Some(rebalance(successor));
            }
        }

        Some(rebalance(current))
    }
}

/// Detaches the minimum of the subtree rooted at `node`.
/// Returns the remaining subtree and the detached descriptor.
unsafe fn take_min(mut node: NonNull<Descriptor>) -> (Link<Descriptor>, NonNull<Descriptor>) {
    unsafe {
        match node.as_ref().left {
            None => (node.as_ref().right, node),
            Some(left) => {
                let (rest, min) = take_min(left);
                node.as_mut().left = rest;
                (Some(rebalance(node)), min)
            }
        }
    }
}

#[cfg(test)]
impl SpanTree {
    /// In-order list of the indexed spans.
    pub fn spans(&self) -> Vec<crate::span::Span> {
        fn walk(link: Link<Descriptor>, out: &mut Vec<crate::span::Span>) {
            if let Some(node) = link {
                let node_ref = unsafe { node.as_ref() };
                walk(node_ref.left, out);
                out.push(node_ref.span);
                walk(node_ref.right, out);
            }
        }

        let mut out = Vec::with_capacity(self.len);
        walk(self.root, &mut out);
        out
    }

    /// Panics if ordering, heights, balance or the length counter are off.
    pub fn check_invariants(&self) {
        fn check(link: Link<Descriptor>) -> (u8, usize) {
            let Some(node) = link else {
                return (0, 0);
            };
            let node_ref = unsafe { node.as_ref() };

            if let Some(left) = node_ref.left {
                assert!(unsafe { left.as_ref() }.span.key() < node_ref.span.key());
            }
            if let Some(right) = node_ref.right {
                assert!(unsafe { right.as_ref() }.span.key() > node_ref.span.key());
            }

            let (left_height, left_len) = check(node_ref.left);
            let (right_height, right_len) = check(node_ref.right);
            assert!(left_height.abs_diff(right_height) <= 1, "unbalanced subtree");
            assert_eq!(node_ref.height, 1 + left_height.max(right_height));

            (node_ref.height, left_len + right_len + 1)
        }

        let (_, len) = check(self.root);
        assert_eq!(self.len, len);

        let keys: Vec<_> = self.spans().iter().map(|span| span.key()).collect();
        assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Span;
    use proptest::prelude::*;
    use std::mem::MaybeUninit;

    /// Descriptor storage for tests. Span addresses are synthetic and never dereferenced.
    struct Slots {
        storage: Vec<MaybeUninit<Descriptor>>,
    }

    impl Slots {
        fn new(count: usize) -> Self {
            let mut storage = Vec::with_capacity(count);
            storage.resize_with(count, MaybeUninit::uninit);
            Self { storage }
        }

        fn describe(&mut self, slot: usize, addr: usize, size: usize) -> NonNull<Descriptor> {
            let span = Span::new(NonNull::new(addr as *mut u8).unwrap(), size, true);
            let at = NonNull::from(&mut self.storage[slot]).cast();
            unsafe { Descriptor::init(at, span) }
        }
    }

    fn key_of(node: Link<Descriptor>) -> Option<(usize, usize)> {
        node.map(|node| unsafe { node.as_ref() }.span.key())
    }

    #[test]
    fn new_tree_is_empty() {
        let tree = SpanTree::new();

        assert_eq!(0, tree.len());
        assert!(tree.find_at_least(1).is_none());
    }

    #[test]
    fn finds_smallest_sufficient_span() {
        let mut slots = Slots::new(3);
        let mut tree = SpanTree::new();

        unsafe {
            tree.insert(slots.describe(0, 0x1000, 256));
            tree.insert(slots.describe(1, 0x2000, 64));
            tree.insert(slots.describe(2, 0x3000, 1024));
        }
        tree.check_invariants();

        assert_eq!(Some((64, 0x2000)), key_of(tree.find_at_least(1)));
        assert_eq!(Some((256, 0x1000)), key_of(tree.find_at_least(65)));
        assert_eq!(Some((256, 0x1000)), key_of(tree.find_at_least(256)));
        assert_eq!(Some((1024, 0x3000)), key_of(tree.find_at_least(257)));
        assert!(tree.find_at_least(1025).is_none());
    }

    #[test]
    fn equal_sizes_prefer_lowest_address() {
        let mut slots = Slots::new(3);
        let mut tree = SpanTree::new();

        unsafe {
            tree.insert(slots.describe(0, 0x9000, 128));
            tree.insert(slots.describe(1, 0x3000, 128));
            tree.insert(slots.describe(2, 0x6000, 128));
        }

        assert_eq!(Some((128, 0x3000)), key_of(tree.find_at_least(100)));

        let lowest = tree.find_at_least(100).unwrap();
        unsafe { tree.remove(lowest) };
        assert_eq!(Some((128, 0x6000)), key_of(tree.find_at_least(100)));
        tree.check_invariants();
    }

    #[test]
    fn remove_inner_node_keeps_order() {
        let mut slots = Slots::new(7);
        let mut tree = SpanTree::new();
        let nodes: Vec<_> = (0..7)
            .map(|i| slots.describe(i, 0x1000 * (i + 1), 64 * (i + 1)))
            .collect();

        unsafe {
            for node in &nodes {
                tree.insert(*node);
            }
            tree.check_invariants();

            tree.remove(nodes[3]);
            tree.check_invariants();
            tree.remove(nodes[0]);
            tree.check_invariants();
        }

        let sizes: Vec<_> = tree.spans().iter().map(Span::size).collect();
        assert_eq!(vec![128, 192, 320, 384, 448], sizes);
        assert_eq!(5, tree.len());
    }

    #[test]
    fn ascending_inserts_stay_balanced() {
        let mut slots = Slots::new(1024);
        let mut tree = SpanTree::new();

        for i in 0..1024 {
            unsafe { tree.insert(slots.describe(i, 0x1000 + i * 64, 64)) };
        }
        tree.check_invariants();

        // A balanced tree of 1024 nodes is at most ~1.44 * log2(1024) high.
        assert!(unsafe { height(tree.root) } <= 15);
    }

    proptest! {
        #[test]
        fn find_at_least_matches_linear_scan(
            sizes in prop::collection::vec(1usize..64, 1..64),
            removals in prop::collection::vec(any::<prop::sample::Index>(), 0..32),
            query in 1usize..80,
        ) {
            let mut slots = Slots::new(sizes.len());
            let mut tree = SpanTree::new();
            let mut live: Vec<(NonNull<Descriptor>, (usize, usize))> = Vec::new();

            for (i, size) in sizes.iter().enumerate() {
                let node = slots.describe(i, 0x10000 + i * 0x1000, size * 64);
                unsafe { tree.insert(node) };
                live.push((node, (size * 64, 0x10000 + i * 0x1000)));
            }

            for index in removals {
                if live.is_empty() {
                    break;
                }
                let (node, _) = live.swap_remove(index.index(live.len()));
                unsafe { tree.remove(node) };
            }
            tree.check_invariants();

            let expected = live
                .iter()
                .map(|(_, key)| *key)
                .filter(|(size, _)| *size >= query * 64)
                .min();
            prop_assert_eq!(expected, key_of(tree.find_at_least(query * 64)));
            prop_assert_eq!(live.len(), tree.len());
        }
    }
}
