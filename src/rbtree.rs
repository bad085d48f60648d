//! An intrusive red-black tree with a sentinel root and a sentinel null node.
//!
//! The real root is always the left child of the sentinel root, and every
//! missing child points at the null sentinel, so rotations and removals never
//! need to special-case the top of the tree or absent children.
//!
//! Nodes are caller-owned and are usually embedded as the first field of a
//! `#[repr(C)]` record; the comparator casts back to the record to compare keys.
//! The tree itself never allocates.

use core::{
    cmp::Ordering,
    ptr::{addr_of, addr_of_mut, null_mut},
};

/// Validate the whole tree every 256 mutations.
pub const PERIODIC_VALIDATION: u32 = 0x1;

const VALIDATE_MASK: u32 = 0xFF;

/// Compares two nodes. `Less` means the first node orders before the second.
pub type CompareNodes = fn(&RbTree, *const RbNode, *const RbNode) -> Ordering;

#[repr(C)]
#[derive(Debug)]
pub struct RbNode {
    pub red: bool,
    pub parent: *mut RbNode,
    pub left: *mut RbNode,
    pub right: *mut RbNode,
}

impl RbNode {
    pub const fn new() -> Self {
        Self { red: false, parent: null_mut(), left: null_mut(), right: null_mut() }
    }
}

impl Default for RbNode {
    fn default() -> Self {
        Self::new()
    }
}

/// A structural problem found by [`RbTree::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeViolation {
    /// The real root does not point back at the sentinel root.
    RootParent,
    /// A red node has a red child.
    RedRed,
    /// A child is out of order with respect to its parent, or its parent link is wrong.
    Order,
    /// Two paths from the same node cross a different number of black nodes.
    BlackHeight,
}

impl core::fmt::Display for TreeViolation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TreeViolation::RootParent => f.write_str("root does not point back at the sentinel"),
            TreeViolation::RedRed => f.write_str("red node with a red child"),
            TreeViolation::Order => f.write_str("child out of order"),
            TreeViolation::BlackHeight => f.write_str("unequal black height"),
        }
    }
}

pub struct RbTree {
    flags: u32,
    compare: CompareNodes,
    root: RbNode,
    null: RbNode,
    call_count: u32,
}

unsafe impl Send for RbTree {}

impl core::fmt::Debug for RbTree {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RbTree")
            .field("flags", &format_args!("{:x}", self.flags))
            .field("root", &self.root.left)
            .field("call_count", &self.call_count)
            .finish()
    }
}

impl RbTree {
    /// Create a tree whose sentinels are not yet wired up.
    ///
    /// Call [`init`](RbTree::init) once the tree is at its final address.
    pub const fn new(flags: u32, compare: CompareNodes) -> Self {
        Self { flags, compare, root: RbNode::new(), null: RbNode::new(), call_count: 0 }
    }

    /// Wire up both sentinels in place: both are black, the null sentinel's
    /// children point at itself and the root sentinel's children point at the
    /// null sentinel.
    ///
    /// # Safety
    /// The tree must not be moved after this call while any node is linked,
    /// as every node refers to the sentinels by address.
    pub unsafe fn init(&mut self, flags: u32, compare: CompareNodes) {
        let null = addr_of_mut!(self.null);

        self.flags = flags;
        self.compare = compare;
        self.null = RbNode { red: false, parent: null_mut(), left: null, right: null };
        self.root = RbNode { red: false, parent: null_mut(), left: null, right: null };
        self.call_count = 0;
    }

    pub fn is_initialized(&self) -> bool {
        !self.null.left.is_null()
    }

    pub fn is_empty(&self) -> bool {
        self.root.left as *const RbNode == addr_of!(self.null)
    }

    #[inline]
    fn null_ptr(&self) -> *mut RbNode {
        addr_of!(self.null) as *mut RbNode
    }

    #[inline]
    fn root_ptr(&self) -> *mut RbNode {
        addr_of!(self.root) as *mut RbNode
    }

    #[inline]
    fn cmp(&self, a: *const RbNode, b: *const RbNode) -> Ordering {
        (self.compare)(self, a, b)
    }

    /// Insert `node`. Equal keys are placed to the right of existing ones.
    ///
    /// Returns an error only if periodic validation is enabled and fires on a broken tree.
    ///
    /// # Safety
    /// `node` must be valid for reads and writes, not already linked, and must
    /// remain at its address until removed.
    pub unsafe fn insert(&mut self, node: *mut RbNode) -> Result<(), TreeViolation> {
        self.perform_insert(node);

        (*node).red = true;
        let mut current = node;

        while (*(*current).parent).red {
            let parent = (*current).parent;
            let grandparent = (*parent).parent;

            if (*grandparent).left == parent {
                let uncle = (*grandparent).right;

                if (*uncle).red {
                    (*parent).red = false;
                    (*uncle).red = false;
                    (*grandparent).red = true;
                    current = grandparent;
                } else {
                    if (*parent).right == current {
                        current = parent;
                        self.rotate_left(current);
                    }

                    (*(*current).parent).red = false;
                    (*(*(*current).parent).parent).red = true;
                    self.rotate_right((*(*current).parent).parent);
                }
            } else {
                let uncle = (*grandparent).left;

                if (*uncle).red {
                    (*parent).red = false;
                    (*uncle).red = false;
                    (*grandparent).red = true;
                    current = grandparent;
                } else {
                    if (*parent).left == current {
                        current = parent;
                        self.rotate_right(current);
                    }

                    (*(*current).parent).red = false;
                    (*(*(*current).parent).parent).red = true;
                    self.rotate_left((*(*current).parent).parent);
                }
            }
        }

        (*self.root.left).red = false;
        debug_assert!(!self.null.red && !self.root.red);

        self.after_mutation()
    }

    /// Unlink `node` from the tree.
    ///
    /// Returns an error only if periodic validation is enabled and fires on a broken tree.
    ///
    /// # Safety
    /// `node` must currently be linked into this tree.
    pub unsafe fn remove(&mut self, node: *mut RbNode) -> Result<(), TreeViolation> {
        let null = self.null_ptr();

        let to_remove = if (*node).left == null || (*node).right == null {
            node
        } else {
            self.next_highest(node)
        };

        debug_assert!((*to_remove).left == null || (*to_remove).right == null);
        debug_assert!(to_remove != null);

        let child = if (*to_remove).left != null { (*to_remove).left } else { (*to_remove).right };

        // the null sentinel's parent is written too, the fixup walks up from it
        (*child).parent = (*to_remove).parent;
        if (*(*to_remove).parent).left == to_remove {
            (*(*to_remove).parent).left = child;
        } else {
            debug_assert!((*(*to_remove).parent).right == to_remove);
            (*(*to_remove).parent).right = child;
        }

        if to_remove != node {
            if !(*to_remove).red {
                self.fix_after_removal(child);
            }

            let successor = to_remove;
            (*successor).left = (*node).left;
            (*successor).right = (*node).right;
            (*successor).parent = (*node).parent;
            (*successor).red = (*node).red;
            (*(*node).left).parent = successor;
            (*(*node).right).parent = successor;

            if (*(*node).parent).left == node {
                (*(*node).parent).left = successor;
            } else {
                debug_assert!((*(*node).parent).right == node);
                (*(*node).parent).right = successor;
            }
        } else if !(*to_remove).red {
            self.fix_after_removal(child);
        }

        debug_assert!(!self.null.red);

        self.after_mutation()
    }

    fn after_mutation(&mut self) -> Result<(), TreeViolation> {
        self.call_count = self.call_count.wrapping_add(1);

        if self.flags & PERIODIC_VALIDATION != 0 && self.call_count & VALIDATE_MASK == 0 {
            self.validate()
        } else {
            Ok(())
        }
    }

    /// Find a node comparing equal to `value`.
    pub fn search(&self, value: *const RbNode) -> Option<*mut RbNode> {
        let null = self.null_ptr();
        let mut current = self.root.left;

        unsafe {
            while current != null {
                match self.cmp(current, value) {
                    Ordering::Equal => return Some(current),
                    Ordering::Less => current = (*current).right,
                    Ordering::Greater => current = (*current).left,
                }
            }
        }

        None
    }

    /// Find a node comparing equal to `value`, or failing that the closest
    /// node above it (`greater_than`) or below it.
    pub fn search_closest(&self, value: *const RbNode, greater_than: bool) -> Option<*mut RbNode> {
        let null = self.null_ptr();
        let mut current = self.root.left;
        let mut closest = None;

        unsafe {
            while current != null {
                match self.cmp(current, value) {
                    Ordering::Equal => return Some(current),
                    Ordering::Less => {
                        if !greater_than {
                            closest = Some(current);
                        }
                        current = (*current).right;
                    }
                    Ordering::Greater => {
                        if greater_than {
                            closest = Some(current);
                        }
                        current = (*current).left;
                    }
                }
            }
        }

        closest
    }

    pub fn lowest(&self) -> Option<*mut RbNode> {
        let null = self.null_ptr();
        let mut node = self.root.left;
        if node == null {
            return None;
        }

        unsafe {
            while (*node).left != null {
                node = (*node).left;
            }
        }

        Some(node)
    }

    pub fn highest(&self) -> Option<*mut RbNode> {
        let null = self.null_ptr();
        let mut node = self.root.left;
        if node == null {
            return None;
        }

        unsafe {
            while (*node).right != null {
                node = (*node).right;
            }
        }

        Some(node)
    }

    /// The in-order neighbor of `previous`, or the first node in the given
    /// direction when `previous` is `None`.
    ///
    /// # Safety
    /// `previous`, if given, must be linked into this tree.
    pub unsafe fn next(&self, descending: bool, previous: Option<*mut RbNode>) -> Option<*mut RbNode> {
        let Some(previous) = previous else {
            return if descending { self.highest() } else { self.lowest() };
        };

        let next = if descending { self.next_lowest(previous) } else { self.next_highest(previous) };

        if next == self.null_ptr() {
            None
        } else {
            Some(next)
        }
    }

    /// Visit every node in order without recursion, passing each node's depth
    /// (the real root is at depth 0).
    pub fn iterate<F: FnMut(*mut RbNode, usize)>(&self, mut visit: F) {
        let null = self.null_ptr();
        let root = self.root_ptr();
        let mut previous = root;
        let mut node = self.root.left;
        if node == null {
            return;
        }

        let mut level = 0usize;

        unsafe {
            while node != root {
                let next;

                if previous == (*node).parent {
                    next = (*node).left;
                    level += 1;
                } else if previous == (*node).left {
                    visit(node, level - 1);
                    if (*node).right == (*node).left {
                        debug_assert!((*node).right == null);
                        next = (*node).parent;
                        level -= 1;
                    } else {
                        next = (*node).right;
                    }
                } else {
                    debug_assert!(previous == (*node).right);
                    debug_assert!(level != 0);
                    next = (*node).parent;
                    level -= 1;
                }

                // stepping onto the null sentinel is recorded but never taken
                if next == null {
                    previous = null;
                } else {
                    previous = node;
                    node = next;
                }
            }
        }
    }

    /// Check the red-black properties and the ordering of every node.
    pub fn validate(&self) -> Result<(), TreeViolation> {
        let null = self.null_ptr();
        if self.root.left == null {
            return Ok(());
        }

        unsafe {
            if (*self.root.left).parent != self.root_ptr() {
                log::warn!("[rbtree] {:p}: root {:p} does not point back at the sentinel", self, self.root.left);
                return Err(TreeViolation::RootParent);
            }

            if (*self.root.left).red {
                return Err(TreeViolation::RedRed);
            }

            self.validate_subtree(self.root.left).map(|_| ())
        }
    }

    /// Returns the black height of the subtree at `node`.
    unsafe fn validate_subtree(&self, node: *mut RbNode) -> Result<usize, TreeViolation> {
        let null = self.null_ptr();
        if node == null {
            return Ok(0);
        }

        if (*node).red && ((*(*node).left).red || (*(*node).right).red) {
            log::warn!("[rbtree] {:p}: red node {:p} has a red child", self, node);
            return Err(TreeViolation::RedRed);
        }

        if (*node).left != null
            && ((*(*node).left).parent != node || self.cmp((*node).left, node) == Ordering::Greater)
        {
            log::warn!("[rbtree] {:p}: left child of {:p} is out of order", self, node);
            return Err(TreeViolation::Order);
        }

        if (*node).right != null
            && ((*(*node).right).parent != node || self.cmp((*node).right, node) == Ordering::Less)
        {
            log::warn!("[rbtree] {:p}: right child of {:p} is out of order", self, node);
            return Err(TreeViolation::Order);
        }

        let left = self.validate_subtree((*node).left)?;
        let right = self.validate_subtree((*node).right)?;

        if left != right {
            log::warn!("[rbtree] {:p}: node {:p} black heights {} and {}", self, node, left, right);
            return Err(TreeViolation::BlackHeight);
        }

        Ok(left + !(*node).red as usize)
    }

    unsafe fn rotate_left(&mut self, old_parent: *mut RbNode) {
        let null = self.null_ptr();
        let new_parent = (*old_parent).right;

        (*old_parent).right = (*new_parent).left;
        if (*new_parent).left != null {
            (*(*new_parent).left).parent = old_parent;
        }

        (*new_parent).parent = (*old_parent).parent;
        if (*(*old_parent).parent).left == old_parent {
            (*(*old_parent).parent).left = new_parent;
        } else {
            debug_assert!((*(*old_parent).parent).right == old_parent);
            (*(*old_parent).parent).right = new_parent;
        }

        (*new_parent).left = old_parent;
        (*old_parent).parent = new_parent;
    }

    unsafe fn rotate_right(&mut self, old_parent: *mut RbNode) {
        let null = self.null_ptr();
        let new_parent = (*old_parent).left;

        (*old_parent).left = (*new_parent).right;
        if (*new_parent).right != null {
            (*(*new_parent).right).parent = old_parent;
        }

        (*new_parent).parent = (*old_parent).parent;
        if (*(*old_parent).parent).left == old_parent {
            (*(*old_parent).parent).left = new_parent;
        } else {
            debug_assert!((*(*old_parent).parent).right == old_parent);
            (*(*old_parent).parent).right = new_parent;
        }

        (*new_parent).right = old_parent;
        (*old_parent).parent = new_parent;
    }

    unsafe fn perform_insert(&mut self, node: *mut RbNode) {
        let null = self.null_ptr();
        let root = self.root_ptr();

        (*node).left = null;
        (*node).right = null;

        let mut previous = root;
        let mut current = self.root.left;
        while current != null {
            previous = current;
            current = match self.cmp(current, node) {
                Ordering::Greater => (*current).left,
                _ => (*current).right,
            };
        }

        (*node).parent = previous;
        if previous == root || self.cmp(previous, node) == Ordering::Greater {
            (*previous).left = node;
        } else {
            (*previous).right = node;
        }
    }

    unsafe fn next_lowest(&self, mut node: *mut RbNode) -> *mut RbNode {
        let null = self.null_ptr();
        let root = self.root_ptr();

        let mut next = (*node).left;
        if next != null {
            while (*next).right != null {
                next = (*next).right;
            }
        } else {
            next = (*node).parent;
            while (*next).left == node && next != root {
                node = next;
                next = (*next).parent;
            }

            if next == root {
                next = null;
            }
        }

        next
    }

    unsafe fn next_highest(&self, mut node: *mut RbNode) -> *mut RbNode {
        let null = self.null_ptr();
        let root = self.root_ptr();

        let mut next = (*node).right;
        if next != null {
            while (*next).left != null {
                next = (*next).left;
            }
        } else {
            next = (*node).parent;
            while (*next).right == node {
                node = next;
                next = (*next).parent;
            }

            if next == root {
                next = null;
            }
        }

        next
    }

    unsafe fn fix_after_removal(&mut self, mut node: *mut RbNode) {
        while !(*node).red && node != self.root.left {
            let parent = (*node).parent;

            if (*parent).left == node {
                let mut sibling = (*parent).right;
                if (*sibling).red {
                    (*sibling).red = false;
                    (*parent).red = true;
                    self.rotate_left(parent);
                    sibling = (*(*node).parent).right;
                }

                if !(*(*sibling).right).red && !(*(*sibling).left).red {
                    (*sibling).red = true;
                    node = (*node).parent;
                } else {
                    if !(*(*sibling).right).red {
                        (*(*sibling).left).red = false;
                        (*sibling).red = true;
                        self.rotate_right(sibling);
                        sibling = (*(*node).parent).right;
                    }

                    (*sibling).red = (*(*node).parent).red;
                    (*(*node).parent).red = false;
                    (*(*sibling).right).red = false;
                    self.rotate_left((*node).parent);
                    node = self.root.left;
                }
            } else {
                debug_assert!((*parent).right == node);

                let mut sibling = (*parent).left;
                if (*sibling).red {
                    (*sibling).red = false;
                    (*parent).red = true;
                    self.rotate_right(parent);
                    sibling = (*(*node).parent).left;
                }

                if !(*(*sibling).right).red && !(*(*sibling).left).red {
                    (*sibling).red = true;
                    node = (*node).parent;
                } else {
                    if !(*(*sibling).left).red {
                        (*(*sibling).right).red = false;
                        (*sibling).red = true;
                        self.rotate_left(sibling);
                        sibling = (*(*node).parent).left;
                    }

                    (*sibling).red = (*(*node).parent).red;
                    (*(*node).parent).red = false;
                    (*(*sibling).left).red = false;
                    self.rotate_right((*node).parent);
                    node = self.root.left;
                }
            }
        }

        (*node).red = false;
        debug_assert!(!self.null.red);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Entry {
        node: RbNode,
        key: i32,
    }

    fn compare_entries(_: &RbTree, a: *const RbNode, b: *const RbNode) -> Ordering {
        unsafe { (*a.cast::<Entry>()).key.cmp(&(*b.cast::<Entry>()).key) }
    }

    fn key_of(node: *mut RbNode) -> i32 {
        unsafe { (*node.cast::<Entry>()).key }
    }

    fn new_tree(flags: u32) -> Box<RbTree> {
        let mut tree = Box::new(RbTree::new(flags, compare_entries));
        unsafe { tree.init(flags, compare_entries) };
        tree
    }

    fn entries(keys: &[i32]) -> Vec<Box<Entry>> {
        keys.iter().map(|&key| Box::new(Entry { node: RbNode::new(), key })).collect()
    }

    fn search_key(key: i32) -> Entry {
        Entry { node: RbNode::new(), key }
    }

    fn in_order(tree: &RbTree) -> Vec<i32> {
        let mut keys = Vec::new();
        tree.iterate(|node, _| keys.push(key_of(node)));
        keys
    }

    #[test]
    fn insert_keeps_invariants_after_every_step() {
        let keys = [50, 25, 75, 10, 30, 60, 80, 5, 15, 35, 90, 85, 95];
        let mut tree = new_tree(0);
        let mut nodes = entries(&keys);

        for entry in nodes.iter_mut() {
            unsafe { tree.insert(&mut entry.node).unwrap() };
            assert_eq!(tree.validate(), Ok(()));
        }

        let mut sorted = keys.to_vec();
        sorted.sort();
        assert_eq!(in_order(&tree), sorted);
    }

    #[test]
    fn black_height_is_uniform() {
        let keys = [50, 25, 75, 10, 30, 60, 80, 5, 15, 35, 90, 85, 95];
        let mut tree = new_tree(0);
        let mut nodes = entries(&keys);

        for entry in nodes.iter_mut() {
            unsafe { tree.insert(&mut entry.node).unwrap() };

            // count black nodes down to every leaf by hand
            let mut heights = Vec::new();
            let null = tree.null_ptr();
            let mut stack = vec![(tree.root.left, 0usize)];
            while let Some((node, blacks)) = stack.pop() {
                if node == null {
                    heights.push(blacks);
                    continue;
                }
                unsafe {
                    let blacks = blacks + !(*node).red as usize;
                    if (*node).red {
                        assert!(!(*(*node).left).red && !(*(*node).right).red);
                    }
                    stack.push(((*node).left, blacks));
                    stack.push(((*node).right, blacks));
                }
            }
            assert!(heights.windows(2).all(|w| w[0] == w[1]));
            unsafe { assert!(!(*tree.root.left).red) };
        }
    }

    #[test]
    fn search_and_closest() {
        let mut tree = new_tree(0);
        let mut nodes = entries(&[10, 20, 30, 40, 50]);
        for entry in nodes.iter_mut() {
            unsafe { tree.insert(&mut entry.node).unwrap() };
        }

        assert_eq!(tree.search(&search_key(30).node).map(key_of), Some(30));
        assert_eq!(tree.search(&search_key(35).node), None);

        assert_eq!(tree.search_closest(&search_key(35).node, true).map(key_of), Some(40));
        assert_eq!(tree.search_closest(&search_key(35).node, false).map(key_of), Some(30));
        assert_eq!(tree.search_closest(&search_key(40).node, false).map(key_of), Some(40));
        assert_eq!(tree.search_closest(&search_key(55).node, true), None);
        assert_eq!(tree.search_closest(&search_key(5).node, false), None);

        assert_eq!(tree.lowest().map(key_of), Some(10));
        assert_eq!(tree.highest().map(key_of), Some(50));
    }

    #[test]
    fn next_walks_both_directions() {
        let mut tree = new_tree(0);
        let mut nodes = entries(&[3, 1, 4, 1, 5, 9, 2, 6]);
        for entry in nodes.iter_mut() {
            unsafe { tree.insert(&mut entry.node).unwrap() };
        }

        let mut ascending = Vec::new();
        let mut cursor = None;
        while let Some(node) = unsafe { tree.next(false, cursor) } {
            ascending.push(key_of(node));
            cursor = Some(node);
        }
        assert_eq!(ascending, vec![1, 1, 2, 3, 4, 5, 6, 9]);

        let mut descending = Vec::new();
        let mut cursor = None;
        while let Some(node) = unsafe { tree.next(true, cursor) } {
            descending.push(key_of(node));
            cursor = Some(node);
        }
        assert_eq!(descending, vec![9, 6, 5, 4, 3, 2, 1, 1]);
    }

    #[test]
    fn iterate_reports_depth() {
        let mut tree = new_tree(0);
        let mut nodes = entries(&[2, 1, 3]);
        for entry in nodes.iter_mut() {
            unsafe { tree.insert(&mut entry.node).unwrap() };
        }

        let mut seen = Vec::new();
        tree.iterate(|node, depth| seen.push((key_of(node), depth)));
        assert_eq!(seen, vec![(1, 1), (2, 0), (3, 1)]);

        let empty = new_tree(0);
        let mut count = 0;
        empty.iterate(|_, _| count += 1);
        assert_eq!(count, 0);
        assert!(empty.is_empty());
    }

    #[test]
    fn random_insert_remove() {
        let rng = fastrand::Rng::with_seed(0x5eed);
        let mut tree = new_tree(PERIODIC_VALIDATION);
        let mut nodes = entries(&(0..500).map(|_| rng.i32(0..200)).collect::<Vec<_>>());

        for entry in nodes.iter_mut() {
            unsafe { tree.insert(&mut entry.node).unwrap() };
        }
        assert_eq!(tree.validate(), Ok(()));

        let mut live: Vec<usize> = (0..nodes.len()).collect();
        rng.shuffle(&mut live);

        for (i, &index) in live.iter().enumerate() {
            unsafe { tree.remove(&mut nodes[index].node).unwrap() };

            if i % 17 == 0 {
                assert_eq!(tree.validate(), Ok(()));
                let keys = in_order(&tree);
                assert!(keys.windows(2).all(|w| w[0] <= w[1]));
                assert_eq!(keys.len(), nodes.len() - i - 1);
            }
        }

        assert!(tree.is_empty());
        assert_eq!(tree.lowest(), None);
    }

    #[test]
    fn validate_detects_red_red() {
        let mut tree = new_tree(0);
        let mut nodes = entries(&[2, 1, 3, 4]);
        for entry in nodes.iter_mut() {
            unsafe { tree.insert(&mut entry.node).unwrap() };
        }

        // 4 hangs red under black 3; painting 3 red breaks the tree
        nodes[2].node.red = true;
        assert_eq!(tree.validate(), Err(TreeViolation::RedRed));
    }
}
