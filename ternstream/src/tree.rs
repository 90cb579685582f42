//! Ordinal-keyed red-black tree for buffering out-of-order segments.
//!
//! Nodes live in an arena (`Vec`) and link to each other by index; slot 0 is
//! the shared black NIL sentinel, as in the CLRS formulation, which lets the
//! delete fix-up walk through a NIL child's parent pointer. Removed slots go
//! on a free list and are reused by later inserts.
//!
//! Keys are ordered with [`Ordinal::compare`]. That relation is only
//! transitive over keys that fit in one half-window, so callers must reject
//! ordinals outside the receive window before inserting. The smallest node
//! is cached so `first` is O(1).

use std::cmp::Ordering;
use std::ops::ControlFlow;

use crate::ordinal::Ordinal;

const NIL: usize = 0;

#[derive(Debug)]
struct Node<T> {
    key: Ordinal,
    value: Option<T>,
    parent: usize,
    left: usize,
    right: usize,
    red: bool,
}

impl<T> Node<T> {
    fn sentinel() -> Self {
        Self {
            key: Ordinal::default(),
            value: None,
            parent: NIL,
            left: NIL,
            right: NIL,
            red: false,
        }
    }
}

/// A balanced index of values keyed by window-relative [`Ordinal`].
#[derive(Debug)]
pub struct Tree<T> {
    nodes: Vec<Node<T>>,
    free: Vec<usize>,
    root: usize,
    first: usize,
    len: usize,
}

impl<T> Tree<T> {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::sentinel()],
            free: Vec::new(),
            root: NIL,
            first: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.root == NIL
    }

    /// The node with the earliest ordinal.
    pub fn first(&self) -> Option<(Ordinal, &T)> {
        if self.first == NIL {
            return None;
        }
        let node = &self.nodes[self.first];
        node.value.as_ref().map(|v| (node.key, v))
    }

    pub fn contains(&self, key: Ordinal) -> bool {
        self.find(key) != NIL
    }

    pub fn try_get(&self, key: Ordinal) -> Option<&T> {
        match self.find(key) {
            NIL => None,
            n => self.nodes[n].value.as_ref(),
        }
    }

    pub fn try_get_mut(&mut self, key: Ordinal) -> Option<&mut T> {
        match self.find(key) {
            NIL => None,
            n => self.nodes[n].value.as_mut(),
        }
    }

    /// Insert `value` under `key`. If the key is already present nothing
    /// changes and the value is handed back.
    pub fn try_add(&mut self, key: Ordinal, value: T) -> Result<(), T> {
        if self.find(key) != NIL {
            return Err(value);
        }
        self.insert(key, value);
        Ok(())
    }

    /// Return the value under `key`, building and inserting it with
    /// `allocate` if absent. The flag is `true` when a node was inserted.
    pub fn try_add_or_get<F>(&mut self, key: Ordinal, allocate: F) -> (bool, &mut T)
    where
        F: FnOnce() -> T,
    {
        let (added, n) = match self.find(key) {
            NIL => (true, self.insert(key, allocate())),
            n => (false, n),
        };
        let value = self.nodes[n]
            .value
            .as_mut()
            .unwrap_or_else(|| unreachable!("live tree node without a value"));
        (added, value)
    }

    pub fn try_remove(&mut self, key: Ordinal) -> Option<T> {
        match self.find(key) {
            NIL => None,
            n => Some(self.delete(n)),
        }
    }

    /// Remove every node strictly before `cutoff`, handing each to `dispose`
    /// in ascending order. Returns the number removed.
    pub fn remove_and_dispose_before<F>(&mut self, cutoff: Ordinal, mut dispose: F) -> usize
    where
        F: FnMut(Ordinal, T),
    {
        let mut removed = 0;
        while self.first != NIL && self.nodes[self.first].key.is_before(cutoff) {
            let key = self.nodes[self.first].key;
            let value = self.delete(self.first);
            dispose(key, value);
            removed += 1;
        }
        removed
    }

    /// Remove everything, handing each node to `dispose` in ascending order.
    pub fn remove_and_dispose_all<F>(&mut self, mut dispose: F)
    where
        F: FnMut(Ordinal, T),
    {
        let mut pending = Vec::with_capacity(self.len);
        self.traverse(|key, _| {
            pending.push(key);
            ControlFlow::Continue(())
        });
        for key in pending {
            if let Some(value) = self.try_remove(key) {
                dispose(key, value);
            }
        }
        debug_assert!(self.is_empty());
        self.nodes.truncate(1);
        self.free.clear();
    }

    /// Visit nodes in ascending order until `visitor` breaks.
    pub fn traverse<F>(&self, mut visitor: F)
    where
        F: FnMut(Ordinal, &T) -> ControlFlow<()>,
    {
        let mut stack = Vec::new();
        let mut n = self.root;
        loop {
            while n != NIL {
                stack.push(n);
                n = self.nodes[n].left;
            }
            let Some(top) = stack.pop() else {
                return;
            };
            let node = &self.nodes[top];
            if let Some(value) = node.value.as_ref() {
                if visitor(node.key, value).is_break() {
                    return;
                }
            }
            n = node.right;
        }
    }

    fn find(&self, key: Ordinal) -> usize {
        let mut n = self.root;
        while n != NIL {
            let node = &self.nodes[n];
            match key.compare(node.key) {
                Ordering::Less => n = node.left,
                Ordering::Greater => n = node.right,
                Ordering::Equal => return n,
            }
        }
        NIL
    }

    fn minimum(&self, mut n: usize) -> usize {
        while self.nodes[n].left != NIL {
            n = self.nodes[n].left;
        }
        n
    }

    fn alloc(&mut self, key: Ordinal, value: T, parent: usize) -> usize {
        let node = Node {
            key,
            value: Some(value),
            parent,
            left: NIL,
            right: NIL,
            red: true,
        };
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn insert(&mut self, key: Ordinal, value: T) -> usize {
        let mut parent = NIL;
        let mut n = self.root;
        while n != NIL {
            parent = n;
            n = if key.is_before(self.nodes[n].key) {
                self.nodes[n].left
            } else {
                self.nodes[n].right
            };
        }

        let z = self.alloc(key, value, parent);
        if parent == NIL {
            self.root = z;
        } else if key.is_before(self.nodes[parent].key) {
            self.nodes[parent].left = z;
        } else {
            self.nodes[parent].right = z;
        }
        self.insert_fixup(z);

        if self.first == NIL || key.is_before(self.nodes[self.first].key) {
            self.first = z;
        }
        self.len += 1;
        z
    }

    fn insert_fixup(&mut self, mut z: usize) {
        while self.nodes[self.nodes[z].parent].red {
            let zp = self.nodes[z].parent;
            let zpp = self.nodes[zp].parent;
            if zp == self.nodes[zpp].left {
                let uncle = self.nodes[zpp].right;
                if self.nodes[uncle].red {
                    self.nodes[zp].red = false;
                    self.nodes[uncle].red = false;
                    self.nodes[zpp].red = true;
                    z = zpp;
                } else {
                    if z == self.nodes[zp].right {
                        z = zp;
                        self.rotate_left(z);
                    }
                    let zp = self.nodes[z].parent;
                    let zpp = self.nodes[zp].parent;
                    self.nodes[zp].red = false;
                    self.nodes[zpp].red = true;
                    self.rotate_right(zpp);
                }
            } else {
                let uncle = self.nodes[zpp].left;
                if self.nodes[uncle].red {
                    self.nodes[zp].red = false;
                    self.nodes[uncle].red = false;
                    self.nodes[zpp].red = true;
                    z = zpp;
                } else {
                    if z == self.nodes[zp].left {
                        z = zp;
                        self.rotate_right(z);
                    }
                    let zp = self.nodes[z].parent;
                    let zpp = self.nodes[zp].parent;
                    self.nodes[zp].red = false;
                    self.nodes[zpp].red = true;
                    self.rotate_left(zpp);
                }
            }
        }
        let root = self.root;
        self.nodes[root].red = false;
    }

    fn delete(&mut self, z: usize) -> T {
        let mut y_red = self.nodes[z].red;
        let x;
        if self.nodes[z].left == NIL {
            x = self.nodes[z].right;
            self.transplant(z, x);
        } else if self.nodes[z].right == NIL {
            x = self.nodes[z].left;
            self.transplant(z, x);
        } else {
            let y = self.minimum(self.nodes[z].right);
            y_red = self.nodes[y].red;
            x = self.nodes[y].right;
            if self.nodes[y].parent == z {
                self.nodes[x].parent = y;
            } else {
                self.transplant(y, x);
                let zr = self.nodes[z].right;
                self.nodes[y].right = zr;
                self.nodes[zr].parent = y;
            }
            self.transplant(z, y);
            let zl = self.nodes[z].left;
            self.nodes[y].left = zl;
            self.nodes[zl].parent = y;
            self.nodes[y].red = self.nodes[z].red;
        }
        if !y_red {
            self.delete_fixup(x);
        }
        self.nodes[NIL].parent = NIL;
        self.nodes[NIL].red = false;

        if self.first == z {
            self.first = if self.root == NIL {
                NIL
            } else {
                self.minimum(self.root)
            };
        }
        self.len -= 1;
        self.free.push(z);

        let node = &mut self.nodes[z];
        node.parent = NIL;
        node.left = NIL;
        node.right = NIL;
        node.value
            .take()
            .unwrap_or_else(|| unreachable!("live tree node without a value"))
    }

    fn delete_fixup(&mut self, mut x: usize) {
        while x != self.root && !self.nodes[x].red {
            let xp = self.nodes[x].parent;
            if x == self.nodes[xp].left {
                let mut w = self.nodes[xp].right;
                if self.nodes[w].red {
                    self.nodes[w].red = false;
                    self.nodes[xp].red = true;
                    self.rotate_left(xp);
                    w = self.nodes[xp].right;
                }
                let (wl, wr) = (self.nodes[w].left, self.nodes[w].right);
                if !self.nodes[wl].red && !self.nodes[wr].red {
                    self.nodes[w].red = true;
                    x = xp;
                } else {
                    if !self.nodes[wr].red {
                        self.nodes[wl].red = false;
                        self.nodes[w].red = true;
                        self.rotate_right(w);
                        w = self.nodes[xp].right;
                    }
                    self.nodes[w].red = self.nodes[xp].red;
                    self.nodes[xp].red = false;
                    let wr = self.nodes[w].right;
                    self.nodes[wr].red = false;
                    self.rotate_left(xp);
                    x = self.root;
                }
            } else {
                let mut w = self.nodes[xp].left;
                if self.nodes[w].red {
                    self.nodes[w].red = false;
                    self.nodes[xp].red = true;
                    self.rotate_right(xp);
                    w = self.nodes[xp].left;
                }
                let (wl, wr) = (self.nodes[w].left, self.nodes[w].right);
                if !self.nodes[wl].red && !self.nodes[wr].red {
                    self.nodes[w].red = true;
                    x = xp;
                } else {
                    if !self.nodes[wl].red {
                        self.nodes[wr].red = false;
                        self.nodes[w].red = true;
                        self.rotate_left(w);
                        w = self.nodes[xp].left;
                    }
                    self.nodes[w].red = self.nodes[xp].red;
                    self.nodes[xp].red = false;
                    let wl = self.nodes[w].left;
                    self.nodes[wl].red = false;
                    self.rotate_right(xp);
                    x = self.root;
                }
            }
        }
        self.nodes[x].red = false;
    }

    fn transplant(&mut self, u: usize, v: usize) {
        let up = self.nodes[u].parent;
        if up == NIL {
            self.root = v;
        } else if u == self.nodes[up].left {
            self.nodes[up].left = v;
        } else {
            self.nodes[up].right = v;
        }
        self.nodes[v].parent = up;
    }

    fn rotate_left(&mut self, x: usize) {
        let y = self.nodes[x].right;
        let yl = self.nodes[y].left;
        self.nodes[x].right = yl;
        if yl != NIL {
            self.nodes[yl].parent = x;
        }
        let xp = self.nodes[x].parent;
        self.nodes[y].parent = xp;
        if xp == NIL {
            self.root = y;
        } else if x == self.nodes[xp].left {
            self.nodes[xp].left = y;
        } else {
            self.nodes[xp].right = y;
        }
        self.nodes[y].left = x;
        self.nodes[x].parent = y;
    }

    fn rotate_right(&mut self, x: usize) {
        let y = self.nodes[x].left;
        let yr = self.nodes[y].right;
        self.nodes[x].left = yr;
        if yr != NIL {
            self.nodes[yr].parent = x;
        }
        let xp = self.nodes[x].parent;
        self.nodes[y].parent = xp;
        if xp == NIL {
            self.root = y;
        } else if x == self.nodes[xp].right {
            self.nodes[xp].right = y;
        } else {
            self.nodes[xp].left = y;
        }
        self.nodes[y].right = x;
        self.nodes[x].parent = y;
    }
}

impl<T> Default for Tree<T> {
    fn default() -> Self {
        Self::new()
    }
}
