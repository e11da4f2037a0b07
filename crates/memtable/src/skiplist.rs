//! Ordered byte-key map backed by a skip list.
//!
//! The probabilistic layering gives O(log n) expected lookups and inserts
//! while keeping level-0 a plain sorted linked list, which is exactly what
//! the flush path wants: an in-order walk with no extra sorting step.
//!
//! Nodes live in an index-addressed arena rather than behind raw pointers;
//! a tower entry is `Option<usize>` into the arena. Slots freed by deletes
//! are recycled by later inserts.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;

/// Tallest tower a node can draw.
pub const MAX_HEIGHT: usize = 16;
/// Probability of promoting a node one more level.
const P_VALUE: f64 = 0.5;

struct Node {
    key: Vec<u8>,
    value: Vec<u8>,
    /// Forward pointers, one per level this node participates in.
    tower: Vec<Option<usize>>,
}

/// A skip list mapping byte keys to byte values, sorted lexicographically.
///
/// Keys and values are stored as owned copies; callers may reuse their
/// buffers after a call returns. Duplicate-key inserts replace the value in
/// place.
pub struct SkipList {
    nodes: Vec<Node>,
    /// Arena slots vacated by deletions, reused before growing the arena.
    free: Vec<usize>,
    /// Head towers: entry points per level, no sentinel node needed.
    head: [Option<usize>; MAX_HEIGHT],
    height: usize,
    len: usize,
    rng: SmallRng,
}

impl SkipList {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: [None; MAX_HEIGHT],
            height: 1,
            len: 0,
            rng: SmallRng::from_entropy(),
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Draws a tower height from the geometric distribution with p = 0.5.
    fn random_height(&mut self) -> usize {
        let mut height = 1;
        while height < MAX_HEIGHT && self.rng.gen_bool(P_VALUE) {
            height += 1;
        }
        height
    }

    /// Walks the list toward `key`, recording at each level the last slot
    /// whose key is strictly less than `key` (`None` means the head).
    ///
    /// Returns the matching slot, if any, plus the journey taken — the
    /// journey is what insert and delete splice against.
    fn search(&self, key: &[u8]) -> (Option<usize>, [Option<usize>; MAX_HEIGHT]) {
        let mut journey: [Option<usize>; MAX_HEIGHT] = [None; MAX_HEIGHT];
        let mut prev: Option<usize> = None;
        let mut candidate: Option<usize> = None;

        for level in (0..self.height).rev() {
            let mut next = match prev {
                Some(p) => self.nodes[p].tower[level],
                None => self.head[level],
            };
            while let Some(n) = next {
                match self.nodes[n].key.as_slice().cmp(key) {
                    Ordering::Less => {
                        prev = Some(n);
                        next = self.nodes[n].tower[level];
                    }
                    Ordering::Equal => {
                        candidate = Some(n);
                        break;
                    }
                    Ordering::Greater => break,
                }
            }
            journey[level] = prev;
        }

        (candidate, journey)
    }

    /// Returns the value stored under `key`, if present.
    #[must_use]
    pub fn find(&self, key: &[u8]) -> Option<&[u8]> {
        let (found, _) = self.search(key);
        found.map(|n| self.nodes[n].value.as_slice())
    }

    /// Inserts `key` -> `value`, replacing the value in place when the key
    /// already exists.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) {
        let (found, journey) = self.search(key);

        if let Some(n) = found {
            self.nodes[n].value = value.to_vec();
            return;
        }

        let height = self.random_height();
        let node = Node {
            key: key.to_vec(),
            value: value.to_vec(),
            tower: vec![None; height],
        };

        let slot = match self.free.pop() {
            Some(s) => {
                self.nodes[s] = node;
                s
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };

        for level in 0..height {
            // Levels above the current height splice directly off the head.
            let next = if level < self.height {
                match journey[level] {
                    Some(p) => self.nodes[p].tower[level],
                    None => self.head[level],
                }
            } else {
                None
            };
            self.nodes[slot].tower[level] = next;
            match journey[level] {
                Some(p) if level < self.height => self.nodes[p].tower[level] = Some(slot),
                _ => self.head[level] = Some(slot),
            }
        }

        if height > self.height {
            self.height = height;
        }
        self.len += 1;
    }

    /// Removes `key`, unlinking its node at every level it appears on.
    /// Returns `true` when an entry was removed.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        let (found, journey) = self.search(key);
        let slot = match found {
            Some(s) => s,
            None => return false,
        };

        let node_height = self.nodes[slot].tower.len();
        for level in 0..node_height {
            let next = self.nodes[slot].tower[level];
            match journey[level] {
                Some(p) => {
                    if self.nodes[p].tower[level] == Some(slot) {
                        self.nodes[p].tower[level] = next;
                    }
                }
                None => {
                    if self.head[level] == Some(slot) {
                        self.head[level] = next;
                    }
                }
            }
        }

        self.nodes[slot].key.clear();
        self.nodes[slot].value.clear();
        self.nodes[slot].tower.clear();
        self.free.push(slot);
        self.len -= 1;
        self.shrink();
        true
    }

    /// Drops empty top levels after a deletion.
    fn shrink(&mut self) {
        while self.height > 1 && self.head[self.height - 1].is_none() {
            self.height -= 1;
        }
    }

    /// Iterates entries in ascending key order by walking level 0.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            current: self.head[0],
        }
    }
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SkipList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkipList")
            .field("len", &self.len)
            .field("height", &self.height)
            .finish()
    }
}

/// In-order iterator over `(key, value)` pairs.
pub struct Iter<'a> {
    list: &'a SkipList,
    current: Option<usize>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.current?;
        let node = &self.list.nodes[slot];
        self.current = node.tower[0];
        Some((node.key.as_slice(), node.value.as_slice()))
    }
}
