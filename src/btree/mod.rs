//! # B+Tree
//!
//! Ordered in-memory index over composite typed keys. Trees are bulk-loaded
//! once at warm-up and never mutated afterwards; all reads are lock-free.
//! Values live only in leaves, each leaf entry holding the rows that share
//! one key tuple (non-unique indexes map one tuple to many rows).
//!
//! Composite keys compare lexicographically with the typed comparators of
//! [`Value`]. Range scans accept *partial* bounds: a bound with fewer
//! components than the key tuple compares over its own length only, which
//! is how prefix scans (leading equalities plus a range on the next column)
//! are expressed.

use crate::value::{Record, Value};
use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::Arc;

/// Maximum entries per leaf and children per internal node
const TREE_ORDER: usize = 32;

/// Lexicographic comparison over the shorter of the two tuples
fn partial_key_cmp(key: &[Value], bound: &[Value]) -> Ordering {
    for (a, b) in key.iter().zip(bound.iter()) {
        let ord = a.total_cmp(b);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Full lexicographic comparison (shorter tuples sort first)
fn full_key_cmp(a: &[Value], b: &[Value]) -> Ordering {
    partial_key_cmp(a, b).then(a.len().cmp(&b.len()))
}

fn above_lower(key: &[Value], lower: &Bound<&[Value]>) -> bool {
    match lower {
        Bound::Unbounded => true,
        Bound::Included(bound) => partial_key_cmp(key, bound) != Ordering::Less,
        Bound::Excluded(bound) => partial_key_cmp(key, bound) == Ordering::Greater,
    }
}

fn below_upper(key: &[Value], upper: &Bound<&[Value]>) -> bool {
    match upper {
        Bound::Unbounded => true,
        Bound::Included(bound) => partial_key_cmp(key, bound) != Ordering::Greater,
        Bound::Excluded(bound) => partial_key_cmp(key, bound) == Ordering::Less,
    }
}

#[derive(Debug)]
enum Node {
    Internal {
        // separators[i] is the first key of children[i + 1]
        separators: Vec<Vec<Value>>,
        children: Vec<Node>,
    },
    Leaf {
        entries: Vec<(Vec<Value>, Vec<Arc<Record>>)>,
    },
}

/// Immutable B+Tree over composite keys
#[derive(Debug)]
pub struct BPlusTree {
    root: Node,
    entry_count: usize,
    row_count: usize,
}

impl BPlusTree {
    /// Bulk-load a tree from unsorted `(key tuple, row)` pairs. Rows with
    /// equal tuples are grouped under one entry, preserving their relative
    /// input order.
    pub fn build(mut pairs: Vec<(Vec<Value>, Arc<Record>)>) -> Self {
        pairs.sort_by(|a, b| full_key_cmp(&a.0, &b.0));
        let row_count = pairs.len();

        let mut entries: Vec<(Vec<Value>, Vec<Arc<Record>>)> = Vec::new();
        for (key, row) in pairs {
            match entries.last_mut() {
                Some((last_key, rows)) if full_key_cmp(last_key, &key) == Ordering::Equal => {
                    rows.push(row);
                }
                _ => entries.push((key, vec![row])),
            }
        }
        let entry_count = entries.len();

        if entries.is_empty() {
            return Self {
                root: Node::Leaf {
                    entries: Vec::new(),
                },
                entry_count: 0,
                row_count: 0,
            };
        }

        // Leaf level.
        let mut level: Vec<Node> = Vec::with_capacity(entries.len() / TREE_ORDER + 1);
        let mut chunk: Vec<(Vec<Value>, Vec<Arc<Record>>)> = Vec::with_capacity(TREE_ORDER);
        for entry in entries {
            chunk.push(entry);
            if chunk.len() == TREE_ORDER {
                level.push(Node::Leaf {
                    entries: std::mem::take(&mut chunk),
                });
            }
        }
        if !chunk.is_empty() {
            level.push(Node::Leaf { entries: chunk });
        }

        // Internal levels until a single root remains.
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len() / TREE_ORDER + 1);
            let mut group: Vec<Node> = Vec::with_capacity(TREE_ORDER);
            let mut iter = level.into_iter().peekable();
            while let Some(node) = iter.next() {
                group.push(node);
                if group.len() == TREE_ORDER || iter.peek().is_none() {
                    let separators = group[1..]
                        .iter()
                        .map(|child| first_key(child).to_vec())
                        .collect();
                    next.push(Node::Internal {
                        separators,
                        children: std::mem::take(&mut group),
                    });
                }
            }
            level = next;
        }

        Self {
            root: level.into_iter().next().expect("non-empty level"),
            entry_count,
            row_count,
        }
    }

    /// Number of distinct key tuples
    pub fn len(&self) -> usize {
        self.entry_count
    }

    /// Whether the tree holds no entries
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Number of rows across all entries
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Rows stored under an exact key tuple
    pub fn get(&self, key: &[Value]) -> &[Arc<Record>] {
        let mut node = &self.root;
        loop {
            match node {
                Node::Internal {
                    separators,
                    children,
                } => {
                    let child = separators
                        .partition_point(|sep| partial_key_cmp(sep, key) != Ordering::Greater);
                    node = &children[child];
                }
                Node::Leaf { entries } => {
                    return entries
                        .binary_search_by(|(entry_key, _)| partial_key_cmp(entry_key, key))
                        .map(|i| entries[i].1.as_slice())
                        .unwrap_or(&[]);
                }
            }
        }
    }

    /// Rows whose key tuples fall between the partial bounds, in key order
    pub fn range(&self, lower: Bound<&[Value]>, upper: Bound<&[Value]>) -> Vec<Arc<Record>> {
        let mut out = Vec::new();
        collect_range(&self.root, &lower, &upper, &mut out);
        out
    }

    /// All rows in key order
    pub fn iter_all(&self) -> Vec<Arc<Record>> {
        self.range(Bound::Unbounded, Bound::Unbounded)
    }
}

fn first_key(node: &Node) -> &[Value] {
    match node {
        Node::Internal { children, .. } => first_key(&children[0]),
        Node::Leaf { entries } => &entries[0].0,
    }
}

fn collect_range(
    node: &Node,
    lower: &Bound<&[Value]>,
    upper: &Bound<&[Value]>,
    out: &mut Vec<Arc<Record>>,
) {
    match node {
        Node::Internal {
            separators,
            children,
        } => {
            for (i, child) in children.iter().enumerate() {
                // child i holds keys < separators[i] and >= separators[i-1];
                // skip subtrees wholly outside the bounds.
                if i < separators.len() {
                    // A separator that partial-equals an inclusive bound can
                    // still guard prefix-equal keys, so only strictly-lesser
                    // subtrees are skipped.
                    let child_max_exclusive = &separators[i];
                    let below_lower = match lower {
                        Bound::Unbounded => false,
                        Bound::Included(bound) => {
                            partial_key_cmp(child_max_exclusive, bound) == Ordering::Less
                        }
                        Bound::Excluded(bound) => {
                            partial_key_cmp(child_max_exclusive, bound) != Ordering::Greater
                        }
                    };
                    if below_lower {
                        continue;
                    }
                }
                if i > 0 {
                    let child_min = &separators[i - 1];
                    if !below_upper(child_min, upper) {
                        break;
                    }
                }
                collect_range(child, lower, upper, out);
            }
        }
        Node::Leaf { entries } => {
            for (key, rows) in entries {
                if !above_lower(key, lower) {
                    continue;
                }
                if !below_upper(key, upper) {
                    break;
                }
                out.extend(rows.iter().cloned());
            }
        }
    }
}
