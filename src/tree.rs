//! Grouping table rows into a tree by the values of some columns.
//!
//! With grouping keys `[imagetyp, filter]`, the first level of the tree is
//! keyed by image type, the second by filter, and each leaf holds the index
//! values (usually file names) of the rows in that group. Walking the tree
//! looks a lot like walking a directory hierarchy, which is exactly what the
//! sorter does with it.
//!
//! A row without a value in one of the grouping columns is grouped with the
//! other such rows under a `None` key, so every row lands in exactly one
//! leaf.

use std::collections::HashSet;

use crate::{
    error::{Error, Result},
    table::MetadataTable,
    value::Value,
};

#[derive(Clone, Debug, PartialEq)]
pub enum TreeNode {
    /// Index values of the rows in one group, in table order.
    Leaf(Vec<Value>),

    /// Children keyed by the value of the next grouping key, in the order
    /// they were first seen. `None` collects the rows lacking a value.
    Branch(Vec<(Option<Value>, TreeNode)>),
}

impl TreeNode {
    fn empty(depth: usize) -> Self {
        if depth == 0 {
            TreeNode::Leaf(Vec::new())
        } else {
            TreeNode::Branch(Vec::new())
        }
    }

    /// Append `id` at the end of `path`, creating nodes as needed. `path`
    /// must be exactly as long as the tree is deep.
    fn insert(&mut self, path: &[Option<Value>], id: Value) {
        match self {
            TreeNode::Leaf(ids) => ids.push(id),

            TreeNode::Branch(children) => {
                let (first, rest) = match path.split_first() {
                    Some(x) => x,
                    None => return,
                };

                let i = match children.iter().position(|(k, _)| k == first) {
                    Some(i) => i,
                    None => {
                        children.push((first.clone(), TreeNode::empty(rest.len())));
                        children.len() - 1
                    }
                };

                children[i].1.insert(rest, id);
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct GroupingTree {
    keys: Vec<String>,
    index_key: String,
    root: TreeNode,
}

/// One stop on a [`GroupingTree::walk`].
#[derive(Clone, Debug, PartialEq)]
pub struct WalkStep<'a> {
    /// Grouping values leading from the root to this node.
    pub parents: Vec<Option<&'a Value>>,

    /// Values of the immediate children; empty at a leaf.
    pub children: Vec<Option<&'a Value>>,

    /// Index values of the rows in this group; empty except at a leaf.
    pub ids: &'a [Value],
}

/// Used to spot duplicate index values. Numbers are compared by value, so
/// `3` and `3.0` collide.
fn identity(v: &Value) -> String {
    match v {
        Value::Integer(_) | Value::Float(_) => format!("n:{:?}", v.as_f64().unwrap_or(f64::NAN)),
        other => format!("{:?}", other),
    }
}

impl GroupingTree {
    /// Group every row of the table.
    pub fn build<S: AsRef<str>>(table: &MetadataTable, keys: &[S], index_key: &str) -> Result<Self> {
        let rows: Vec<usize> = (0..table.n_rows()).collect();
        Self::build_rows(table, &rows, keys, index_key)
    }

    /// Group just the given rows, typically the result of a filter. Rows
    /// missing a grouping value go under a `None` key at that level.
    pub fn build_rows<S: AsRef<str>>(
        table: &MetadataTable,
        rows: &[usize],
        keys: &[S],
        index_key: &str,
    ) -> Result<Self> {
        Self::build_impl(table, rows, keys, index_key, false)
    }

    /// Like [`Self::build_rows`], but a missing grouping value is spelled out
    /// as the text `No <key>`.
    pub fn build_filled<S: AsRef<str>>(
        table: &MetadataTable,
        rows: &[usize],
        keys: &[S],
        index_key: &str,
    ) -> Result<Self> {
        Self::build_impl(table, rows, keys, index_key, true)
    }

    fn build_impl<S: AsRef<str>>(
        table: &MetadataTable,
        rows: &[usize],
        keys: &[S],
        index_key: &str,
        fill_missing: bool,
    ) -> Result<Self> {
        let mut group_columns = Vec::with_capacity(keys.len());

        for k in keys {
            let col = table
                .column(k.as_ref())
                .ok_or_else(|| Error::MissingColumn(k.as_ref().to_lowercase()))?;
            group_columns.push(col);
        }

        let index = table
            .column(index_key)
            .ok_or_else(|| Error::MissingColumn(index_key.to_lowercase()))?;

        // The index has to work as a primary key for the whole table, not
        // just the rows we're grouping. A row with no index value can't be
        // told apart, so it counts as a duplicate.
        let mut seen = HashSet::new();
        let mut ids = Vec::with_capacity(table.n_rows());

        for row in 0..table.n_rows() {
            let v = index.get(row).ok_or_else(|| Error::NonUniqueIndex {
                column: index.name().to_owned(),
                value: format!("<missing in row {}>", row),
            })?;

            if !seen.insert(identity(v)) {
                return Err(Error::NonUniqueIndex {
                    column: index.name().to_owned(),
                    value: v.to_string(),
                });
            }

            ids.push(v);
        }

        let mut root = TreeNode::empty(keys.len());
        let mut path = Vec::with_capacity(keys.len());

        for &row in rows {
            let Some(id) = ids.get(row) else { continue };
            path.clear();

            for col in &group_columns {
                path.push(match col.get(row) {
                    Some(v) => Some(v.clone()),
                    None if fill_missing => Some(Value::Text(format!("No {}", col.name()))),
                    None => None,
                });
            }

            root.insert(&path, (*id).clone());
        }

        Ok(GroupingTree {
            keys: group_columns.iter().map(|c| c.name().to_owned()).collect(),
            index_key: index.name().to_owned(),
            root,
        })
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn index_key(&self) -> &str {
        &self.index_key
    }

    pub fn root(&self) -> &TreeNode {
        &self.root
    }

    /// Depth-first, pre-order traversal. Each call starts over from the root.
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            stack: vec![(Vec::new(), &self.root)],
        }
    }
}

pub struct Walk<'a> {
    stack: Vec<(Vec<Option<&'a Value>>, &'a TreeNode)>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = WalkStep<'a>;

    fn next(&mut self) -> Option<WalkStep<'a>> {
        let (parents, node) = self.stack.pop()?;

        match node {
            TreeNode::Leaf(ids) => Some(WalkStep {
                parents,
                children: Vec::new(),
                ids,
            }),

            TreeNode::Branch(children) => {
                // Reversed so that the first child comes off the stack first.
                for (k, child) in children.iter().rev() {
                    let mut p = parents.clone();
                    p.push(k.as_ref());
                    self.stack.push((p, child));
                }

                Some(WalkStep {
                    parents,
                    children: children.iter().map(|(k, _)| k.as_ref()).collect(),
                    ids: &[],
                })
            }
        }
    }
}
