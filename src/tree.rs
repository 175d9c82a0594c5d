//! Hierarchical class tree, as seen by the softmax layer
//!
//! Only the group layout matters here: each internal node's children form
//! one contiguous group of scores and the groups are laid end to end.
//! Building the tree (names, parents, leaves) happens elsewhere.

use anyhow::{Result, bail};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SoftmaxTree {
    group_size: Vec<usize>,
}

impl SoftmaxTree {
    pub fn new(group_size: Vec<usize>) -> Result<Self> {
        if group_size.is_empty() {
            bail!("softmax tree must have at least one group");
        }
        if let Some(i) = group_size.iter().position(|&s| s == 0) {
            bail!("softmax tree group {} is empty", i);
        }
        Ok(Self { group_size })
    }

    pub fn groups(&self) -> usize {
        self.group_size.len()
    }

    pub fn group_sizes(&self) -> &[usize] {
        &self.group_size
    }

    /// Sum of all group sizes; must equal the layer's `inputs`.
    pub fn total(&self) -> usize {
        self.group_size.iter().sum()
    }

    /// `(offset, size)` for every group in order.
    pub fn group_offsets(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.group_size.iter().scan(0usize, |count, &size| {
            let offset = *count;
            *count += size;
            Some((offset, size))
        })
    }
}
