//! Chain ancestry used to decide which peers can serve which headers.

use alloy_primitives::B256;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Source of the node's initial-block-download state.
pub trait IbdStatus: Send + Sync {
    /// Returns true while the node is in bulk historical sync.
    fn is_initial_block_download(&self) -> bool;
}

impl IbdStatus for AtomicBool {
    fn is_initial_block_download(&self) -> bool {
        self.load(Ordering::Relaxed)
    }
}

/// A header linked to its parent, with a skip pointer for fast ancestor lookup.
///
/// Peers announce tips as `ChainedHeader`s; a peer claims a header iff the header
/// is an ancestor-or-self of its tip.
#[derive(Debug)]
pub struct ChainedHeader {
    hash: B256,
    height: u64,
    prev: Option<Arc<ChainedHeader>>,
    skip: Option<Arc<ChainedHeader>>,
}

impl ChainedHeader {
    /// Create the first header of a chain.
    pub fn genesis(hash: B256) -> Arc<Self> {
        Arc::new(Self {
            hash,
            height: 0,
            prev: None,
            skip: None,
        })
    }

    /// Create a child of `parent`.
    pub fn extend(parent: &Arc<Self>, hash: B256) -> Arc<Self> {
        let height = parent.height + 1;
        let skip = Self::ancestor(parent, skip_height(height));
        Arc::new(Self {
            hash,
            height,
            prev: Some(Arc::clone(parent)),
            skip,
        })
    }

    pub fn hash(&self) -> B256 {
        self.hash
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    /// Returns the ancestor of `this` at `height` (or `this` itself).
    pub fn ancestor(this: &Arc<Self>, height: u64) -> Option<Arc<Self>> {
        if height > this.height {
            return None;
        }
        let mut walk = this;
        let mut walk_height = this.height;
        while walk_height > height {
            let skip = skip_height(walk_height);
            let skip_prev = skip_height(walk_height - 1);
            let take_skip = match walk.skip.as_ref() {
                Some(_) => {
                    skip == height
                        || (skip > height
                            && !(skip_prev + 2 < skip && skip_prev >= height))
                }
                None => false,
            };
            let next = if take_skip { walk.skip.as_ref() } else { walk.prev.as_ref() };
            match next {
                Some(next) => {
                    walk = next;
                    walk_height = walk.height;
                }
                None => return None,
            }
        }
        Some(Arc::clone(walk))
    }

    /// Returns true if `header` is on the chain ending at `this`.
    pub fn contains(this: &Arc<Self>, header: &ChainedHeader) -> bool {
        Self::ancestor(this, header.height)
            .map(|ancestor| ancestor.hash == header.hash)
            .unwrap_or(false)
    }

    /// Returns the highest header shared by both chains.
    pub fn find_fork(this: &Arc<Self>, other: &Arc<Self>) -> Option<Arc<Self>> {
        let height = this.height.min(other.height);
        let mut left = Self::ancestor(this, height)?;
        let mut right = Self::ancestor(other, height)?;
        while left.hash != right.hash {
            let (Some(l), Some(r)) = (left.prev.clone(), right.prev.clone()) else {
                return None;
            };
            left = l;
            right = r;
        }
        Some(left)
    }
}

impl Drop for ChainedHeader {
    // Unlink iteratively so dropping a long chain does not recurse once per header.
    fn drop(&mut self) {
        drop(self.skip.take());
        let mut prev = self.prev.take();
        while let Some(node) = prev {
            match Arc::try_unwrap(node) {
                Ok(mut inner) => {
                    drop(inner.skip.take());
                    prev = inner.prev.take();
                }
                Err(_) => break,
            }
        }
    }
}

fn invert_lowest_one(n: u64) -> u64 {
    n & n.wrapping_sub(1)
}

fn skip_height(height: u64) -> u64 {
    if height < 2 {
        return 0;
    }
    if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}
